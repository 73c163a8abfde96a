use crate::error::{ExtensionError, ExtensionResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an installed extension is in its lifecycle.
///
/// Transitions only move forward. An unloaded extension has to be
/// unregistered and registered again to come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Registered,
    Initialized,
    Loaded,
    Unloaded,
}

/// A lifecycle method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleOp {
    Initialize,
    Load,
    Shutdown,
    /// Not a transition: emitting events or serving reads.
    Serve,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registered => "registered",
            Self::Initialized => "initialized",
            Self::Loaded => "loaded",
            Self::Unloaded => "unloaded",
        })
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initialize => "initialize",
            Self::Load => "load",
            Self::Shutdown => "shut down",
            Self::Serve => "serve requests from",
        })
    }
}

impl LifecycleState {
    /// Only loaded extensions may emit or receive events and serve reads.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Loaded)
    }

    /// Returns the state `op` leads to, or `None` when the call is a no-op.
    ///
    /// Shutting down a never-initialized or already-unloaded extension does
    /// nothing. Every other out-of-order call is an `IllegalState` error.
    pub fn next(&self, op: LifecycleOp, extension_id: &str) -> ExtensionResult<Option<Self>> {
        match (self, op) {
            (Self::Registered, LifecycleOp::Initialize) => Ok(Some(Self::Initialized)),
            (Self::Initialized, LifecycleOp::Load) => Ok(Some(Self::Loaded)),
            (Self::Initialized | Self::Loaded, LifecycleOp::Shutdown) => Ok(Some(Self::Unloaded)),
            (Self::Registered | Self::Unloaded, LifecycleOp::Shutdown) => Ok(None),
            (state, operation) => Err(ExtensionError::IllegalState {
                extension_id: extension_id.to_string(),
                state: *state,
                operation,
            }),
        }
    }
}
