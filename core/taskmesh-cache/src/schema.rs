use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Describes the shape a cache instance accepts, and its schema version.
///
/// Bumping `version` invalidates every entry written under an older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSchema {
    pub name: String,
    pub version: u32,
    /// When true the value must be an array and `fields` apply to each element.
    #[serde(default)]
    pub list: bool,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// A field checked on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// JSON pointer path (e.g., "/title", "/source/key").
    pub path: String,
    pub field_type: FieldType,
    /// Optional fields may be absent or `null`.
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    fn new(path: &str, field_type: FieldType, required: bool) -> Self {
        Self {
            path: path.into(),
            field_type,
            required,
        }
    }

    /// Shorthand for a required field.
    pub fn required(path: &str, field_type: FieldType) -> Self {
        Self::new(path, field_type, true)
    }

    /// Shorthand for an optional field.
    pub fn optional(path: &str, field_type: FieldType) -> Self {
        Self::new(path, field_type, false)
    }
}

/// The JSON type of a checked field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Bool,
    /// An RFC 3339 string.
    DateTime,
    Array,
    Object,
    Any,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::DateTime => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl CacheSchema {
    /// A schema that accepts any single value.
    pub fn any(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            list: false,
            fields: Vec::new(),
        }
    }

    /// A schema for an array whose elements carry `fields`.
    pub fn list_of(name: impl Into<String>, version: u32, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            version,
            list: true,
            fields,
        }
    }

    /// A schema for a single object carrying `fields`.
    pub fn object(name: impl Into<String>, version: u32, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            version,
            list: false,
            fields,
        }
    }

    /// Checks `value` against this schema. `Err` carries a human-readable reason.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if !self.list {
            return self.validate_item(value);
        }
        let items = value
            .as_array()
            .ok_or_else(|| format!("{}: expected array", self.name))?;
        for (index, item) in items.iter().enumerate() {
            self.validate_item(item)
                .map_err(|reason| format!("item {index}: {reason}"))?;
        }
        Ok(())
    }

    fn validate_item(&self, value: &Value) -> Result<(), String> {
        if self.fields.is_empty() {
            return Ok(());
        }
        if !value.is_object() {
            return Err(format!("{}: expected object", self.name));
        }
        for field in &self.fields {
            match value.pointer(&field.path) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field {}", field.path));
                }
                None | Some(Value::Null) => {}
                Some(found) if !field.field_type.matches(found) => {
                    return Err(format!(
                        "field {} expected {:?}, found {}",
                        field.path, field.field_type, found
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
