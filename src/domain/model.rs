use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// One machine of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub index: usize,
    pub external_addr: String,
    pub internal_addr: String,
}

impl Machine {
    pub fn generate_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "index": self.index,
            "external-addr": self.external_addr,
            "internal-addr": self.internal_addr,
        })
    }
}

/// Where and as whom to open an SSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_file: Option<PathBuf>,
}

/// The type an option value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Str,
    Int,
    Float,
}

impl ValueType {
    pub fn parse(name: &str) -> Option<Option<Self>> {
        match name {
            "bool" | "boolean" => Some(Some(ValueType::Bool)),
            "str" | "string" => Some(Some(ValueType::Str)),
            "int" | "integer" => Some(Some(ValueType::Int)),
            "float" => Some(Some(ValueType::Float)),
            "any" => Some(None),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Str => "str",
            ValueType::Int => "int",
            ValueType::Float => "float",
        };
        f.write_str(name)
    }
}

/// A value passed to a target option.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl OptionValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            OptionValue::Bool(_) => ValueType::Bool,
            OptionValue::Int(_) => ValueType::Int,
            OptionValue::Float(_) => ValueType::Float,
            OptionValue::Str(_) => ValueType::Str,
        }
    }

    /// Converts a TOML value. Arrays, tables and datetimes are not option values.
    pub fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(OptionValue::Str(s.clone())),
            toml::Value::Integer(i) => Some(OptionValue::Int(*i)),
            toml::Value::Float(f) => Some(OptionValue::Float(*f)),
            toml::Value::Boolean(b) => Some(OptionValue::Bool(*b)),
            _ => None,
        }
    }

    /// Interprets a string from the command line as `value_type`.
    ///
    /// Non-string values are returned unchanged if they already have the
    /// requested type.
    pub fn coerce(self, value_type: Option<ValueType>) -> Result<Self, String> {
        let Some(value_type) = value_type else {
            return Ok(self);
        };

        if self.value_type() == value_type {
            return Ok(self);
        }

        match (self, value_type) {
            (OptionValue::Str(s), ValueType::Int) => s
                .trim()
                .parse()
                .map(OptionValue::Int)
                .map_err(|_| format!("`{}` is not an integer", s)),
            (OptionValue::Str(s), ValueType::Float) => s
                .trim()
                .parse()
                .map(OptionValue::Float)
                .map_err(|_| format!("`{}` is not a float", s)),
            (OptionValue::Str(s), ValueType::Bool) => match s.trim() {
                "true" | "True" | "1" | "yes" => Ok(OptionValue::Bool(true)),
                "false" | "False" | "0" | "no" => Ok(OptionValue::Bool(false)),
                _ => Err(format!("`{}` is not a boolean", s)),
            },
            (OptionValue::Int(i), ValueType::Float) => Ok(OptionValue::Float(i as f64)),
            (other, ValueType::Str) => Ok(OptionValue::Str(other.to_string())),
            (other, expected) => Err(format!("`{}` is not of type {}", other, expected)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OptionValue::Bool(b) => serde_json::Value::Bool(*b),
            OptionValue::Int(i) => serde_json::Value::from(*i),
            OptionValue::Float(f) => serde_json::Value::from(*f),
            OptionValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Rendering used in run summaries: strings are quoted.
    pub fn summary(&self) -> String {
        match self {
            OptionValue::Str(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_cli_strings() {
        assert_eq!(
            OptionValue::from("42").coerce(Some(ValueType::Int)),
            Ok(OptionValue::Int(42))
        );
        assert_eq!(
            OptionValue::from("true").coerce(Some(ValueType::Bool)),
            Ok(OptionValue::Bool(true))
        );
        assert_eq!(
            OptionValue::from("nightly").coerce(None),
            Ok(OptionValue::from("nightly"))
        );
        assert!(OptionValue::from("many").coerce(Some(ValueType::Int)).is_err());
    }

    #[test]
    fn test_coerce_typed_values() {
        assert_eq!(
            OptionValue::Int(3).coerce(Some(ValueType::Float)),
            Ok(OptionValue::Float(3.0))
        );
        assert_eq!(
            OptionValue::Int(3).coerce(Some(ValueType::Str)),
            Ok(OptionValue::from("3"))
        );
        assert!(OptionValue::Bool(true).coerce(Some(ValueType::Int)).is_err());
    }

    #[test]
    fn test_summary_quotes_strings() {
        assert_eq!(OptionValue::from("stable").summary(), "\"stable\"");
        assert_eq!(OptionValue::Int(10000).summary(), "10000");
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(ValueType::parse("integer"), Some(Some(ValueType::Int)));
        assert_eq!(ValueType::parse("any"), Some(None));
        assert_eq!(ValueType::parse("list"), None);
    }

    #[test]
    fn test_machine_metadata() {
        let machine = Machine {
            name: "node1".to_string(),
            index: 0,
            external_addr: "203.0.113.1".to_string(),
            internal_addr: "10.0.0.1".to_string(),
        };
        let meta = machine.generate_metadata();
        assert_eq!(meta["external-addr"], "203.0.113.1");
        assert_eq!(meta["internal-addr"], "10.0.0.1");
    }
}
