//! Typed parameter definitions
//!
//! A component's schema describes which keys it understands, their type,
//! whether they are required, their allowed range and their default. The
//! precheck turns [`ParamIssue`]s into check results and suggested fixes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::spec::ConfigValue;

/// Type of a parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Free-form string
    String,
    /// Non-negative integer
    Integer,
    /// Byte size such as `8G` or `512M`
    Capacity,
    /// `true` / `false`
    Bool,
    /// TCP port, 1..=65535
    Port,
    /// Absolute filesystem path
    Path,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Capacity => "capacity",
            ParamKind::Bool => "bool",
            ParamKind::Port => "port",
            ParamKind::Path => "path",
        };
        f.write_str(s)
    }
}

/// Definition of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    /// Value type
    #[serde(rename = "type")]
    pub kind: ParamKind,

    /// Whether a value must be present after defaults are applied
    #[serde(default)]
    pub required: bool,

    /// Value used when none is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ConfigValue>,

    /// Inclusive lower bound (bytes for capacities)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,

    /// Inclusive upper bound (bytes for capacities)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,

    /// The key is no longer understood and should be removed
    #[serde(default)]
    pub deprecated: bool,
}

impl ParamDef {
    /// A definition of the given kind with no constraints
    pub fn new(kind: ParamKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            min: None,
            max: None,
            deprecated: false,
        }
    }

    /// Mark the parameter required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the default value
    pub fn with_default(mut self, value: impl Into<ConfigValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the inclusive range
    pub fn with_range(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Mark the parameter deprecated
    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }
}

/// Problem found with one parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamIssue {
    /// Required and absent
    Missing,
    /// Present but not parseable as the expected type
    InvalidType {
        /// Expected type
        expected: ParamKind,
    },
    /// Parsed but outside the allowed range
    OutOfRange {
        /// Inclusive lower bound
        min: Option<u64>,
        /// Inclusive upper bound
        max: Option<u64>,
    },
    /// The key should not be set at all
    Deprecated,
}

impl ParamIssue {
    /// Stable error code for reports
    pub fn code(&self) -> &'static str {
        match self {
            ParamIssue::Missing => "PARAM_REQUIRED",
            ParamIssue::InvalidType { .. } => "PARAM_TYPE",
            ParamIssue::OutOfRange { .. } => "PARAM_RANGE",
            ParamIssue::Deprecated => "PARAM_DEPRECATED",
        }
    }
}

impl fmt::Display for ParamIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamIssue::Missing => write!(f, "required parameter is not set"),
            ParamIssue::InvalidType { expected } => write!(f, "value is not a valid {}", expected),
            ParamIssue::OutOfRange { min, max } => match (min, max) {
                (Some(min), Some(max)) => write!(f, "value must be between {} and {}", min, max),
                (Some(min), None) => write!(f, "value must be at least {}", min),
                (None, Some(max)) => write!(f, "value must be at most {}", max),
                (None, None) => write!(f, "value is out of range"),
            },
            ParamIssue::Deprecated => write!(f, "parameter is deprecated"),
        }
    }
}

/// All parameters a component understands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema {
    params: IndexMap<String, ParamDef>,
}

impl ParamSchema {
    /// An empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter definition
    pub fn with(mut self, name: impl Into<String>, def: ParamDef) -> Self {
        self.params.insert(name.into(), def);
        self
    }

    /// Look up a parameter
    pub fn get(&self, name: &str) -> Option<&ParamDef> {
        self.params.get(name)
    }

    /// All parameters in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamDef)> {
        self.params.iter()
    }

    /// Check one key; unknown keys are accepted as free-form
    pub fn check(&self, name: &str, value: Option<&ConfigValue>) -> Option<ParamIssue> {
        let def = self.params.get(name)?;

        let Some(value) = value else {
            return def.required.then_some(ParamIssue::Missing);
        };

        if def.deprecated {
            return Some(ParamIssue::Deprecated);
        }

        let numeric = match def.kind {
            ParamKind::String => {
                return (!is_scalar(value)).then_some(ParamIssue::InvalidType { expected: def.kind });
            }
            ParamKind::Path => {
                return match value.as_str() {
                    Some(p) if p.starts_with('/') => None,
                    _ => Some(ParamIssue::InvalidType { expected: def.kind }),
                };
            }
            ParamKind::Bool => {
                return match value {
                    ConfigValue::Bool(_) => None,
                    ConfigValue::String(s) if s == "true" || s == "false" => None,
                    _ => Some(ParamIssue::InvalidType { expected: def.kind }),
                };
            }
            ParamKind::Integer => as_integer(value),
            ParamKind::Port => as_integer(value).filter(|p| (1..=65535).contains(p)),
            ParamKind::Capacity => match value {
                ConfigValue::String(s) => parse_capacity(s),
                other => other.as_u64(),
            },
        };

        let Some(numeric) = numeric else {
            return Some(ParamIssue::InvalidType { expected: def.kind });
        };

        let below = def.min.is_some_and(|min| numeric < min);
        let above = def.max.is_some_and(|max| numeric > max);
        (below || above).then_some(ParamIssue::OutOfRange {
            min: def.min,
            max: def.max,
        })
    }
}

fn is_scalar(value: &ConfigValue) -> bool {
    matches!(
        value,
        ConfigValue::String(_) | ConfigValue::Number(_) | ConfigValue::Bool(_)
    )
}

/// Interpret a value as a non-negative integer
pub fn as_integer(value: &ConfigValue) -> Option<u64> {
    match value {
        ConfigValue::Number(n) => n.as_u64(),
        ConfigValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

const UNITS: [(char, u64); 6] = [
    ('B', 1),
    ('K', 1 << 10),
    ('M', 1 << 20),
    ('G', 1 << 30),
    ('T', 1 << 40),
    ('P', 1 << 50),
];

/// Parse a capacity such as `8G`, `512MB` or `1024` (bytes)
pub fn parse_capacity(input: &str) -> Option<u64> {
    let upper = input.trim().to_ascii_uppercase();
    // `8GB` and `8G` are the same size; a bare `12B` keeps its byte unit
    let s = upper
        .strip_suffix('B')
        .filter(|rest| rest.ends_with(|c: char| c.is_ascii_alphabetic()))
        .unwrap_or(&upper);

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let number: u64 = digits.parse().ok()?;

    let multiplier = match unit {
        "" => 1,
        u if u.len() == 1 => {
            let c = u.chars().next()?;
            UNITS.iter().find(|(name, _)| *name == c)?.1
        }
        _ => return None,
    };

    number.checked_mul(multiplier)
}

/// Format bytes with the largest unit that divides them evenly
pub fn format_capacity(bytes: u64) -> String {
    for (name, size) in UNITS.iter().rev() {
        if *size > 1 && bytes >= *size && bytes % size == 0 {
            return format!("{}{}", bytes / size, name);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ParamSchema {
        ParamSchema::new()
            .with("home_path", ParamDef::new(ParamKind::Path).required())
            .with("mysql_port", ParamDef::new(ParamKind::Port).with_default(2881))
            .with(
                "memory_limit",
                ParamDef::new(ParamKind::Capacity).with_range(Some(parse_capacity("6G").unwrap()), None),
            )
            .with("cpu_count", ParamDef::new(ParamKind::Integer).with_range(Some(1), Some(64)))
            .with("enable_syslog", ParamDef::new(ParamKind::Bool))
            .with("legacy_mode", ParamDef::new(ParamKind::Bool).deprecated())
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("8G"), Some(8 << 30));
        assert_eq!(parse_capacity("8GB"), Some(8 << 30));
        assert_eq!(parse_capacity("512m"), Some(512 << 20));
        assert_eq!(parse_capacity("1024"), Some(1024));
        assert_eq!(parse_capacity("12B"), Some(12));
        assert_eq!(parse_capacity("eight"), None);
        assert_eq!(parse_capacity("8X"), None);
    }

    #[test]
    fn test_format_capacity() {
        assert_eq!(format_capacity(8 << 30), "8G");
        assert_eq!(format_capacity(1536 << 20), "1536M");
        assert_eq!(format_capacity(1000), "1000");
    }

    #[test]
    fn test_required_and_unknown() {
        let schema = schema();
        assert_eq!(schema.check("home_path", None), Some(ParamIssue::Missing));
        assert_eq!(schema.check("mysql_port", None), None);
        assert_eq!(schema.check("something_else", Some(&ConfigValue::from("x"))), None);
    }

    #[test]
    fn test_type_checks() {
        let schema = schema();
        assert_eq!(
            schema.check("home_path", Some(&ConfigValue::from("relative/dir"))),
            Some(ParamIssue::InvalidType { expected: ParamKind::Path })
        );
        assert_eq!(
            schema.check("mysql_port", Some(&ConfigValue::from(70000))),
            Some(ParamIssue::InvalidType { expected: ParamKind::Port })
        );
        assert_eq!(schema.check("mysql_port", Some(&ConfigValue::from("2881"))), None);
        assert_eq!(schema.check("enable_syslog", Some(&ConfigValue::from(true))), None);
    }

    #[test]
    fn test_range_checks() {
        let schema = schema();
        assert_eq!(
            schema.check("memory_limit", Some(&ConfigValue::from("4G"))),
            Some(ParamIssue::OutOfRange {
                min: Some(6 << 30),
                max: None
            })
        );
        assert_eq!(schema.check("memory_limit", Some(&ConfigValue::from("8G"))), None);
        assert!(matches!(
            schema.check("cpu_count", Some(&ConfigValue::from(128))),
            Some(ParamIssue::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_deprecated() {
        let schema = schema();
        let issue = schema.check("legacy_mode", Some(&ConfigValue::from(true))).unwrap();
        assert_eq!(issue, ParamIssue::Deprecated);
        assert_eq!(issue.code(), "PARAM_DEPRECATED");
        assert_eq!(schema.check("legacy_mode", None), None);
    }
}
