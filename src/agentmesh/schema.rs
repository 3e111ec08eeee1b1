//! Argument validation against a restricted JSON-schema subset.
//!
//! Remote tools advertise an `inputSchema`; before an invocation leaves
//! the process, the supplied arguments are checked against it. The subset
//! understood here covers what tool servers use in practice:
//!
//! `type` (object, string, number, integer, array, boolean), `required`,
//! `properties`, `minLength`/`maxLength`, `minimum`/`maximum` and their
//! exclusive variants, `minItems`/`maxItems`, `enum` (string values), and
//! recursive `items`.
//!
//! `integer` is satisfied by any JSON number; the wire format does not
//! preserve an int/float distinction. The `pattern` keyword is parsed and
//! deliberately not enforced; regex validation is an extension point.
//!
//! Two modes: strict rejects properties absent from the schema, relaxed
//! ignores them. Failures name the offending field path, e.g.
//! `users[2].email`.

use std::error::Error;
use std::fmt;

use serde_json::Value;

/// A single validation failure, located by field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dotted/indexed path to the failing field; empty for the root value.
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "schema violation: {}", self.message)
        } else {
            write!(f, "schema violation at {}: {}", self.path, self.message)
        }
    }
}

impl Error for SchemaViolation {}

/// Validator over the restricted schema subset.
#[derive(Debug, Clone, Copy)]
pub struct SchemaValidator {
    strict: bool,
}

impl SchemaValidator {
    /// Strict validator: properties not named by the schema are rejected.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Relaxed validator: unknown properties pass through unchecked.
    pub fn relaxed() -> Self {
        Self { strict: false }
    }

    /// Validate `value` against `schema`, reporting the first violation.
    pub fn validate(&self, value: &Value, schema: &Value) -> Result<(), SchemaViolation> {
        self.check(value, schema, "")
    }

    fn check(&self, value: &Value, schema: &Value, path: &str) -> Result<(), SchemaViolation> {
        let schema_obj = match schema.as_object() {
            Some(obj) => obj,
            // An absent or non-object schema constrains nothing.
            None => return Ok(()),
        };

        if let Some(ty) = schema_obj.get("type").and_then(Value::as_str) {
            self.check_type(value, ty, path)?;
            match ty {
                "object" => self.check_object(value, schema_obj, path)?,
                "string" => self.check_string(value, schema_obj, path)?,
                "number" | "integer" => self.check_number(value, schema_obj, path)?,
                "array" => self.check_array(value, schema_obj, path)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn check_type(&self, value: &Value, ty: &str, path: &str) -> Result<(), SchemaViolation> {
        let ok = match ty {
            "object" => value.is_object(),
            "string" => value.is_string(),
            // Integer tolerates any number: the wire format erases the
            // int/float distinction.
            "number" | "integer" => value.is_number(),
            "array" => value.is_array(),
            "boolean" => value.is_boolean(),
            other => {
                return Err(violation(path, format!("unsupported schema type '{}'", other)));
            }
        };
        if ok {
            Ok(())
        } else {
            Err(violation(
                path,
                format!("expected {}, got {}", ty, type_name(value)),
            ))
        }
    }

    fn check_object(
        &self,
        value: &Value,
        schema: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaViolation> {
        let obj = value.as_object().unwrap();
        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(violation(
                        &join(path, name),
                        "required field is missing".to_string(),
                    ));
                }
            }
        }

        if self.strict {
            for key in obj.keys() {
                let known = properties.map(|p| p.contains_key(key)).unwrap_or(false);
                if !known {
                    return Err(violation(
                        &join(path, key),
                        "unknown field not permitted in strict mode".to_string(),
                    ));
                }
            }
        }

        if let Some(properties) = properties {
            for (name, sub_schema) in properties {
                if let Some(sub_value) = obj.get(name) {
                    self.check(sub_value, sub_schema, &join(path, name))?;
                }
            }
        }
        Ok(())
    }

    fn check_string(
        &self,
        value: &Value,
        schema: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaViolation> {
        let s = value.as_str().unwrap();
        let len = s.chars().count();

        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if (len as u64) < min {
                return Err(violation(
                    path,
                    format!("length {} is below minLength {}", len, min),
                ));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if (len as u64) > max {
                return Err(violation(
                    path,
                    format!("length {} exceeds maxLength {}", len, max),
                ));
            }
        }
        if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
            let matches = allowed
                .iter()
                .filter_map(Value::as_str)
                .any(|candidate| candidate == s);
            if !matches {
                return Err(violation(
                    path,
                    format!("'{}' is not one of the permitted values", s),
                ));
            }
        }
        // `pattern` is accepted but not enforced.
        Ok(())
    }

    fn check_number(
        &self,
        value: &Value,
        schema: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaViolation> {
        let n = value.as_f64().unwrap();

        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(violation(path, format!("{} is below minimum {}", n, min)));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(violation(path, format!("{} exceeds maximum {}", n, max)));
            }
        }
        if let Some(min) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
            if n <= min {
                return Err(violation(
                    path,
                    format!("{} is not above exclusiveMinimum {}", n, min),
                ));
            }
        }
        if let Some(max) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
            if n >= max {
                return Err(violation(
                    path,
                    format!("{} is not below exclusiveMaximum {}", n, max),
                ));
            }
        }
        Ok(())
    }

    fn check_array(
        &self,
        value: &Value,
        schema: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<(), SchemaViolation> {
        let items = value.as_array().unwrap();

        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                return Err(violation(
                    path,
                    format!("{} items is below minItems {}", items.len(), min),
                ));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if (items.len() as u64) > max {
                return Err(violation(
                    path,
                    format!("{} items exceeds maxItems {}", items.len(), max),
                ));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (index, item) in items.iter().enumerate() {
                self.check(item, item_schema, &format!("{}[{}]", path, index))?;
            }
        }
        Ok(())
    }
}

fn violation(path: &str, message: String) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message,
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
