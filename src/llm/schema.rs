//! Structured-output contracts for LLM answers

use serde_json::Value;

/// Shape a JSON value is expected to have.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaType {
    Any,
    String,
    Number,
    Bool,
    Array(Box<SchemaType>),
    Object(Vec<FieldSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: SchemaType,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &str, kind: SchemaType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: SchemaType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

/// Contract for a JSON answer. Extra fields are tolerated.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub root: SchemaType,
}

impl OutputSchema {
    pub fn object(fields: Vec<FieldSpec>) -> Self {
        Self {
            root: SchemaType::Object(fields),
        }
    }

    /// Check `value` against the schema, naming the first offending path.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        check(&self.root, value, "$")
    }
}

fn check(kind: &SchemaType, value: &Value, path: &str) -> std::result::Result<(), String> {
    match kind {
        SchemaType::Any => Ok(()),
        SchemaType::String => expect(value.is_string(), "a string", path),
        SchemaType::Number => expect(value.is_number(), "a number", path),
        SchemaType::Bool => expect(value.is_boolean(), "a boolean", path),
        SchemaType::Array(item) => {
            let items = value
                .as_array()
                .ok_or_else(|| format!("{} should be an array", path))?;
            for (i, element) in items.iter().enumerate() {
                check(item, element, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        SchemaType::Object(fields) => {
            let map = value
                .as_object()
                .ok_or_else(|| format!("{} should be an object", path))?;
            for field in fields {
                let field_path = format!("{}.{}", path, field.name);
                match map.get(&field.name) {
                    Some(Value::Null) | None if field.required => {
                        return Err(format!("{} is required", field_path));
                    }
                    Some(Value::Null) | None => {}
                    Some(inner) => check(&field.kind, inner, &field_path)?,
                }
            }
            Ok(())
        }
    }
}

fn expect(ok: bool, what: &str, path: &str) -> std::result::Result<(), String> {
    if ok {
        Ok(())
    } else {
        Err(format!("{} should be {}", path, what))
    }
}

/// Pull a JSON object out of free-form model text.
///
/// Tries, in order: the last ```json fenced block, the whole text, and the
/// span between the first `{` and the last `}`.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(block) = last_fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            return Some(value);
        }
    }

    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn last_fenced_block(text: &str) -> Option<&str> {
    let open = text.rfind("```json")?;
    let body = &text[open + "```json".len()..];
    let close = body.find("```")?;
    Some(&body[..close])
}
