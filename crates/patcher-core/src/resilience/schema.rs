//! JSON extraction and schema validation for structured responses.

use serde_json::Value;

/// Pull a JSON document out of model output.
///
/// Accepts bare JSON, a fenced ```json block, or the outermost `{...}` span.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block) {
            return Some(value);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn fenced_block(content: &str) -> Option<&str> {
    let open = content.find("```")?;
    let after = &content[open + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Validate `instance` against `schema`, joining every violation.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| format!("invalid schema: {e}"))?;
    if validator.is_valid(instance) {
        return Ok(());
    }
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    Err(errors.join("; "))
}

/// Extract and validate in one step.
pub fn check(schema: &Value, content: &str) -> Result<Value, String> {
    let value = extract_json(content).ok_or_else(|| "response is not valid JSON".to_string())?;
    validate(schema, &value)?;
    Ok(value)
}

/// Follow-up turn asking the backend to fix a rejected response.
pub fn corrective_instruction(schema_name: &str, reason: &str) -> String {
    format!(
        "Your previous response did not match the `{schema_name}` schema: {reason}. \
         Reply again with only a JSON document that satisfies the schema."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["summary", "confidence"],
            "properties": {
                "summary": {"type": "string"},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1}
            }
        })
    }

    #[test]
    fn test_extract_plain_and_fenced() {
        assert_eq!(extract_json(" {\"a\": 1} "), Some(json!({"a": 1})));
        let fenced = "Here you go:\n```json\n{\"a\": 2}\n```\nthanks";
        assert_eq!(extract_json(fenced), Some(json!({"a": 2})));
        let prose = "The plan is {\"a\": 3} as requested.";
        assert_eq!(extract_json(prose), Some(json!({"a": 3})));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_validate_reports_violations() {
        assert!(validate(&schema(), &json!({"summary": "x", "confidence": 0.5})).is_ok());
        let err = validate(&schema(), &json!({"summary": "x"})).expect_err("missing field");
        assert!(err.contains("confidence"));
        assert!(validate(&schema(), &json!({"summary": "x", "confidence": 3})).is_err());
    }

    #[test]
    fn test_check_rejects_non_json() {
        let err = check(&schema(), "I cannot help with that").expect_err("not json");
        assert!(err.contains("not valid JSON"));
    }
}
