use serde_json::Value;

use crate::error::GatewayError;

/// Compiled draft-07 validator for a caller-supplied response schema.
pub struct SchemaValidator {
	validator: jsonschema::Validator,
}

impl SchemaValidator {
	pub fn new(schema: &Value) -> Result<Self, GatewayError> {
		let validator = jsonschema::draft7::new(schema).map_err(|e| GatewayError::SchemaValidation {
			errors: vec![format!("invalid schema: {e}")],
		})?;
		Ok(SchemaValidator { validator })
	}

	pub fn validate(&self, instance: &Value) -> Result<(), Vec<String>> {
		let errors: Vec<String> = self
			.validator
			.iter_errors(instance)
			.map(|e| format!("{}: {}", e.instance_path(), e))
			.collect();
		if errors.is_empty() { Ok(()) } else { Err(errors) }
	}
}

/// Pull a JSON value out of model output. Strict parse first; then the body
/// of a code fence; then the longest balanced `{…}` or `[…]` substring, which
/// tolerates the model wrapping the object in prose.
pub fn extract_json(text: &str) -> Option<Value> {
	let trimmed = text.trim();
	if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
		return Some(v);
	}

	if let Some(inner) = fenced_block(trimmed)
		&& let Ok(v) = serde_json::from_str::<Value>(inner.trim())
	{
		return Some(v);
	}

	let mut spans = balanced_spans(trimmed);
	spans.sort_by_key(|(start, end)| std::cmp::Reverse(end - start));
	for (start, end) in spans {
		if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..end]) {
			return Some(v);
		}
	}
	None
}

fn fenced_block(text: &str) -> Option<&str> {
	let open = text.find("```")?;
	let after = &text[open + 3..];
	// Drop the language tag line, if any.
	let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
	let body = &after[body_start..];
	let close = body.find("```")?;
	Some(&body[..close])
}

/// Byte spans of balanced brace/bracket groups at nesting depth zero,
/// respecting JSON string and escape rules.
fn balanced_spans(text: &str) -> Vec<(usize, usize)> {
	let mut spans = Vec::new();
	let mut depth = 0usize;
	let mut start = 0usize;
	let mut in_string = false;
	let mut escaped = false;
	for (i, b) in text.bytes().enumerate() {
		if in_string {
			if escaped {
				escaped = false;
			} else if b == b'\\' {
				escaped = true;
			} else if b == b'"' {
				in_string = false;
			}
			continue;
		}
		match b {
			b'"' if depth > 0 => in_string = true,
			b'{' | b'[' => {
				if depth == 0 {
					start = i;
				}
				depth += 1;
			},
			b'}' | b']' => {
				if depth > 0 {
					depth -= 1;
					if depth == 0 {
						spans.push((start, i + 1));
					}
				}
			},
			_ => {},
		}
	}
	spans
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn strict_parse_wins() {
		assert_eq!(extract_json("{\"a\":1}"), Some(json!({"a": 1})));
		assert_eq!(extract_json("  [1,2,3] "), Some(json!([1, 2, 3])));
	}

	#[test]
	fn code_fence_is_unwrapped() {
		let fixture = "```json\n{\"a\":1}\n```";
		assert_eq!(extract_json(fixture), Some(json!({"a": 1})));
		assert_eq!(extract_json("```\n{\"a\":1}\n```"), Some(json!({"a": 1})));
	}

	#[test]
	fn prose_wrapped_object_is_salvaged() {
		assert_eq!(extract_json("Sure! {\"x\":7}"), Some(json!({"x": 7})));
		assert_eq!(
			extract_json("Here you go: {\"x\": {\"y\": [1, 2]}} hope that helps"),
			Some(json!({"x": {"y": [1, 2]}}))
		);
	}

	#[test]
	fn braces_inside_strings_do_not_confuse_the_scanner() {
		let text = "answer: {\"note\": \"use {curly} braces\", \"n\": 1}";
		assert_eq!(
			extract_json(text),
			Some(json!({"note": "use {curly} braces", "n": 1}))
		);
	}

	#[test]
	fn longest_balanced_span_is_preferred() {
		let text = "{\"a\":1} but the real one is {\"a\":1,\"b\":{\"c\":2}}";
		assert_eq!(extract_json(text), Some(json!({"a":1,"b":{"c":2}})));
	}

	#[test]
	fn garbage_yields_none() {
		assert_eq!(extract_json("no json here"), None);
		assert_eq!(extract_json("{unbalanced"), None);
	}

	#[test]
	fn validator_reports_mismatches() {
		let schema = json!({
			"type": "object",
			"required": ["x"],
			"properties": {"x": {"type": "integer"}},
		});
		let v = SchemaValidator::new(&schema).unwrap();
		assert!(v.validate(&json!({"x": 7})).is_ok());
		let errs = v.validate(&json!({"x": "seven"})).unwrap_err();
		assert!(!errs.is_empty());
		assert!(v.validate(&json!({})).is_err());
	}
}
