//! JSON parsing/serialization helpers with consistent warning logs.
//!
//! Persisted JSON columns (`depends_on`, `execution_data`, …) should never be
//! able to take a scheduler pass down; a corrupt value degrades to the default
//! and leaves a warning pointing at the offending row.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub enum JsonContext<'a> {
    ExecutionField {
        execution_id: &'a str,
        field: &'static str,
    },
    StepField {
        step_id: &'a str,
        execution_id: &'a str,
        step_key: &'a str,
        field: &'static str,
    },
}

fn warn_json_error(
    raw_len: Option<usize>,
    error: serde_json::Error,
    ctx: JsonContext<'_>,
    msg: &'static str,
) {
    match ctx {
        JsonContext::ExecutionField {
            execution_id,
            field,
        } => {
            warn!(
                execution_id = %execution_id,
                field,
                raw_len,
                error = %error,
                "{msg}"
            );
        }
        JsonContext::StepField {
            step_id,
            execution_id,
            step_key,
            field,
        } => {
            warn!(
                step_id = %step_id,
                execution_id = %execution_id,
                step_key = %step_key,
                field,
                raw_len,
                error = %error,
                "{msg}"
            );
        }
    }
}

pub fn parse_optional<T: DeserializeOwned>(
    raw: Option<&str>,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(raw) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn_json_error(Some(raw.len()), error, ctx, msg);
            None
        }
    }
}

pub fn parse_or_default<T: DeserializeOwned + Default>(
    raw: &str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> T {
    // Empty string means "no value"
    if raw.is_empty() {
        return T::default();
    }
    match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn_json_error(Some(raw.len()), error, ctx, msg);
            T::default()
        }
    }
}

pub fn to_string_or_fallback<T: Serialize + ?Sized>(
    value: &T,
    fallback: &'static str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> String {
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(error) => {
            warn_json_error(None, error, ctx, msg);
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    const CTX: JsonContext<'static> = JsonContext::ExecutionField {
        execution_id: "exec-1",
        field: "execution_data",
    };

    #[test]
    fn test_parse_or_default_on_garbage() {
        let parsed: Vec<String> = parse_or_default("not json", CTX, "bad");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_parse_or_default_on_empty() {
        let parsed: Map<String, Value> = parse_or_default("", CTX, "bad");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_parse_optional() {
        let parsed: Option<Vec<String>> = parse_optional(Some(r#"["a","b"]"#), CTX, "bad");
        assert_eq!(parsed, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(parse_optional::<Vec<String>>(None, CTX, "bad"), None);
    }
}
