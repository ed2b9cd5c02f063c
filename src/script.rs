//! Script interpreter seam.
//!
//! Script steps and predicates are black-box invocations against a
//! `ScriptEngine`. The engine ships one implementation: `ExprEngine`,
//! a deliberately tiny language (`expr`) sufficient for gate
//! predicates and constant-producing steps. Real interpreters plug in
//! behind the same trait; resource limits are their concern, not
//! specified here.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::EngineError;
use crate::types::AttributeName;

/// Black-box interpreter: evaluate `source` in `language` against the
/// attribute environment and return the resulting value.
pub trait ScriptEngine: Send + Sync {
    fn supports(&self, language: &str) -> bool;

    fn evaluate(
        &self,
        language: &str,
        source: &str,
        env: &HashMap<AttributeName, Value>,
    ) -> Result<Value, EngineError>;
}

/// JSON truthiness used for predicate results: null and absent are
/// false; booleans are themselves; numbers are non-zero; strings,
/// arrays, and objects are non-empty.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Built-in `expr` engine
// ═══════════════════════════════════════════════════════════════════════════

/// The built-in `expr` language:
///
/// - `true` / `false` - literals
/// - `name` - the environment value (missing means null)
/// - `!name` - negated truthiness
/// - `name == <json literal>` / `name != <json literal>`
/// - a JSON object literal - returned as-is, with string values of
///   the form `"$name"` substituted from the environment (the
///   constant-step form)
#[derive(Debug, Default)]
pub struct ExprEngine;

impl ScriptEngine for ExprEngine {
    fn supports(&self, language: &str) -> bool {
        language == "expr"
    }

    fn evaluate(
        &self,
        language: &str,
        source: &str,
        env: &HashMap<AttributeName, Value>,
    ) -> Result<Value, EngineError> {
        if !self.supports(language) {
            return Err(EngineError::StepUnsuccessful(format!(
                "unsupported script language: {language}"
            )));
        }

        let source = source.trim();

        // Object literal → constant step outputs.
        if source.starts_with('{') {
            let parsed: Value = serde_json::from_str(source).map_err(|e| {
                EngineError::StepUnsuccessful(format!("malformed expr object: {e}"))
            })?;
            let Value::Object(obj) = parsed else {
                return Err(EngineError::StepUnsuccessful(
                    "expr object form must be a JSON object".into(),
                ));
            };
            return Ok(Value::Object(substitute(obj, env)));
        }

        if let Some((lhs, rhs)) = split_comparison(source, "==") {
            return Ok(Value::Bool(lookup(env, lhs) == parse_literal(rhs)?));
        }
        if let Some((lhs, rhs)) = split_comparison(source, "!=") {
            return Ok(Value::Bool(lookup(env, lhs) != parse_literal(rhs)?));
        }
        if let Some(name) = source.strip_prefix('!') {
            return Ok(Value::Bool(!truthy(&lookup(env, name.trim()))));
        }
        match source {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            name => Ok(lookup(env, name)),
        }
    }
}

fn lookup(env: &HashMap<AttributeName, Value>, name: &str) -> Value {
    env.get(name).cloned().unwrap_or(Value::Null)
}

fn split_comparison<'a>(source: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    source
        .split_once(op)
        .map(|(l, r)| (l.trim(), r.trim()))
        .filter(|(l, _)| !l.is_empty() && !l.contains(' '))
}

fn parse_literal(raw: &str) -> Result<Value, EngineError> {
    serde_json::from_str(raw)
        .map_err(|e| EngineError::StepUnsuccessful(format!("malformed expr literal {raw:?}: {e}")))
}

fn substitute(obj: Map<String, Value>, env: &HashMap<AttributeName, Value>) -> Map<String, Value> {
    obj.into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) if s.starts_with('$') => lookup(env, &s[1..]),
                other => other,
            };
            (k, v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> HashMap<AttributeName, Value> {
        HashMap::from([
            ("ready".to_string(), json!(true)),
            ("mode".to_string(), json!("fast")),
            ("count".to_string(), json!(0)),
        ])
    }

    #[test]
    fn truthiness_table() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([1])));
        assert!(!truthy(&json!({})));
    }

    #[test]
    fn evaluates_lookups_and_negation() {
        let e = ExprEngine;
        assert_eq!(e.evaluate("expr", "ready", &env()).unwrap(), json!(true));
        assert_eq!(e.evaluate("expr", "!count", &env()).unwrap(), json!(true));
        assert_eq!(e.evaluate("expr", "missing", &env()).unwrap(), json!(null));
    }

    #[test]
    fn evaluates_comparisons_against_json_literals() {
        let e = ExprEngine;
        assert_eq!(
            e.evaluate("expr", "mode == \"fast\"", &env()).unwrap(),
            json!(true)
        );
        assert_eq!(
            e.evaluate("expr", "count != 0", &env()).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn object_form_substitutes_environment_references() {
        let e = ExprEngine;
        let out = e
            .evaluate("expr", r#"{"result": "$mode", "fixed": 7}"#, &env())
            .unwrap();
        assert_eq!(out, json!({"result": "fast", "fixed": 7}));
    }

    #[test]
    fn unsupported_language_is_a_step_failure() {
        let e = ExprEngine;
        let err = e.evaluate("lua", "return 1", &env()).unwrap_err();
        assert!(matches!(err, EngineError::StepUnsuccessful(_)));
        assert!(!err.is_retryable());
    }
}
