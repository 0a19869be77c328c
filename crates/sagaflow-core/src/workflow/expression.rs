//! JEXL evaluator for step branch conditions.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of transforms and coerces
//! results to booleans with JavaScript-like truthiness.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during condition evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
///
/// Conditions see `input`, `steps.<id>.output` and `steps.<id>.status`, e.g.
/// `steps.quote.output.total > 100 && input.tier == 'gold'`.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean. `context` must be a JSON object.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(truthy(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a condition with a freshly built evaluator.
///
/// The evaluator holds non-`Send` transform closures, so async callers go
/// through this function rather than keeping one alive across `.await`.
pub fn evaluate_condition(expression: &str, context: &Value) -> Result<bool, ExpressionError> {
    ConditionEvaluator::new().evaluate_bool(expression, context)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Value {
        json!({
            "input": { "tier": "Gold", "nights": 3 },
            "steps": {
                "quote": { "status": "completed", "output": { "total": 420, "tags": ["refundable"] } },
                "upsell": { "status": "skipped", "output": null }
            }
        })
    }

    #[test]
    fn test_step_output_comparison() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("steps.quote.output.total > 100", &ctx()).unwrap());
        assert!(!eval.evaluate_bool("steps.quote.output.total > 1000", &ctx()).unwrap());
    }

    #[test]
    fn test_step_status_visible() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("steps.upsell.status == 'skipped'", &ctx()).unwrap());
    }

    #[test]
    fn test_input_with_transform() {
        let eval = ConditionEvaluator::new();
        assert!(eval.evaluate_bool("input.tier|lower == 'gold'", &ctx()).unwrap());
        assert!(eval.evaluate_bool("input.nights > 2 && input.tier|upper == 'GOLD'", &ctx()).unwrap());
    }

    #[test]
    fn test_contains_and_length() {
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_bool("steps.quote.output.tags|contains('refundable')", &ctx())
            .unwrap());
        assert!(eval
            .evaluate_bool("steps.quote.output.tags|length > 0", &ctx())
            .unwrap());
    }

    #[test]
    fn test_null_output_is_falsy() {
        let eval = ConditionEvaluator::new();
        assert!(!eval.evaluate_bool("steps.upsell.output", &ctx()).unwrap());
        assert!(eval.evaluate_bool("steps.upsell.output|not", &ctx()).unwrap());
    }

    #[test]
    fn test_invalid_context_not_object() {
        let result = evaluate_condition("true", &json!([1, 2]));
        assert!(matches!(result, Err(ExpressionError::InvalidContext(_))));
    }

    #[test]
    fn test_syntax_error_reported() {
        let result = evaluate_condition("steps.quote.output.total >", &ctx());
        assert!(matches!(result, Err(ExpressionError::EvalFailed(_))));
    }
}
