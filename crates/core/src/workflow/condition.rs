use crate::types::Condition;
use serde_json::Value;
use std::collections::HashMap;

/// Evaluates the `$name` / `$params.name` / `$steps.id` comparison
/// expressions used to gate optional steps.
///
/// Supported grammar: `<operand> ('==' | '!=') <operand>`, or a bare boolean
/// literal (`true`/`false`). An operand is `$name` (a variable), `$params.<field>`,
/// `$steps.<id>`, a quoted string literal, a number, or `true`/`false`. Any expression that
/// doesn't parse to this shape is treated as `true` (with a caller-supplied
/// warning hook) rather than failing the step — see the resolution recorded
/// in the design notes for why.
pub struct ConditionEvaluator;

pub struct EvalContext<'a> {
    pub params: &'a Value,
    pub variables: &'a Value,
    pub step_outputs: &'a HashMap<String, Value>,
}

pub enum EvalOutcome {
    Resolved(bool),
    /// Expression (or condition kind) isn't understood; caller should log a
    /// warning and treat the step as gated open.
    UnknownDefaultedTrue,
}

impl ConditionEvaluator {
    pub fn evaluate(condition: &Condition, ctx: &EvalContext) -> EvalOutcome {
        match condition {
            Condition::Expression { expr } => Self::evaluate_expression(expr, ctx),
            // Script/DataBased/External backends aren't implemented; they
            // gate open until one exists.
            Condition::Script { .. } | Condition::DataBased { .. } | Condition::External { .. } => {
                EvalOutcome::UnknownDefaultedTrue
            }
        }
    }

    fn evaluate_expression(expr: &str, ctx: &EvalContext) -> EvalOutcome {
        let trimmed = expr.trim();

        if trimmed == "true" {
            return EvalOutcome::Resolved(true);
        }
        if trimmed == "false" {
            return EvalOutcome::Resolved(false);
        }

        for op in ["==", "!="] {
            if let Some((lhs, rhs)) = split_once_operator(trimmed, op) {
                let lhs_val = resolve_operand(lhs.trim(), ctx);
                let rhs_val = resolve_operand(rhs.trim(), ctx);
                return match (lhs_val, rhs_val) {
                    (Some(l), Some(r)) => {
                        let eq = values_equal(&l, &r);
                        EvalOutcome::Resolved(if op == "==" { eq } else { !eq })
                    }
                    _ => EvalOutcome::UnknownDefaultedTrue,
                };
            }
        }

        EvalOutcome::UnknownDefaultedTrue
    }
}

fn split_once_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.find(op).map(|idx| (&expr[..idx], &expr[idx + op.len()..]))
}

fn resolve_operand(operand: &str, ctx: &EvalContext) -> Option<Value> {
    if let Some(rest) = operand.strip_prefix("$params.") {
        return ctx.params.get(rest).cloned();
    }
    if let Some(rest) = operand.strip_prefix("$steps.") {
        return ctx.step_outputs.get(rest).cloned();
    }
    if let Some(rest) = operand.strip_prefix('$') {
        // Bare `$name` resolves against the execution's mutable variables,
        // not its (read-only) params — use `$params.<name>` for those.
        return ctx.variables.get(rest).cloned();
    }
    if operand == "true" {
        return Some(Value::Bool(true));
    }
    if operand == "false" {
        return Some(Value::Bool(false));
    }
    if let Ok(n) = operand.parse::<f64>() {
        return Some(serde_json::json!(n));
    }
    if operand.len() >= 2 && operand.starts_with('"') && operand.ends_with('"') {
        return Some(Value::String(operand[1..operand.len() - 1].to_string()));
    }
    None
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(params: &'a Value, variables: &'a Value, outputs: &'a HashMap<String, Value>) -> EvalContext<'a> {
        EvalContext {
            params,
            variables,
            step_outputs: outputs,
        }
    }

    #[test]
    fn bare_boolean_literals_resolve_directly() {
        let params = serde_json::json!({});
        let variables = serde_json::json!({});
        let outputs = HashMap::new();
        let c = ctx(&params, &variables, &outputs);

        assert!(matches!(
            ConditionEvaluator::evaluate(&Condition::Expression { expr: "true".into() }, &c),
            EvalOutcome::Resolved(true)
        ));
        assert!(matches!(
            ConditionEvaluator::evaluate(&Condition::Expression { expr: "false".into() }, &c),
            EvalOutcome::Resolved(false)
        ));
    }

    #[test]
    fn params_field_equality_against_string_literal() {
        let params = serde_json::json!({"env": "prod"});
        let variables = serde_json::json!({});
        let outputs = HashMap::new();
        let c = ctx(&params, &variables, &outputs);

        let outcome = ConditionEvaluator::evaluate(
            &Condition::Expression {
                expr: "$params.env == \"prod\"".into(),
            },
            &c,
        );
        assert!(matches!(outcome, EvalOutcome::Resolved(true)));

        let outcome = ConditionEvaluator::evaluate(
            &Condition::Expression {
                expr: "$params.env != \"prod\"".into(),
            },
            &c,
        );
        assert!(matches!(outcome, EvalOutcome::Resolved(false)));
    }

    #[test]
    fn step_output_reference_compares_against_number() {
        let params = serde_json::json!({});
        let variables = serde_json::json!({});
        let mut outputs = HashMap::new();
        outputs.insert("validate".to_string(), serde_json::json!(42));
        let c = ctx(&params, &variables, &outputs);

        let outcome = ConditionEvaluator::evaluate(
            &Condition::Expression {
                expr: "$steps.validate == 42".into(),
            },
            &c,
        );
        assert!(matches!(outcome, EvalOutcome::Resolved(true)));
    }

    #[test]
    fn bare_name_resolves_against_variables_not_params() {
        let params = serde_json::json!({"region": "us-east"});
        let variables = serde_json::json!({"region": "eu-west"});
        let outputs = HashMap::new();
        let c = ctx(&params, &variables, &outputs);

        let outcome = ConditionEvaluator::evaluate(
            &Condition::Expression {
                expr: "$region == \"eu-west\"".into(),
            },
            &c,
        );
        assert!(matches!(outcome, EvalOutcome::Resolved(true)));
    }

    #[test]
    fn unparseable_expression_defaults_to_true() {
        let params = serde_json::json!({});
        let variables = serde_json::json!({});
        let outputs = HashMap::new();
        let c = ctx(&params, &variables, &outputs);

        let outcome = ConditionEvaluator::evaluate(
            &Condition::Expression {
                expr: "something nobody wrote a parser for".into(),
            },
            &c,
        );
        assert!(matches!(outcome, EvalOutcome::UnknownDefaultedTrue));
    }

    #[test]
    fn non_expression_condition_kinds_default_to_true() {
        let params = serde_json::json!({});
        let variables = serde_json::json!({});
        let outputs = HashMap::new();
        let c = ctx(&params, &variables, &outputs);

        let outcome = ConditionEvaluator::evaluate(
            &Condition::Script {
                source: "return true".into(),
            },
            &c,
        );
        assert!(matches!(outcome, EvalOutcome::UnknownDefaultedTrue));
    }
}
