//! Condition evaluation for `while` directives and conditional plugins.
//!
//! Conditions are a tagged union evaluated against the run's variable map.
//! Evaluation is total: malformed operands and invalid regex patterns
//! evaluate to `false` rather than failing the run.

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a variable, with an optional dot-path into its JSON value
/// and a fallback used when the variable or path is absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VarRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Operand of a comparison: either a variable reference or an inline value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Ref {
        r#ref: VarRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    Value(Value),
}

impl Operand {
    /// Shorthand for an inline literal operand.
    #[must_use]
    pub fn lit(value: Value) -> Self {
        Operand::Value(value)
    }

    /// Shorthand for a plain variable reference.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Operand::Ref {
            r#ref: VarRef {
                name: name.into(),
                path: None,
            },
            default: None,
        }
    }

    fn resolve(&self, vars: &FxHashMap<String, Value>) -> Value {
        match self {
            Operand::Value(v) => v.clone(),
            Operand::Ref { r#ref, default } => {
                let base = vars.get(&r#ref.name);
                let resolved = match (&r#ref.path, base) {
                    (Some(path), Some(value)) => lookup_path(value, path),
                    (None, Some(value)) => Some(value.clone()),
                    (_, None) => None,
                };
                resolved
                    .or_else(|| default.clone())
                    .unwrap_or(Value::Null)
            }
        }
    }
}

fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    let mut cursor = value;
    for segment in path.split('.') {
        cursor = match cursor {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor.clone())
}

/// Comparison operators. `eq`/`neq` use strict deep equality on JSON values,
/// numeric operators cast to number, string operators cast to string, and
/// `regex` compiles its right-hand side as a pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

/// Tagged condition union, matched exhaustively at evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Condition {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Truthy {
        value: Operand,
    },
    Falsy {
        value: Operand,
    },
    Not {
        condition: Box<Condition>,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    /// Reserved for a future expression language; always false with the
    /// default evaluator. Extra payload fields are accepted and ignored.
    Expr {},
}

impl Condition {
    /// Evaluate against a variable map.
    #[must_use]
    pub fn evaluate(&self, vars: &FxHashMap<String, Value>) -> bool {
        match self {
            Condition::Compare { left, op, right } => {
                compare(&left.resolve(vars), *op, &right.resolve(vars))
            }
            Condition::Truthy { value } => is_truthy(&value.resolve(vars)),
            Condition::Falsy { value } => !is_truthy(&value.resolve(vars)),
            Condition::Not { condition } => !condition.evaluate(vars),
            Condition::And { conditions } => conditions.iter().all(|c| c.evaluate(vars)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.evaluate(vars)),
            Condition::Expr {} => false,
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) => Some(0.0),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => left == right,
        CompareOp::Neq => left != right,
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let (Some(l), Some(r)) = (as_number(left), as_number(right)) else {
                return false;
            };
            match op {
                CompareOp::Gt => l > r,
                CompareOp::Gte => l >= r,
                CompareOp::Lt => l < r,
                CompareOp::Lte => l <= r,
                _ => unreachable!(),
            }
        }
        CompareOp::Contains => as_text(left).contains(&as_text(right)),
        CompareOp::StartsWith => as_text(left).starts_with(&as_text(right)),
        CompareOp::EndsWith => as_text(left).ends_with(&as_text(right)),
        CompareOp::Regex => match Regex::new(&as_text(right)) {
            Ok(re) => re.is_match(&as_text(left)),
            // Invalid pattern: the comparison is false, not an error.
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn eq_is_deep_json_equality() {
        let vars = vars(&[("payload", json!({"a": [1, 2], "b": "x"}))]);
        let cond = Condition::Compare {
            left: Operand::var("payload"),
            op: CompareOp::Eq,
            right: Operand::lit(json!({"b": "x", "a": [1, 2]})),
        };
        assert!(cond.evaluate(&vars));
    }

    #[test]
    fn numeric_ops_cast_strings() {
        let vars = vars(&[("count", json!("12"))]);
        let cond = Condition::Compare {
            left: Operand::var("count"),
            op: CompareOp::Gt,
            right: Operand::lit(json!(5)),
        };
        assert!(cond.evaluate(&vars));
        let cond = Condition::Compare {
            left: Operand::var("count"),
            op: CompareOp::Lte,
            right: Operand::lit(json!("not a number")),
        };
        assert!(!cond.evaluate(&vars));
    }

    #[test]
    fn string_ops_and_regex() {
        let vars = vars(&[("url", json!("https://example.com/path"))]);
        let starts = Condition::Compare {
            left: Operand::var("url"),
            op: CompareOp::StartsWith,
            right: Operand::lit(json!("https://")),
        };
        assert!(starts.evaluate(&vars));
        let re = Condition::Compare {
            left: Operand::var("url"),
            op: CompareOp::Regex,
            right: Operand::lit(json!(r"example\.(com|org)")),
        };
        assert!(re.evaluate(&vars));
        let bad = Condition::Compare {
            left: Operand::var("url"),
            op: CompareOp::Regex,
            right: Operand::lit(json!("(unclosed")),
        };
        assert!(!bad.evaluate(&vars));
    }

    #[test]
    fn ref_path_and_default() {
        let vars = vars(&[("result", json!({"items": [{"ok": true}]}))]);
        let cond = Condition::Truthy {
            value: Operand::Ref {
                r#ref: VarRef {
                    name: "result".into(),
                    path: Some("items.0.ok".into()),
                },
                default: None,
            },
        };
        assert!(cond.evaluate(&vars));
        let fallback = Condition::Compare {
            left: Operand::Ref {
                r#ref: VarRef {
                    name: "missing".into(),
                    path: None,
                },
                default: Some(json!(3)),
            },
            op: CompareOp::Eq,
            right: Operand::lit(json!(3)),
        };
        assert!(fallback.evaluate(&vars));
    }

    #[test]
    fn combinators_nest() {
        let vars = vars(&[("n", json!(2)), ("flag", json!(false))]);
        let cond = Condition::And {
            conditions: vec![
                Condition::Compare {
                    left: Operand::var("n"),
                    op: CompareOp::Lt,
                    right: Operand::lit(json!(5)),
                },
                Condition::Not {
                    condition: Box::new(Condition::Truthy {
                        value: Operand::var("flag"),
                    }),
                },
            ],
        };
        assert!(cond.evaluate(&vars));
        assert!(!Condition::Or { conditions: vec![] }.evaluate(&vars));
        assert!(Condition::And { conditions: vec![] }.evaluate(&vars));
    }

    #[test]
    fn expr_is_reserved_and_false() {
        let cond: Condition =
            serde_json::from_value(json!({"kind": "expr", "source": "1 + 1 == 2"})).unwrap();
        assert_eq!(cond, Condition::Expr {});
        assert!(!cond.evaluate(&FxHashMap::default()));
    }

    #[test]
    fn serde_shape_matches_wire_format() {
        let cond: Condition = serde_json::from_value(json!({
            "kind": "compare",
            "left": {"ref": {"name": "i"}},
            "op": "lt",
            "right": 3
        }))
        .unwrap();
        let v = vars(&[("i", json!(1))]);
        assert!(cond.evaluate(&v));
    }
}
