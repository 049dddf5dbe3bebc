//! Filter expression evaluation.

use crate::filter::{Condition, FilterExpr, FilterNode, Operator};
use mikrodb_codec::Value;
use regex::Regex;
use std::cmp::Ordering;

/// Evaluates an expression against a value.
///
/// Clauses AND together; when `$or` alternatives are present, at least one
/// must match as well.
pub(crate) fn matches(value: &Value, expr: &FilterExpr) -> bool {
    let clauses_ok = expr
        .clauses
        .iter()
        .all(|(path, node)| match_clause(value, path, node));
    if !clauses_ok {
        return false;
    }
    if expr.any_of.is_empty() {
        return true;
    }
    expr.any_of.iter().any(|alt| matches(value, alt))
}

fn match_clause(value: &Value, path: &str, node: &FilterNode) -> bool {
    let Some(field) = resolve_path(value, path) else {
        return false;
    };
    match node {
        FilterNode::Equals(expected) => field.loosely_equals(expected),
        FilterNode::Where(condition) => apply_condition(field, condition),
        FilterNode::Nested(expr) => matches(field, expr),
    }
}

/// Resolves a dot-notation path. A missing or `Null` step yields `None`.
fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(Value::Null) | None => return None,
            Some(next) => current = next,
        }
    }
    Some(current)
}

fn apply_condition(field: &Value, condition: &Condition) -> bool {
    let expected = &condition.value;
    match condition.op {
        Operator::Eq => field.loosely_equals(expected),
        Operator::Neq => !field.loosely_equals(expected),
        Operator::Gt => numeric_ordering(field, expected) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            numeric_ordering(field, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => numeric_ordering(field, expected) == Some(Ordering::Less),
        Operator::Lte => matches!(
            numeric_ordering(field, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::In => expected
            .as_array()
            .map_or(false, |items| items.iter().any(|i| field.loosely_equals(i))),
        Operator::Nin => expected
            .as_array()
            .map_or(false, |items| !items.iter().any(|i| field.loosely_equals(i))),
        Operator::Like => match (field.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => false,
        },
        Operator::Between => expected.as_array().map_or(false, |bounds| {
            let (Some(lo), Some(hi)) = (bounds.first(), bounds.get(1)) else {
                return false;
            };
            matches!(
                numeric_ordering(field, lo),
                Some(Ordering::Greater | Ordering::Equal)
            ) && matches!(
                numeric_ordering(field, hi),
                Some(Ordering::Less | Ordering::Equal)
            )
        }),
        Operator::Regex => match (field.as_str(), expected.as_str()) {
            (Some(haystack), Some(pattern)) => {
                Regex::new(pattern).map_or(false, |re| re.is_match(haystack))
            }
            _ => false,
        },
        Operator::Contains => field
            .as_array()
            .map_or(false, |items| items.iter().any(|i| i.loosely_equals(expected))),
        Operator::ContainsAll => match (field.as_array(), expected.as_array()) {
            (Some(items), Some(wanted)) => wanted
                .iter()
                .all(|w| items.iter().any(|i| i.loosely_equals(w))),
            _ => false,
        },
        Operator::ContainsAny => match (field.as_array(), expected.as_array()) {
            (Some(items), Some(wanted)) => wanted
                .iter()
                .any(|w| items.iter().any(|i| i.loosely_equals(w))),
            _ => false,
        },
        Operator::Size => match (field.as_array(), expected.as_f64()) {
            #[allow(clippy::cast_precision_loss)]
            (Some(items), Some(n)) => items.len() as f64 == n,
            _ => false,
        },
    }
}

fn numeric_ordering(a: &Value, b: &Value) -> Option<Ordering> {
    a.numeric_cmp(b)
}
