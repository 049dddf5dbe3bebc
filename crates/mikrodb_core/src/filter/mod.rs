//! Filter-based query engine.
//!
//! A filter expression is a conjunction of `(field path, constraint)`
//! clauses plus an optional `$or` list of alternative expressions. Field
//! paths use dot notation (`profile.location.country`). A constraint is a
//! bare value (equality), an operator condition, or a nested expression
//! evaluated against the sub-object at that path.
//!
//! Queries combine a filter (expression tree or predicate closure) with a
//! caller-supplied sort comparator and an offset/limit window.

mod eval;

use crate::error::{CoreError, CoreResult};
use mikrodb_codec::Value;
use std::cmp::Ordering;

/// Comparison operators usable in filter conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than (numeric).
    Gt,
    /// Greater than or equal (numeric).
    Gte,
    /// Less than (numeric).
    Lt,
    /// Less than or equal (numeric).
    Lte,
    /// Member of the provided sequence.
    In,
    /// Not a member of the provided sequence.
    Nin,
    /// Case-insensitive substring on strings.
    Like,
    /// Inclusive `[lo, hi]` range (numeric).
    Between,
    /// Regular-expression match on strings.
    Regex,
    /// Array field contains the element.
    Contains,
    /// Array field contains every element of the provided list.
    ContainsAll,
    /// Array field intersects the provided list.
    ContainsAny,
    /// Array field length equals the value.
    Size,
}

impl Operator {
    /// Parses the wire name of an operator.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            "nin" => Some(Self::Nin),
            "like" => Some(Self::Like),
            "between" => Some(Self::Between),
            "regex" => Some(Self::Regex),
            "contains" => Some(Self::Contains),
            "containsAll" => Some(Self::ContainsAll),
            "containsAny" => Some(Self::ContainsAny),
            "size" => Some(Self::Size),
            _ => None,
        }
    }
}

/// An operator with its comparison value.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// The comparison operator.
    pub op: Operator,
    /// The value to compare against.
    pub value: Value,
}

impl Condition {
    /// Creates a condition.
    #[must_use]
    pub fn new(op: Operator, value: impl Into<Value>) -> Self {
        Self {
            op,
            value: value.into(),
        }
    }
}

/// Constraint attached to one field path.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    /// The field must equal this value.
    Equals(Value),
    /// The field must satisfy this condition.
    Where(Condition),
    /// The field must be an object matching this sub-expression.
    Nested(FilterExpr),
}

/// A composable filter expression.
///
/// Clauses combine conjunctively; `any_of` sub-expressions combine
/// disjunctively and AND with the clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterExpr {
    /// `(path, constraint)` clauses, all of which must match.
    pub clauses: Vec<(String, FilterNode)>,
    /// `$or` alternatives; at least one must match when non-empty.
    pub any_of: Vec<FilterExpr>,
}

impl FilterExpr {
    /// Creates an empty expression (matches everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality clause.
    #[must_use]
    pub fn field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses
            .push((path.into(), FilterNode::Equals(value.into())));
        self
    }

    /// Adds an operator condition clause.
    #[must_use]
    pub fn condition(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.clauses
            .push((path.into(), FilterNode::Where(condition)));
        self
    }

    /// Adds a nested sub-expression clause.
    #[must_use]
    pub fn nested(mut self, path: impl Into<String>, expr: FilterExpr) -> Self {
        self.clauses.push((path.into(), FilterNode::Nested(expr)));
        self
    }

    /// Adds a `$or` alternative.
    #[must_use]
    pub fn or(mut self, expr: FilterExpr) -> Self {
        self.any_of.push(expr);
        self
    }

    /// Evaluates the expression against a value.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        eval::matches(value, self)
    }

    /// Builds an expression from its JSON wire shape.
    ///
    /// An object member whose value is an object with an `operator` key
    /// becomes a condition; other object values nest; everything else is an
    /// equality leaf. The `$or` member carries a list of alternatives.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a non-object root, an unknown
    /// operator name, or a malformed `$or` list.
    pub fn from_json(json: &serde_json::Value) -> CoreResult<Self> {
        let serde_json::Value::Object(map) = json else {
            return Err(CoreError::validation("filter must be a JSON object"));
        };

        let mut expr = FilterExpr::new();
        for (path, member) in map {
            if path == "$or" {
                let serde_json::Value::Array(alternatives) = member else {
                    return Err(CoreError::validation("$or must carry a list"));
                };
                for alternative in alternatives {
                    expr.any_of.push(Self::from_json(alternative)?);
                }
                continue;
            }

            let node = match member {
                serde_json::Value::Object(inner) if inner.contains_key("operator") => {
                    let op_name = inner
                        .get("operator")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| CoreError::validation("operator must be a string"))?;
                    let op = Operator::parse(op_name).ok_or_else(|| {
                        CoreError::validation(format!("unknown operator {op_name:?}"))
                    })?;
                    let value = inner
                        .get("value")
                        .map_or(Value::Null, Value::from_json);
                    FilterNode::Where(Condition { op, value })
                }
                serde_json::Value::Object(_) => FilterNode::Nested(Self::from_json(member)?),
                other => FilterNode::Equals(Value::from_json(other)),
            };
            expr.clauses.push((path.clone(), node));
        }
        Ok(expr)
    }
}

/// Sort comparator supplied by the caller.
pub type SortFn = dyn Fn(&Value, &Value) -> Ordering + Send + Sync;

/// The filter half of a query: an expression tree or a predicate closure.
pub enum FilterSpec {
    /// Declarative expression tree.
    Expr(FilterExpr),
    /// Arbitrary predicate.
    Predicate(Box<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl FilterSpec {
    /// Evaluates the filter against a value.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Expr(expr) => expr.matches(value),
            Self::Predicate(pred) => pred(value),
        }
    }
}

impl std::fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Options for a filtered read.
#[derive(Default)]
pub struct QueryOptions {
    /// Filter applied during the scan.
    pub filter: Option<FilterSpec>,
    /// Comparator applied after the scan.
    pub sort: Option<Box<SortFn>>,
    /// Rows skipped after sorting.
    pub offset: Option<usize>,
    /// Result cap, applied both during the scan and to the final window.
    pub limit: Option<usize>,
}

impl QueryOptions {
    /// Creates empty options (select everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a filter expression.
    #[must_use]
    pub fn filter(mut self, expr: FilterExpr) -> Self {
        self.filter = Some(FilterSpec::Expr(expr));
        self
    }

    /// Sets a predicate filter.
    #[must_use]
    pub fn predicate<F>(mut self, pred: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(FilterSpec::Predicate(Box::new(pred)));
        self
    }

    /// Sets the sort comparator.
    #[must_use]
    pub fn sort_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    {
        self.sort = Some(Box::new(compare));
        self
    }

    /// Sets the offset.
    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Sets the limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Runs the query over values in iteration order: filter (capping at
    /// `limit` during the scan), then sort, then the `[offset, offset +
    /// limit)` window.
    pub fn run<'a, I>(&self, values: I) -> Vec<Value>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut out: Vec<Value> = Vec::new();
        for value in values {
            if self.filter.as_ref().map_or(true, |f| f.matches(value)) {
                out.push(value.clone());
                if self.limit.map_or(false, |limit| out.len() >= limit) {
                    break;
                }
            }
        }

        if let Some(compare) = &self.sort {
            out.sort_by(|a, b| compare(a, b));
        }

        let start = self.offset.unwrap_or(0).min(out.len());
        let end = self
            .limit
            .map_or(out.len(), |limit| start.saturating_add(limit))
            .min(out.len());
        out.drain(..start);
        out.truncate(end - start);
        out
    }
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("filter", &self.filter)
            .field("sort", &self.sort.as_ref().map(|_| ".."))
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(name: &str, age: i32) -> Value {
        Value::Object(vec![
            ("name".to_string(), Value::Str(name.to_string())),
            ("age".to_string(), Value::Int(age)),
        ])
    }

    #[test]
    fn from_json_wire_shape() {
        let expr = FilterExpr::from_json(&json!({
            "age": {"operator": "between", "value": [24, 26]},
            "name": "John",
            "profile": {"country": "Canada"},
            "$or": [{"role": "admin"}, {"role": "owner"}]
        }))
        .unwrap();

        assert_eq!(expr.clauses.len(), 3);
        assert_eq!(expr.any_of.len(), 2);
        assert!(expr
            .clauses
            .iter()
            .any(|(p, n)| p == "age" && matches!(n, FilterNode::Where(_))));
        assert!(expr
            .clauses
            .iter()
            .any(|(p, n)| p == "profile" && matches!(n, FilterNode::Nested(_))));
    }

    #[test]
    fn from_json_rejects_unknown_operator() {
        let result = FilterExpr::from_json(&json!({"a": {"operator": "wat", "value": 1}}));
        assert!(result.is_err());
        assert!(FilterExpr::from_json(&json!([1, 2])).is_err());
        assert!(FilterExpr::from_json(&json!({"$or": 5})).is_err());
    }

    #[test]
    fn run_filters_in_iteration_order() {
        let values = vec![user("a", 1), user("b", 2), user("c", 3)];
        let options =
            QueryOptions::new().filter(FilterExpr::new().condition("age", Condition::new(Operator::Gte, 2)));
        let result = options.run(&values);
        assert_eq!(result, vec![user("b", 2), user("c", 3)]);
    }

    #[test]
    fn run_caps_during_scan() {
        let values = vec![user("a", 1), user("b", 2), user("c", 3)];
        let options = QueryOptions::new().limit(2);
        assert_eq!(options.run(&values).len(), 2);
    }

    #[test]
    fn run_sorts_then_slices() {
        let values = vec![user("c", 3), user("a", 1), user("b", 2)];
        let options = QueryOptions::new()
            .sort_by(|a, b| {
                a.get("age")
                    .and_then(Value::as_int)
                    .cmp(&b.get("age").and_then(Value::as_int))
            })
            .offset(1);
        let result = options.run(&values);
        assert_eq!(result, vec![user("b", 2), user("c", 3)]);
    }

    #[test]
    fn run_offset_past_end_is_empty() {
        let values = vec![user("a", 1)];
        let options = QueryOptions::new().offset(5).limit(3);
        assert!(options.run(&values).is_empty());
    }

    #[test]
    fn predicate_filter() {
        let values = vec![user("a", 10), user("b", 40)];
        let options = QueryOptions::new()
            .predicate(|v| v.get("age").and_then(Value::as_int).unwrap_or(0) > 18);
        assert_eq!(options.run(&values), vec![user("b", 40)]);
    }
}
