// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filter clause trees evaluated against JSON records.
//!
//! ```json
//! {"$and": [
//!   {"$filter": {"funcName": "gte", "key": "capacity", "parameter": 1000000, "category": "number"}},
//!   {"$or": [...]}
//! ]}
//! ```
//!
//! Evaluation is total: malformed parameters or records evaluate to `false`
//! and log a warning.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Value category of a leaf predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterCategory {
    /// Numeric.
    Number,
    /// Seconds.
    Duration,
    /// RFC 3339 text or unix seconds.
    Date,
    /// Free text.
    String,
    /// Enumerated text.
    Enum,
    /// Boolean.
    Boolean,
    /// List of values.
    Array,
    /// List of tags.
    Tag,
}

/// Comparison operator of a leaf predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterFunction {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Case-insensitive substring.
    Like,
    /// Negated case-insensitive substring.
    NotLike,
    /// Sets intersect.
    Any,
    /// Sets are disjoint.
    NotAny,
}

/// A leaf predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterParameter {
    /// Operator.
    pub func_name: FilterFunction,
    /// Record field compared.
    pub key: String,
    /// Value compared against.
    #[serde(default)]
    pub parameter: Value,
    /// How the values are compared.
    pub category: FilterCategory,
}

/// A node of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterClause {
    /// Every child holds. Empty holds.
    #[serde(rename = "$and")]
    And(Vec<FilterClause>),
    /// At least one child holds. Empty does not hold.
    #[serde(rename = "$or")]
    Or(Vec<FilterClause>),
    /// Leaf predicate.
    #[serde(rename = "$filter")]
    Filter(FilterParameter),
}

impl FilterClause {
    /// Evaluate the tree against `record`, a JSON object.
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Self::And(children) => children.iter().all(|child| child.matches(record)),
            Self::Or(children) => children.iter().any(|child| child.matches(record)),
            Self::Filter(leaf) => leaf.matches(record),
        }
    }
}

impl FilterParameter {
    /// Evaluate the leaf against `record`. A missing key reads as null.
    pub fn matches(&self, record: &Value) -> bool {
        let data = record.get(&self.key).unwrap_or(&Value::Null);
        use FilterFunction::*;
        match (self.parameter.is_null(), data.is_null()) {
            (true, true) => return matches!(self.func_name, Eq | Gte | Lte | Like | Any),
            (true, false) | (false, true) => return matches!(self.func_name, Neq | NotAny | NotLike),
            (false, false) => {}
        }

        let outcome = match self.category {
            FilterCategory::Number | FilterCategory::Duration => {
                match (data.as_f64(), self.parameter.as_f64()) {
                    (Some(data), Some(parameter)) => data.partial_cmp(&parameter).and_then(|o| self.ordered(o)),
                    _ => None,
                }
            }
            FilterCategory::Date => match (as_date(data), as_date(&self.parameter)) {
                (Some(data), Some(parameter)) => self.ordered(data.cmp(&parameter)),
                _ => None,
            },
            FilterCategory::String | FilterCategory::Enum => {
                match (data.as_str(), self.parameter.as_str()) {
                    (Some(data), Some(parameter)) => self.textual(data, parameter),
                    _ => None,
                }
            }
            FilterCategory::Boolean => match (data.as_bool(), self.parameter.as_bool()) {
                (Some(data), Some(parameter)) => match self.func_name {
                    Eq => Some(data == parameter),
                    Neq => Some(data != parameter),
                    _ => None,
                },
                _ => None,
            },
            FilterCategory::Array => match (data.as_array(), self.parameter.as_array()) {
                (Some(data), Some(parameter)) => match self.func_name {
                    Eq => Some(overlaps(data, parameter)),
                    Neq => Some(!overlaps(data, parameter)),
                    _ => None,
                },
                _ => None,
            },
            FilterCategory::Tag => match (data.as_array(), self.parameter.as_array()) {
                (Some(data), Some(parameter)) => match self.func_name {
                    Any => Some(overlaps(data, parameter)),
                    NotAny => Some(!overlaps(data, parameter)),
                    _ => None,
                },
                _ => None,
            },
        };

        outcome.unwrap_or_else(|| {
            warn!(
                key = %self.key,
                category = ?self.category,
                func_name = ?self.func_name,
                "Filter parameter or record value has an unexpected shape"
            );
            false
        })
    }

    fn ordered(&self, ordering: Ordering) -> Option<bool> {
        use FilterFunction::*;
        match self.func_name {
            Eq => Some(ordering == Ordering::Equal),
            Neq => Some(ordering != Ordering::Equal),
            Gt => Some(ordering == Ordering::Greater),
            Gte => Some(ordering != Ordering::Less),
            Lt => Some(ordering == Ordering::Less),
            Lte => Some(ordering != Ordering::Greater),
            Like | NotLike | Any | NotAny => None,
        }
    }

    fn textual(&self, data: &str, parameter: &str) -> Option<bool> {
        let contains = || data.to_lowercase().contains(&parameter.to_lowercase());
        match self.func_name {
            FilterFunction::Like => Some(contains()),
            FilterFunction::NotLike => Some(!contains()),
            FilterFunction::Eq => Some(data == parameter),
            FilterFunction::Neq => Some(data != parameter),
            _ => None,
        }
    }
}

fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|date| date.with_timezone(&Utc)),
        Value::Number(number) => number.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn overlaps(data: &[Value], parameter: &[Value]) -> bool {
    data.iter().any(|value| parameter.contains(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(func_name: FilterFunction, key: &str, parameter: Value, category: FilterCategory) -> FilterClause {
        FilterClause::Filter(FilterParameter {
            func_name,
            key: key.to_string(),
            parameter,
            category,
        })
    }

    #[test]
    fn test_deserializes_tagged_tree() {
        let clause: FilterClause = serde_json::from_value(json!({
            "$and": [
                {"$filter": {"funcName": "gte", "key": "capacity", "parameter": 1000, "category": "number"}},
                {"$or": [
                    {"$filter": {"funcName": "like", "key": "peerAlias", "parameter": "ACME", "category": "string"}},
                    {"$filter": {"funcName": "eq", "key": "private", "parameter": true, "category": "boolean"}}
                ]}
            ]
        }))
        .unwrap();

        assert!(clause.matches(&json!({"capacity": 5000, "peerAlias": "acme routing", "private": false})));
        assert!(clause.matches(&json!({"capacity": 5000, "peerAlias": "other", "private": true})));
        assert!(!clause.matches(&json!({"capacity": 500, "peerAlias": "acme", "private": true})));
    }

    #[test]
    fn test_empty_groups() {
        assert!(FilterClause::And(vec![]).matches(&json!({})));
        assert!(!FilterClause::Or(vec![]).matches(&json!({})));
    }

    #[test]
    fn test_null_handling() {
        use FilterFunction::*;
        let record = json!({"present": 5});
        for (func, expected) in [(Eq, true), (Gte, true), (Lte, true), (Like, true), (Any, true)] {
            assert_eq!(leaf(func, "missing", Value::Null, FilterCategory::Number).matches(&record), expected);
        }
        for func in [Neq, Gt, Lt, NotLike, NotAny] {
            assert!(!leaf(func, "missing", Value::Null, FilterCategory::Number).matches(&record));
        }
        assert!(!leaf(Eq, "present", Value::Null, FilterCategory::Number).matches(&record));
        assert!(!leaf(Any, "missing", json!([1]), FilterCategory::Tag).matches(&record));
        assert!(leaf(Neq, "missing", json!(1), FilterCategory::Number).matches(&record));
        assert!(leaf(NotAny, "present", Value::Null, FilterCategory::Tag).matches(&record));
    }

    #[test]
    fn test_wrong_shape_fails_closed() {
        let record = json!({"capacity": "lots", "tags": "not a list"});
        assert!(!leaf(FilterFunction::Gt, "capacity", json!(1), FilterCategory::Number).matches(&record));
        assert!(!leaf(FilterFunction::Any, "tags", json!(["a"]), FilterCategory::Tag).matches(&record));
        assert!(!leaf(FilterFunction::Gt, "tags", json!(true), FilterCategory::Boolean).matches(&record));
    }

    #[test]
    fn test_arrays_tags_and_dates() {
        let record = json!({
            "groups": [1, 2],
            "tags": ["sink", "exchange"],
            "fundedOn": "2024-03-01T00:00:00Z"
        });
        assert!(leaf(FilterFunction::Eq, "groups", json!([2, 3]), FilterCategory::Array).matches(&record));
        assert!(leaf(FilterFunction::Neq, "groups", json!([4]), FilterCategory::Array).matches(&record));
        assert!(leaf(FilterFunction::Any, "tags", json!(["sink"]), FilterCategory::Tag).matches(&record));
        assert!(leaf(FilterFunction::NotAny, "tags", json!(["source"]), FilterCategory::Tag).matches(&record));
        assert!(leaf(FilterFunction::Lt, "fundedOn", json!("2024-06-01T00:00:00Z"), FilterCategory::Date).matches(&record));
        assert!(leaf(FilterFunction::Gt, "fundedOn", json!(0), FilterCategory::Date).matches(&record));
    }

    #[test]
    fn test_every_combination_yields_a_boolean() {
        use FilterCategory as C;
        use FilterFunction as F;
        let categories = [C::Number, C::Duration, C::Date, C::String, C::Enum, C::Boolean, C::Array, C::Tag];
        let functions = [F::Eq, F::Neq, F::Gt, F::Gte, F::Lt, F::Lte, F::Like, F::NotLike, F::Any, F::NotAny];
        let values = [Value::Null, json!(1), json!("a"), json!(true), json!([1]), json!({"x": 1})];
        let mut evaluated = 0;
        for category in categories {
            for function in functions {
                for parameter in &values {
                    for data in &values {
                        let _ = leaf(function, "k", parameter.clone(), category).matches(&json!({ "k": data }));
                        evaluated += 1;
                    }
                }
            }
        }
        assert_eq!(evaluated, 8 * 10 * 36);
    }
}
