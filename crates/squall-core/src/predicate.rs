//! Closed predicate AST and query shape for live queries.
//!
//! Client filters arrive as a tree of [`Predicate`] nodes and are evaluated
//! by the explicit interpreter in [`Predicate::matches`] — there is no
//! operator dictionary to probe at runtime. The pseudo-fields `_key` and
//! `_id` address the entry key instead of the stored value, which is what
//! partition pruning keys off.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Field names that address the entry key rather than the stored value.
pub const KEY_FIELDS: &[&str] = &["_key", "_id"];

/// A filter over `(key, value)` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Predicate {
    /// Field equals the literal.
    Eq { field: String, value: Value },
    /// Field differs from the literal (missing fields do not match).
    Neq { field: String, value: Value },
    /// Field is strictly greater than the literal.
    Gt { field: String, value: Value },
    /// Field is greater than or equal to the literal.
    Gte { field: String, value: Value },
    /// Field is strictly less than the literal.
    Lt { field: String, value: Value },
    /// Field is less than or equal to the literal.
    Lte { field: String, value: Value },
    /// Field equals one of the literals.
    In { field: String, values: Vec<Value> },
    /// Field matches a SQL-style pattern (`%` any run, `_` one char).
    Like { field: String, pattern: String },
    /// Every child matches.
    And { all: Vec<Predicate> },
    /// At least one child matches.
    Or { any: Vec<Predicate> },
    /// The child does not match.
    Not { inner: Box<Predicate> },
}

impl Predicate {
    /// Evaluates this predicate against one entry.
    ///
    /// A comparison on a missing field is `false` for every operator,
    /// including `Neq` — absence is not a value.
    #[must_use]
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self {
            Predicate::Eq { field, value: lit } => {
                resolve(field, key, value).is_some_and(|v| v == *lit)
            }
            Predicate::Neq { field, value: lit } => {
                resolve(field, key, value).is_some_and(|v| v != *lit)
            }
            Predicate::Gt { field, value: lit } => compare(field, key, value, lit)
                .is_some_and(std::cmp::Ordering::is_gt),
            Predicate::Gte { field, value: lit } => compare(field, key, value, lit)
                .is_some_and(std::cmp::Ordering::is_ge),
            Predicate::Lt { field, value: lit } => compare(field, key, value, lit)
                .is_some_and(std::cmp::Ordering::is_lt),
            Predicate::Lte { field, value: lit } => compare(field, key, value, lit)
                .is_some_and(std::cmp::Ordering::is_le),
            Predicate::In { field, values } => {
                resolve(field, key, value).is_some_and(|v| values.iter().any(|lit| v == *lit))
            }
            Predicate::Like { field, pattern } => resolve(field, key, value)
                .and_then(|v| v.as_str().map(String::from))
                .is_some_and(|s| like_match(&s, pattern)),
            Predicate::And { all } => all.iter().all(|child| child.matches(key, value)),
            Predicate::Or { any } => any.iter().any(|child| child.matches(key, value)),
            Predicate::Not { inner } => !inner.matches(key, value),
        }
    }

    /// Convenience constructor for a key-equality filter.
    #[must_use]
    pub fn key_eq(key: impl Into<String>) -> Self {
        Predicate::Eq { field: "_key".to_string(), value: Value::String(key.into()) }
    }

    /// Whether `field` addresses the entry key.
    #[must_use]
    pub fn is_key_field(field: &str) -> bool {
        KEY_FIELDS.contains(&field)
    }
}

/// Resolves a field reference to the value it names for this entry.
fn resolve<'a>(field: &str, key: &'a str, value: &'a Value) -> Option<Value> {
    if Predicate::is_key_field(field) {
        return Some(Value::String(key.to_string()));
    }
    value.field(field).cloned()
}

fn compare(field: &str, key: &str, value: &Value, lit: &Value) -> Option<std::cmp::Ordering> {
    let resolved = resolve(field, key, value)?;
    // Only same-kind comparisons are meaningful for range operators;
    // numbers compare across Int/Float.
    let comparable = matches!(
        (&resolved, lit),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    );
    comparable.then(|| resolved.sort_cmp(lit))
}

/// SQL-LIKE matching: `%` is any run, `_` one character, rest is literal.
fn like_match(input: &str, pattern: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex::Regex::new(&regex).map(|re| re.is_match(input)).unwrap_or(false)
}

/// Sort direction for ordered query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    /// Field to order by; `_key` orders by the entry key.
    pub field: String,
    pub direction: SortDirection,
}

/// A live query: optional filter, ordering, and pagination.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub predicate: Option<Predicate>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sort: Vec<SortSpec>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<String>,
}

impl Query {
    /// A query matching every entry of a map.
    #[must_use]
    pub fn match_all() -> Self {
        Self::default()
    }

    /// Whether `(key, value)` satisfies this query's filter.
    ///
    /// A query without a predicate matches everything.
    #[must_use]
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        self.predicate
            .as_ref()
            .is_none_or(|p| p.matches(key, value))
    }

    /// Sorts `(key, value)` pairs by the query's sort specs, key-ascending
    /// as the final tie-breaker for determinism.
    pub fn order_entries(&self, entries: &mut [(String, Value)]) {
        entries.sort_by(|(ka, va), (kb, vb)| {
            for spec in &self.sort {
                let a = field_for_sort(spec, ka, va);
                let b = field_for_sort(spec, kb, vb);
                let ord = match (a, b) {
                    (Some(a), Some(b)) => a.sort_cmp(&b),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                let ord = match spec.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            ka.cmp(kb)
        });
    }
}

fn field_for_sort(spec: &SortSpec, key: &str, value: &Value) -> Option<Value> {
    if Predicate::is_key_field(&spec.field) {
        Some(Value::String(key.to_string()))
    } else {
        value.field(&spec.field).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn doc(pairs: &[(&str, Value)]) -> Value {
        Value::Map(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    // ---- scalar operators ----

    #[test]
    fn eq_on_value_field() {
        let p = Predicate::Eq { field: "status".into(), value: Value::from("active") };
        assert!(p.matches("k", &doc(&[("status", Value::from("active"))])));
        assert!(!p.matches("k", &doc(&[("status", Value::from("idle"))])));
        assert!(!p.matches("k", &doc(&[])));
    }

    #[test]
    fn eq_on_key_pseudo_fields() {
        for field in ["_key", "_id"] {
            let p = Predicate::Eq { field: field.into(), value: Value::from("users/100") };
            assert!(p.matches("users/100", &Value::Null));
            assert!(!p.matches("users/101", &Value::Null));
        }
    }

    #[test]
    fn neq_does_not_match_missing_fields() {
        let p = Predicate::Neq { field: "status".into(), value: Value::from("active") };
        assert!(p.matches("k", &doc(&[("status", Value::from("idle"))])));
        assert!(!p.matches("k", &doc(&[])), "absence is not inequality");
    }

    #[test]
    fn range_operators_compare_numbers_across_kinds() {
        let entry = doc(&[("age", Value::Int(21))]);
        let gt = Predicate::Gt { field: "age".into(), value: Value::Float(20.5) };
        let lte = Predicate::Lte { field: "age".into(), value: Value::Int(21) };
        let lt = Predicate::Lt { field: "age".into(), value: Value::Int(21) };
        assert!(gt.matches("k", &entry));
        assert!(lte.matches("k", &entry));
        assert!(!lt.matches("k", &entry));
    }

    #[test]
    fn range_operators_reject_cross_type_comparisons() {
        let entry = doc(&[("age", Value::from("21"))]);
        let gt = Predicate::Gt { field: "age".into(), value: Value::Int(20) };
        assert!(!gt.matches("k", &entry));
    }

    #[test]
    fn in_matches_membership() {
        let p = Predicate::In {
            field: "_key".into(),
            values: vec![Value::from("a"), Value::from("b")],
        };
        assert!(p.matches("a", &Value::Null));
        assert!(p.matches("b", &Value::Null));
        assert!(!p.matches("c", &Value::Null));
    }

    #[test]
    fn like_percent_and_underscore() {
        let p = Predicate::Like { field: "name".into(), pattern: "Ice%".into() };
        assert!(p.matches("k", &doc(&[("name", Value::from("Iceman"))])));
        assert!(!p.matches("k", &doc(&[("name", Value::from("Maverick"))])));

        let single = Predicate::Like { field: "name".into(), pattern: "I_eman".into() };
        assert!(single.matches("k", &doc(&[("name", Value::from("Iceman"))])));

        let literal_dot = Predicate::Like { field: "name".into(), pattern: "a.c".into() };
        assert!(!literal_dot.matches("k", &doc(&[("name", Value::from("abc"))])));
    }

    // ---- combinators ----

    #[test]
    fn and_or_not_combine() {
        let entry = doc(&[("status", Value::from("active")), ("age", Value::Int(30))]);
        let active = Predicate::Eq { field: "status".into(), value: Value::from("active") };
        let adult = Predicate::Gte { field: "age".into(), value: Value::Int(18) };
        let minor = Predicate::Lt { field: "age".into(), value: Value::Int(18) };

        let and = Predicate::And { all: vec![active.clone(), adult.clone()] };
        assert!(and.matches("k", &entry));

        let or = Predicate::Or { any: vec![minor.clone(), active.clone()] };
        assert!(or.matches("k", &entry));

        let not = Predicate::Not { inner: Box::new(minor) };
        assert!(not.matches("k", &entry));

        let empty_and = Predicate::And { all: vec![] };
        assert!(empty_and.matches("k", &entry), "vacuous conjunction matches");
        let empty_or = Predicate::Or { any: vec![] };
        assert!(!empty_or.matches("k", &entry), "vacuous disjunction fails");
    }

    // ---- Query ----

    #[test]
    fn query_without_predicate_matches_everything() {
        let q = Query::match_all();
        assert!(q.matches("anything", &Value::Null));
    }

    #[test]
    fn order_entries_sorts_by_spec_then_key() {
        let q = Query {
            sort: vec![SortSpec { field: "rank".into(), direction: SortDirection::Desc }],
            ..Query::default()
        };
        let mut entries = vec![
            ("b".to_string(), doc(&[("rank", Value::Int(1))])),
            ("a".to_string(), doc(&[("rank", Value::Int(2))])),
            ("c".to_string(), doc(&[("rank", Value::Int(1))])),
        ];
        q.order_entries(&mut entries);
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_sort_field_sorts_last() {
        let q = Query {
            sort: vec![SortSpec { field: "rank".into(), direction: SortDirection::Asc }],
            ..Query::default()
        };
        let mut entries = vec![
            ("x".to_string(), doc(&[])),
            ("y".to_string(), doc(&[("rank", Value::Int(5))])),
        ];
        q.order_entries(&mut entries);
        assert_eq!(entries[0].0, "y");
    }

    // ---- serde ----

    #[test]
    fn predicate_roundtrips_msgpack() {
        let p = Predicate::And {
            all: vec![
                Predicate::Eq { field: "_key".into(), value: Value::from("k1") },
                Predicate::Not {
                    inner: Box::new(Predicate::Gt {
                        field: "age".into(),
                        value: Value::Int(5),
                    }),
                },
            ],
        };
        let bytes = rmp_serde::to_vec_named(&p).unwrap();
        let back: Predicate = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn query_roundtrips_msgpack() {
        let q = Query {
            predicate: Some(Predicate::key_eq("users/1")),
            sort: vec![SortSpec { field: "_key".into(), direction: SortDirection::Asc }],
            limit: Some(10),
            cursor: None,
        };
        let bytes = rmp_serde::to_vec_named(&q).unwrap();
        let back: Query = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(q, back);
    }
}
