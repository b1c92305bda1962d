//! The query AST and its functional builder.
//!
//! A [`Query`] selects a subset of the event log: the set of events whose type matches one
//! of the query's [`Clause`]s and, if that clause carries a filter, whose `payload` also
//! satisfies it. Clauses combine with OR semantics; a filter's nested `And`/`Or` nodes
//! combine with the obvious boolean semantics against JSON containment on the payload.
//!
//! # Design
//!
//! The builder never mutates: every method takes `self` by value and returns a new
//! `Query`. This makes a `Query` safe to share, branch from, and reuse as a base for many
//! derived queries without the caller needing to clone defensively first — any `Query` you
//! hold is guaranteed not to change underneath you.
//!
//! # Examples
//!
//! ```
//! use composable_rust_core::query::{Query, key};
//! use serde_json::json;
//!
//! let q = Query::new()
//!     .events_of_type("OrderPlaced")
//!     .where_(key("order_id").equals(json!("order-123")))
//!     .events_of_type("OrderCancelled")
//!     .where_(key("order_id").equals(json!("order-123")));
//!
//! assert_eq!(q.clauses().len(), 2);
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Errors produced while constructing or validating a [`Query`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// A query with no clauses was used where at least one is required (append, load,
    /// stream, or projection registration).
    #[error("query must contain at least one clause")]
    Empty,
}

/// A single node in an attribute filter tree.
///
/// `Attr` matches events whose JSON `payload` contains `{key: value}` at the top level
/// (JSON containment, not deep equality of the whole document). `And`/`Or` combine child
/// nodes with the corresponding boolean semantics.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterNode {
    /// Matches when `payload` contains `{key: value}`.
    Attr {
        /// The JSON key to match on.
        key: String,
        /// The value the key must equal.
        value: serde_json::Value,
    },
    /// Matches when every child matches.
    And(Vec<FilterNode>),
    /// Matches when at least one child matches.
    Or(Vec<FilterNode>),
}

/// Intermediate builder for an [`FilterNode::Attr`] node: `key("order_id").equals(json!(1))`.
#[derive(Clone, Debug)]
pub struct FilterKey(String);

/// Start building an attribute filter on the given JSON key.
///
/// # Examples
///
/// ```
/// use composable_rust_core::query::key;
/// use serde_json::json;
///
/// let filter = key("status").equals(json!("shipped"));
/// ```
#[must_use]
pub fn key(k: impl Into<String>) -> FilterKey {
    FilterKey(k.into())
}

impl FilterKey {
    /// Complete the filter: match events whose payload contains `{key: value}`.
    #[must_use]
    pub fn equals(self, value: impl Into<serde_json::Value>) -> FilterNode {
        FilterNode::Attr {
            key: self.0,
            value: value.into(),
        }
    }
}

/// One clause of a [`Query`]: an event type and an optional filter on its payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Clause {
    event_type: String,
    filter: Option<FilterNode>,
}

impl Clause {
    /// The event type this clause matches.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The filter applied to the payload of events of this type, if any.
    #[must_use]
    pub fn filter(&self) -> Option<&FilterNode> {
        self.filter.as_ref()
    }
}

/// A compositional, immutable selection over the event log.
///
/// See the module documentation for the combination semantics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// An empty query, matching nothing. Add clauses with [`Query::events_of_type`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    /// Append a clause matching events of `event_type`, with no payload filter yet.
    ///
    /// Subsequent [`Query::where_`], [`Query::and`], or [`Query::or`] calls attach a
    /// filter to this clause until the next `events_of_type` call starts a new one.
    #[must_use]
    pub fn events_of_type(mut self, event_type: impl Into<String>) -> Self {
        self.clauses.push(Clause {
            event_type: event_type.into(),
            filter: None,
        });
        self
    }

    /// Set the filter on the most recently added clause, replacing any filter already
    /// attached to it.
    ///
    /// A no-op if no clause has been added yet (the builder has nothing to filter).
    #[must_use]
    pub fn where_(mut self, filter: FilterNode) -> Self {
        if let Some(clause) = self.clauses.last_mut() {
            clause.filter = Some(filter);
        }
        self
    }

    /// Combine `filter` into the most recent clause's filter with AND semantics.
    ///
    /// If the clause has no filter yet, behaves like [`Query::where_`]. If its existing
    /// filter is already an `And`, `filter` is appended to that node's children
    /// (flattening a run of `.and()` calls into one `And` node rather than nesting). If the
    /// existing filter is anything else (including an `Or`), both are wrapped in a fresh
    /// `And` node — an `.and()` following an `.or()` nests rather than flattens, since the
    /// two operators do not associate.
    #[must_use]
    pub fn and(mut self, filter: FilterNode) -> Self {
        if let Some(clause) = self.clauses.last_mut() {
            clause.filter = Some(combine(clause.filter.take(), filter, true));
        }
        self
    }

    /// Combine `filter` into the most recent clause's filter with OR semantics.
    ///
    /// Mirrors [`Query::and`], flattening a run of `.or()` calls into one `Or` node.
    #[must_use]
    pub fn or(mut self, filter: FilterNode) -> Self {
        if let Some(clause) = self.clauses.last_mut() {
            clause.filter = Some(combine(clause.filter.take(), filter, false));
        }
        self
    }

    /// The clauses making up this query, in the order they were added.
    #[must_use]
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Whether this query has no clauses (matches nothing, and is rejected by the store).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Reject an empty query with [`QueryError::Empty`].
    ///
    /// # Errors
    ///
    /// Returns `QueryError::Empty` if this query has no clauses.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.is_empty() {
            Err(QueryError::Empty)
        } else {
            Ok(())
        }
    }

    /// A stable string identity for this query: clauses sorted lexicographically by type,
    /// filters traversed in a fixed pre-order. Two queries describing the same event set
    /// (even if built with clauses in a different order) produce the same canonical key.
    ///
    /// Used only as the seed for the advisory-lock identity in
    /// [`Query::advisory_lock_key`]; it is not meant to be parsed back into a `Query`.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        let mut clauses = self.clauses.clone();
        clauses.sort_by(|a, b| a.event_type.cmp(&b.event_type));

        let mut out = String::new();
        for clause in &clauses {
            out.push_str("T(");
            out.push_str(&clause.event_type);
            out.push(')');
            if let Some(filter) = &clause.filter {
                write_canonical_node(filter, &mut out);
            }
            out.push(';');
        }
        out
    }

    /// A 64-bit hash of [`Query::canonical_key`], used to key a Postgres advisory lock for
    /// the consistency boundary this query describes.
    ///
    /// Collisions are possible and accepted: two unrelated boundaries sharing a hash only
    /// cost some false serialization between unrelated writers, never correctness.
    #[must_use]
    pub fn advisory_lock_key(&self) -> i64 {
        let mut hasher = DefaultHasher::new();
        self.canonical_key().hash(&mut hasher);
        // Postgres advisory lock functions take a signed bigint; only the bit pattern
        // matters for lock identity, so reinterpreting the hash is not a correctness issue.
        #[allow(clippy::cast_possible_wrap)]
        let signed = hasher.finish() as i64;
        signed
    }

    /// Evaluate this query against a single event's type and payload, outside of SQL.
    ///
    /// Implements the same semantics [`crate::compiler`] compiles to `WHERE` clauses: an
    /// event matches iff it matches at least one clause (clauses combine with OR), and it
    /// matches a clause iff its type equals the clause's type and, if a filter is present,
    /// the filter evaluates true against `payload`. Used by in-memory store fakes that have
    /// no SQL engine to delegate to.
    #[must_use]
    pub fn matches(&self, event_type: &str, payload: &serde_json::Value) -> bool {
        self.clauses
            .iter()
            .any(|clause| clause.matches(event_type, payload))
    }
}

impl Clause {
    /// Whether this clause matches an event with the given type and payload.
    #[must_use]
    pub fn matches(&self, event_type: &str, payload: &serde_json::Value) -> bool {
        self.event_type == event_type
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter.matches(payload))
    }
}

impl FilterNode {
    /// Whether this filter evaluates true against `payload`.
    ///
    /// `Attr` mirrors Postgres's `payload @> {key: value}` JSON containment: true when
    /// `payload` is an object containing `key` with a value that contains `value` (nested
    /// objects/arrays recurse; scalars compare equal).
    #[must_use]
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        match self {
            Self::Attr { key, value } => payload
                .get(key)
                .is_some_and(|found| json_contains(found, value)),
            Self::And(children) => children.iter().all(|child| child.matches(payload)),
            Self::Or(children) => children.iter().any(|child| child.matches(payload)),
        }
    }
}

/// Whether `container` JSON-contains `containee`, mirroring Postgres's `@>` operator:
/// objects contain when every key of `containee` is present in `container` with a
/// containing value; arrays contain when every element of `containee` is present
/// (order-independent) in `container`; scalars contain only when equal.
fn json_contains(container: &serde_json::Value, containee: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (container, containee) {
        (Value::Object(outer), Value::Object(inner)) => inner.iter().all(|(key, value)| {
            outer
                .get(key)
                .is_some_and(|found| json_contains(found, value))
        }),
        (Value::Array(outer), Value::Array(inner)) => inner
            .iter()
            .all(|item| outer.iter().any(|candidate| json_contains(candidate, item))),
        _ => container == containee,
    }
}

fn combine(existing: Option<FilterNode>, new: FilterNode, is_and: bool) -> FilterNode {
    match existing {
        None => new,
        Some(FilterNode::And(mut children)) if is_and => {
            children.push(new);
            FilterNode::And(children)
        }
        Some(FilterNode::Or(mut children)) if !is_and => {
            children.push(new);
            FilterNode::Or(children)
        }
        Some(other) => {
            if is_and {
                FilterNode::And(vec![other, new])
            } else {
                FilterNode::Or(vec![other, new])
            }
        }
    }
}

fn write_canonical_node(node: &FilterNode, out: &mut String) {
    match node {
        FilterNode::Attr { key, value } => {
            out.push_str("A(");
            out.push_str(key);
            out.push('=');
            out.push_str(&serde_json::to_string(value).unwrap_or_default());
            out.push(')');
        }
        FilterNode::And(children) => {
            out.push_str("AND[");
            for child in children {
                write_canonical_node(child, out);
                out.push(',');
            }
            out.push(']');
        }
        FilterNode::Or(children) => {
            out.push_str("OR[");
            for child in children {
                write_canonical_node(child, out);
                out.push(',');
            }
            out.push(']');
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_is_immutable() {
        let base = Query::new().events_of_type("OrderPlaced");
        let before = base.clone();
        let _derived = base.clone().where_(key("order_id").equals(json!(1)));
        assert_eq!(base, before);
    }

    #[test]
    fn events_of_type_appends_clause_with_no_filter() {
        let q = Query::new().events_of_type("OrderPlaced");
        assert_eq!(q.clauses().len(), 1);
        assert_eq!(q.clauses()[0].event_type(), "OrderPlaced");
        assert!(q.clauses()[0].filter().is_none());
    }

    #[test]
    fn where_replaces_existing_filter() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("a").equals(json!(1)))
            .where_(key("b").equals(json!(2)));

        assert_eq!(
            q.clauses()[0].filter(),
            Some(&key("b").equals(json!(2)))
        );
    }

    #[test]
    fn and_flattens_repeated_calls() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("a").equals(json!(1)))
            .and(key("b").equals(json!(2)))
            .and(key("c").equals(json!(3)));

        match q.clauses()[0].filter() {
            Some(FilterNode::And(children)) => assert_eq!(children.len(), 3),
            other => panic!("expected flattened And, got {other:?}"),
        }
    }

    #[test]
    fn or_flattens_repeated_calls() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("a").equals(json!(1)))
            .or(key("b").equals(json!(2)))
            .or(key("c").equals(json!(3)));

        match q.clauses()[0].filter() {
            Some(FilterNode::Or(children)) => assert_eq!(children.len(), 3),
            other => panic!("expected flattened Or, got {other:?}"),
        }
    }

    #[test]
    fn mixed_and_or_nests_instead_of_flattening() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("a").equals(json!(1)))
            .and(key("b").equals(json!(2)))
            .or(key("c").equals(json!(3)));

        match q.clauses()[0].filter() {
            Some(FilterNode::Or(children)) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], FilterNode::And(_)));
            }
            other => panic!("expected outer Or wrapping inner And, got {other:?}"),
        }
    }

    #[test]
    fn and_or_on_fresh_clause_behaves_like_where() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .and(key("a").equals(json!(1)));
        assert_eq!(q.clauses()[0].filter(), Some(&key("a").equals(json!(1))));
    }

    #[test]
    fn canonical_key_ignores_clause_order() {
        let q1 = Query::new()
            .events_of_type("A")
            .events_of_type("B");
        let q2 = Query::new()
            .events_of_type("B")
            .events_of_type("A");
        assert_eq!(q1.canonical_key(), q2.canonical_key());
    }

    #[test]
    fn canonical_key_differs_on_filter_value() {
        let q1 = Query::new()
            .events_of_type("A")
            .where_(key("k").equals(json!(1)));
        let q2 = Query::new()
            .events_of_type("A")
            .where_(key("k").equals(json!(2)));
        assert_ne!(q1.canonical_key(), q2.canonical_key());
    }

    #[test]
    fn advisory_lock_key_is_deterministic() {
        let q = Query::new().events_of_type("A");
        assert_eq!(q.advisory_lock_key(), q.clone().advisory_lock_key());
    }

    #[test]
    fn validate_rejects_empty_query() {
        assert_eq!(Query::new().validate(), Err(QueryError::Empty));
        assert!(Query::new().events_of_type("A").validate().is_ok());
    }

    #[test]
    fn matches_requires_type_and_filter() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("order_id").equals(json!("o-1")));

        assert!(q.matches("OrderPlaced", &json!({ "order_id": "o-1", "total": 9 })));
        assert!(!q.matches("OrderPlaced", &json!({ "order_id": "o-2" })));
        assert!(!q.matches("OrderCancelled", &json!({ "order_id": "o-1" })));
    }

    #[test]
    fn matches_clause_without_filter_matches_any_payload() {
        let q = Query::new().events_of_type("Ping");
        assert!(q.matches("Ping", &json!({})));
        assert!(q.matches("Ping", &json!({ "anything": true })));
    }

    #[test]
    fn matches_combines_clauses_with_or() {
        let q = Query::new()
            .events_of_type("A")
            .events_of_type("B");
        assert!(q.matches("A", &json!({})));
        assert!(q.matches("B", &json!({})));
        assert!(!q.matches("C", &json!({})));
    }

    #[test]
    fn matches_nested_and_or_filters() {
        let q = Query::new()
            .events_of_type("X")
            .where_(key("s").equals(json!("p")))
            .or(key("s").equals(json!("a")));

        assert!(q.matches("X", &json!({ "s": "p" })));
        assert!(q.matches("X", &json!({ "s": "a" })));
        assert!(!q.matches("X", &json!({ "s": "c" })));
    }

    #[test]
    fn matches_falsy_attribute_values() {
        let q = Query::new().events_of_type("A").where_(key("k").equals(json!(false)));
        assert!(q.matches("A", &json!({ "k": false })));
        assert!(!q.matches("A", &json!({ "k": true })));
        assert!(!q.matches("A", &json!({ "k": 0 })));
    }

    #[test]
    fn matches_nested_document_containment() {
        let q = Query::new()
            .events_of_type("A")
            .where_(key("addr").equals(json!({ "city": "Berlin" })));
        assert!(q.matches("A", &json!({ "addr": { "city": "Berlin", "zip": "10115" } })));
        assert!(!q.matches("A", &json!({ "addr": { "city": "Paris" } })));
    }

    #[test]
    fn falsy_json_values_round_trip_through_canonical_key() {
        let with_null = Query::new().events_of_type("A").where_(key("k").equals(json!(null)));
        let with_false = Query::new().events_of_type("A").where_(key("k").equals(json!(false)));
        let with_zero = Query::new().events_of_type("A").where_(key("k").equals(json!(0)));

        assert_ne!(with_null.canonical_key(), with_false.canonical_key());
        assert_ne!(with_false.canonical_key(), with_zero.canonical_key());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn event_type_strategy() -> impl Strategy<Value = String> {
        "[A-Z][a-zA-Z]{2,15}"
    }

    fn attr_value_strategy() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            any::<bool>().prop_map(|b| json!(b)),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z]{1,10}".prop_map(|s| json!(s)),
        ]
    }

    proptest! {
        /// `events_of_type`/`where_`/`and`/`or` never mutate the receiver: the original
        /// builder must still report the clause count it had before the call, matching the
        /// module doc's claim that any `Query` you hold is safe to branch from.
        #[test]
        fn builder_methods_never_mutate_the_receiver(
            event_type in event_type_strategy(),
            attr in "[a-z]{1,8}",
            value in attr_value_strategy(),
        ) {
            let base = Query::new().events_of_type(&event_type);
            let clause_count_before = base.clauses().len();

            let _extended = base.clone().where_(key(&attr).equals(value.clone()));
            prop_assert_eq!(base.clauses().len(), clause_count_before);

            let _with_more_types = base.clone().events_of_type("SomethingElse");
            prop_assert_eq!(base.clauses().len(), clause_count_before);
        }

        /// Two queries built from the same sequence of calls always compile to the same
        /// canonical key, since the compiler hashes that key to derive a boundary's advisory
        /// lock identity — a query that means the same boundary must always lock the same key.
        #[test]
        fn equivalent_builder_sequences_share_a_canonical_key(
            event_type in event_type_strategy(),
            attr in "[a-z]{1,8}",
            value in attr_value_strategy(),
        ) {
            let a = Query::new().events_of_type(&event_type).where_(key(&attr).equals(value.clone()));
            let b = Query::new().events_of_type(&event_type).where_(key(&attr).equals(value));
            prop_assert_eq!(a.canonical_key(), b.canonical_key());
        }

        /// A query always matches an event built from exactly its own event type and an
        /// attribute equality it declared — the predicate [`Query::matches`] and the SQL the
        /// compiler emits must agree on this for every value `serde_json` can represent.
        #[test]
        fn matches_its_own_event_type_and_attribute(
            event_type in event_type_strategy(),
            attr in "[a-z]{1,8}",
            value in attr_value_strategy(),
        ) {
            let q = Query::new().events_of_type(&event_type).where_(key(&attr).equals(value.clone()));
            let payload = json!({ attr: value });
            prop_assert!(q.matches(&event_type, &payload));
        }

        /// A query never matches an event of a different type, regardless of payload.
        #[test]
        fn never_matches_an_unrelated_event_type(
            event_type in event_type_strategy(),
            other_type in event_type_strategy(),
        ) {
            prop_assume!(event_type != other_type);
            let q = Query::new().events_of_type(&event_type);
            prop_assert!(!q.matches(&other_type, &json!({})));
        }
    }
}
