//! Compiles a [`Query`] into parameterised SQL.
//!
//! The compiler is database-agnostic in its output: [`CompiledQuery`] carries typed
//! [`QueryParam`] values rather than raw SQL literals, so the `composable-rust-core` crate
//! never depends on a database driver. The Postgres store binds the params positionally.
//!
//! Three compilation modes share one filter-to-SQL recursion with a single running
//! parameter counter, so numbering stays gap-free even when a mode appends extra
//! parameters (the position and limit bounds of [`compile_stream`]) after the clause
//! predicates.

use crate::query::{Clause, FilterNode, Query, QueryError};

/// Columns returned by the load and stream compilation modes, in the order
/// `composable-rust-postgres`'s row mapper expects them.
const EVENT_COLUMNS: &str = "global_position, event_id, type, payload, metadata, occurred_at";

/// A typed SQL parameter produced by the compiler.
///
/// Keeping these typed (rather than erasing to `serde_json::Value` or a driver-specific
/// type) lets the Postgres store bind each one with `sqlx`'s native encoding instead of
/// going through a JSON round trip for integers.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryParam {
    /// An event type string, bound against the `type` column.
    Type(String),
    /// A JSON containment fragment, bound against the `payload` column with `@>`.
    Json(serde_json::Value),
    /// A global position bound, used by the stream mode's keyset predicate.
    Position(u64),
    /// A row limit, used by the stream mode's page size.
    Limit(i64),
}

/// The SQL text and parameters produced by compiling a [`Query`].
///
/// Parameters are ordered to match `$1, $2, ...` placeholders in `sql`.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledQuery {
    /// The compiled SQL statement, with `$n` placeholders.
    pub sql: String,
    /// The parameters to bind, in placeholder order.
    pub params: Vec<QueryParam>,
}

/// Compile a full-history load: `SELECT ... WHERE <clauses> ORDER BY global_position ASC`.
///
/// # Errors
///
/// Returns `QueryError::Empty` if `query` has no clauses.
pub fn compile_load(query: &Query) -> Result<CompiledQuery, QueryError> {
    query.validate()?;
    let mut counter = 0;
    let mut params = Vec::new();
    let predicate = compile_clauses(query, &mut counter, &mut params);
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE {predicate} ORDER BY global_position ASC"
    );
    Ok(CompiledQuery { sql, params })
}

/// Compile a version check: the greatest `global_position` among matching events, or 0 if
/// none match. Used inside the append transaction's optimistic concurrency check.
///
/// # Errors
///
/// Returns `QueryError::Empty` if `query` has no clauses.
pub fn compile_version_check(query: &Query) -> Result<CompiledQuery, QueryError> {
    query.validate()?;
    let mut counter = 0;
    let mut params = Vec::new();
    let predicate = compile_clauses(query, &mut counter, &mut params);
    let sql =
        format!("SELECT COALESCE(MAX(global_position), 0) AS max_pos FROM events WHERE {predicate}");
    Ok(CompiledQuery { sql, params })
}

/// Compile a keyset-paginated page: matching events strictly after `after_position`,
/// ordered ascending, limited to `batch_size` rows.
///
/// # Errors
///
/// Returns `QueryError::Empty` if `query` has no clauses.
pub fn compile_stream(
    query: &Query,
    after_position: u64,
    batch_size: i64,
) -> Result<CompiledQuery, QueryError> {
    query.validate()?;
    let mut counter = 0;
    let mut params = Vec::new();
    let predicate = compile_clauses(query, &mut counter, &mut params);

    counter += 1;
    params.push(QueryParam::Position(after_position));
    let position_param = counter;

    counter += 1;
    params.push(QueryParam::Limit(batch_size));
    let limit_param = counter;

    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE ({predicate}) AND global_position > ${position_param} ORDER BY global_position ASC LIMIT ${limit_param}"
    );
    Ok(CompiledQuery { sql, params })
}

/// Compile the disjunction of every clause in `query`, advancing `counter`/`params` for
/// each parameter consumed.
fn compile_clauses(query: &Query, counter: &mut usize, params: &mut Vec<QueryParam>) -> String {
    let clause_sqls: Vec<String> = query
        .clauses()
        .iter()
        .map(|clause| compile_clause(clause, counter, params))
        .collect();

    if clause_sqls.len() == 1 {
        clause_sqls.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", clause_sqls.join(" OR "))
    }
}

fn compile_clause(clause: &Clause, counter: &mut usize, params: &mut Vec<QueryParam>) -> String {
    *counter += 1;
    params.push(QueryParam::Type(clause.event_type().to_string()));
    let type_predicate = format!("type = ${counter}");

    match clause.filter() {
        None => type_predicate,
        Some(filter) => {
            let filter_predicate = compile_filter(filter, counter, params);
            format!("({type_predicate} AND {filter_predicate})")
        }
    }
}

fn compile_filter(node: &FilterNode, counter: &mut usize, params: &mut Vec<QueryParam>) -> String {
    match node {
        FilterNode::Attr { key, value } => {
            *counter += 1;
            params.push(QueryParam::Json(serde_json::json!({ key: value })));
            format!("payload @> ${counter}::jsonb")
        }
        FilterNode::And(children) => {
            let parts: Vec<String> = children
                .iter()
                .map(|child| compile_filter(child, counter, params))
                .collect();
            format!("({})", parts.join(" AND "))
        }
        FilterNode::Or(children) => {
            let parts: Vec<String> = children
                .iter()
                .map(|child| compile_filter(child, counter, params))
                .collect();
            format!("({})", parts.join(" OR "))
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::query::key;
    use serde_json::json;

    #[test]
    fn single_clause_without_filter() {
        let q = Query::new().events_of_type("OrderPlaced");
        let compiled = compile_load(&q).expect("non-empty query compiles");
        assert!(compiled.sql.contains("WHERE type = $1"));
        assert_eq!(compiled.params, vec![QueryParam::Type("OrderPlaced".into())]);
    }

    #[test]
    fn single_clause_with_filter_ands_type_and_payload() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("order_id").equals(json!("o-1")));
        let compiled = compile_load(&q).expect("non-empty query compiles");
        assert!(compiled.sql.contains("type = $1"));
        assert!(compiled.sql.contains("payload @> $2::jsonb"));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn multi_clause_disjunction() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .events_of_type("OrderCancelled");
        let compiled = compile_load(&q).expect("non-empty query compiles");
        assert!(compiled.sql.contains("type = $1"));
        assert!(compiled.sql.contains("type = $2"));
        assert!(compiled.sql.contains(" OR "));
    }

    #[test]
    fn version_check_uses_coalesce_max() {
        let q = Query::new().events_of_type("OrderPlaced");
        let compiled = compile_version_check(&q).expect("non-empty query compiles");
        assert!(compiled.sql.starts_with("SELECT COALESCE(MAX(global_position), 0)"));
    }

    #[test]
    fn stream_params_are_gap_free_after_clause_params() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("order_id").equals(json!("o-1")));
        let compiled = compile_stream(&q, 42, 100).expect("non-empty query compiles");
        // clause consumes $1 (type) and $2 (payload); position/limit must be $3/$4.
        assert!(compiled.sql.contains("global_position > $3"));
        assert!(compiled.sql.contains("LIMIT $4"));
        assert_eq!(compiled.params.len(), 4);
        assert_eq!(compiled.params[2], QueryParam::Position(42));
        assert_eq!(compiled.params[3], QueryParam::Limit(100));
    }

    #[test]
    fn empty_query_is_rejected() {
        assert_eq!(compile_load(&Query::new()), Err(QueryError::Empty));
        assert_eq!(compile_version_check(&Query::new()), Err(QueryError::Empty));
        assert_eq!(compile_stream(&Query::new(), 0, 10), Err(QueryError::Empty));
    }

    #[test]
    fn nested_and_or_compile_with_parens() {
        let q = Query::new()
            .events_of_type("OrderPlaced")
            .where_(key("a").equals(json!(1)))
            .and(key("b").equals(json!(2)))
            .or(key("c").equals(json!(3)));
        let compiled = compile_load(&q).expect("non-empty query compiles");
        assert!(compiled.sql.contains("AND"));
        assert!(compiled.sql.contains("OR"));
    }
}
