use chrono::{DateTime, Utc};
use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;

use super::ast::{Field, Node};

/// A lowered predicate: a SQL fragment over the `entries` table with `?`
/// placeholders and the values to bind, in order. User input never appears
/// in the fragment itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    pub clause: String,
    pub params: Vec<SqlParam>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => Ok(ToSqlOutput::from(s.as_str())),
            SqlParam::Int(i) => Ok(ToSqlOutput::from(*i)),
        }
    }
}

pub fn lower(node: &Node) -> SqlPredicate {
    let mut clause = String::new();
    let mut params = Vec::new();
    lower_node(node, &mut clause, &mut params);
    SqlPredicate { clause, params }
}

fn lower_node(node: &Node, clause: &mut String, params: &mut Vec<SqlParam>) {
    match node {
        Node::FieldEq(Field::Tags, value) => {
            clause.push_str(
                "EXISTS (SELECT 1 FROM json_each(context, '$.tags') WHERE json_each.value = ?)",
            );
            params.push(SqlParam::Text(value.clone()));
        }
        Node::FieldEq(Field::Id, value) => {
            clause.push_str("id = ?");
            // A non-numeric id can never match a rowid.
            params.push(SqlParam::Int(value.parse().unwrap_or(-1)));
        }
        Node::FieldEq(Field::CreatedAt, value) => {
            clause.push_str("timestamp = ?");
            params.push(SqlParam::Text(normalize_timestamp(value)));
        }
        Node::FieldEq(field, value) => {
            let column = field.column().expect("non-tags field has a column");
            clause.push_str(column);
            clause.push_str(" = ?");
            params.push(SqlParam::Text(value.clone()));
        }
        Node::FieldContains(Field::Message, value) => {
            clause.push_str("id IN (SELECT rowid FROM log_fts WHERE log_fts MATCH ?)");
            params.push(SqlParam::Text(fts_phrase(value)));
        }
        Node::FieldContains(field, value) => {
            let column = field.column().unwrap_or("message");
            clause.push_str("instr(");
            clause.push_str(column);
            clause.push_str(", ?) > 0");
            params.push(SqlParam::Text(value.clone()));
        }
        Node::Regex(field, pattern) => {
            let column = field.column().unwrap_or("message");
            clause.push_str(column);
            clause.push_str(" REGEXP ?");
            params.push(SqlParam::Text(pattern.clone()));
        }
        Node::And(l, r) => {
            clause.push('(');
            lower_node(l, clause, params);
            clause.push_str(" AND ");
            lower_node(r, clause, params);
            clause.push(')');
        }
        Node::Or(l, r) => {
            clause.push('(');
            lower_node(l, clause, params);
            clause.push_str(" OR ");
            lower_node(r, clause, params);
            clause.push(')');
        }
        Node::Not(child) => {
            clause.push_str("(NOT ");
            lower_node(child, clause, params);
            clause.push(')');
        }
    }
}

/// Quote a free-text term as an FTS5 phrase so user input is matched
/// literally rather than interpreted as FTS syntax.
fn fts_phrase(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// User-supplied timestamps arrive as RFC3339; stored timestamps are
/// fixed-width. Unparseable input is bound as-is and simply matches
/// nothing.
fn normalize_timestamp(value: &str) -> String {
    match DateTime::parse_from_rfc3339(value) {
        Ok(dt) => crate::store::format_timestamp(&dt.with_timezone(&Utc)),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compile;

    #[test]
    fn test_values_only_in_params() {
        let pred = compile("service:portal AND (level:error OR level:warn)").unwrap();
        assert_eq!(pred.clause, "(service = ? AND (level = ? OR level = ?))");
        assert_eq!(
            pred.params,
            vec![
                SqlParam::Text("portal".into()),
                SqlParam::Text("error".into()),
                SqlParam::Text("warn".into()),
            ]
        );
    }

    #[test]
    fn test_injection_attempt_stays_parameterized() {
        let pred = compile("service:\"x'; DROP TABLE entries;--\"").unwrap();
        assert_eq!(pred.clause, "service = ?");
        assert_eq!(
            pred.params,
            vec![SqlParam::Text("x'; DROP TABLE entries;--".into())]
        );
    }

    #[test]
    fn test_free_text_uses_fts() {
        let pred = compile("timeout").unwrap();
        assert_eq!(
            pred.clause,
            "id IN (SELECT rowid FROM log_fts WHERE log_fts MATCH ?)"
        );
        assert_eq!(pred.params, vec![SqlParam::Text("\"timeout\"".into())]);
    }

    #[test]
    fn test_fts_phrase_escapes_quotes() {
        let pred = compile("\"say \\\"hi\\\"\"").unwrap();
        assert_eq!(pred.params, vec![SqlParam::Text("\"say \"\"hi\"\"\"".into())]);
    }

    #[test]
    fn test_tags_membership() {
        let pred = compile("tags:billing").unwrap();
        assert!(pred.clause.contains("json_each(context, '$.tags')"));
        assert_eq!(pred.params, vec![SqlParam::Text("billing".into())]);
    }

    #[test]
    fn test_id_parses_to_int_param() {
        let pred = compile("id:42").unwrap();
        assert_eq!(pred.clause, "id = ?");
        assert_eq!(pred.params, vec![SqlParam::Int(42)]);
    }

    #[test]
    fn test_regex_lowering() {
        let pred = compile("/conn.*refused/").unwrap();
        assert_eq!(pred.clause, "message REGEXP ?");
        assert_eq!(pred.params, vec![SqlParam::Text("conn.*refused".into())]);
    }

    #[test]
    fn test_not_wraps_clause() {
        let pred = compile("NOT service:portal").unwrap();
        assert_eq!(pred.clause, "(NOT service = ?)");
    }
}
