//! The log query language: `field:value` terms, AND/OR/NOT, parentheses,
//! quoted strings, free text, and safe regex literals.
//!
//! `parse` produces an AST, `optimize` normalizes it, and `lower` turns it
//! into a parameterized SQL fragment. User values never reach SQL text.

pub mod ast;
pub mod lexer;
pub mod lower;
mod parser;

pub use ast::{Field, Node, optimize};
pub use lower::{SqlParam, SqlPredicate, lower};

/// Whole-input character limit.
pub const MAX_QUERY_LEN: usize = 10_000;
/// Per-quoted-value character limit.
pub const MAX_VALUE_LEN: usize = 1_000;

/// Classified parse failure. `code()` is the stable machine-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    TooLongQuery,
    TooLongValue,
    UnmatchedQuote,
    UnmatchedParen,
    UnclosedRegex,
    DanglingOperator,
    MissingValue,
    InvalidLevel(String),
    InvalidField(String),
    CatastrophicRegex,
    InvalidRegex(String),
    EmptyQuery,
    UnexpectedToken(String),
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::TooLongQuery => "too-long-query",
            ParseError::TooLongValue => "too-long-value",
            ParseError::UnmatchedQuote => "unmatched-quote",
            ParseError::UnmatchedParen => "unmatched-paren",
            ParseError::UnclosedRegex => "unclosed-regex",
            ParseError::DanglingOperator => "dangling-operator",
            ParseError::MissingValue => "missing-value",
            ParseError::InvalidLevel(_) => "invalid-level",
            ParseError::InvalidField(_) => "invalid-field",
            ParseError::CatastrophicRegex => "catastrophic-regex",
            ParseError::InvalidRegex(_) => "invalid-regex",
            ParseError::EmptyQuery => "empty-query",
            ParseError::UnexpectedToken(_) => "unexpected-token",
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::TooLongQuery => {
                write!(f, "too-long-query: input exceeds {MAX_QUERY_LEN} characters")
            }
            ParseError::TooLongValue => {
                write!(f, "too-long-value: quoted value exceeds {MAX_VALUE_LEN} characters")
            }
            ParseError::UnmatchedQuote => write!(f, "unmatched-quote: string literal never closed"),
            ParseError::UnmatchedParen => write!(f, "unmatched-paren: unbalanced parentheses"),
            ParseError::UnclosedRegex => write!(f, "unclosed-regex: regex literal never closed"),
            ParseError::DanglingOperator => {
                write!(f, "dangling-operator: operator without an operand")
            }
            ParseError::MissingValue => write!(f, "missing-value: field expression has no value"),
            ParseError::InvalidLevel(v) => write!(f, "invalid-level: {v:?} is not a log level"),
            ParseError::InvalidField(v) => write!(f, "invalid-field: unknown field {v:?}"),
            ParseError::CatastrophicRegex => {
                write!(f, "catastrophic-regex: pattern risks catastrophic backtracking")
            }
            ParseError::InvalidRegex(e) => write!(f, "invalid-regex: {e}"),
            ParseError::EmptyQuery => write!(f, "empty-query: nothing to parse"),
            ParseError::UnexpectedToken(t) => write!(f, "unexpected-token: {t:?}"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for crate::error::Error {
    fn from(e: ParseError) -> Self {
        crate::error::Error::Validation(e.to_string())
    }
}

/// Parse a query string into its AST.
pub fn parse(input: &str) -> Result<Node, ParseError> {
    if input.chars().count() > MAX_QUERY_LEN {
        return Err(ParseError::TooLongQuery);
    }
    let tokens = lexer::lex(input)?;
    if tokens.is_empty() {
        return Err(ParseError::EmptyQuery);
    }
    parser::parse_tokens(tokens)
}

/// Parse, optimize, and lower in one step: the shape the store consumes.
pub fn compile(input: &str) -> Result<SqlPredicate, ParseError> {
    let node = optimize(parse(input)?);
    Ok(lower(&node))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_conjunction_ast() {
        let node = parse("service:portal AND (level:error OR level:warn)").unwrap();
        assert_eq!(
            node,
            Node::And(
                Box::new(Node::FieldEq(Field::Service, "portal".into())),
                Box::new(Node::Or(
                    Box::new(Node::FieldEq(Field::Level, "error".into())),
                    Box::new(Node::FieldEq(Field::Level, "warn".into())),
                )),
            )
        );
    }

    #[test]
    fn test_missing_value() {
        assert_eq!(parse("message:"), Err(ParseError::MissingValue));
    }

    #[test]
    fn test_catastrophic_regex_rejected() {
        assert_eq!(parse("/(a+)+/"), Err(ParseError::CatastrophicRegex));
        assert_eq!(parse("/x(a|a)+y/"), Err(ParseError::CatastrophicRegex));
    }

    #[test]
    fn test_too_long_query() {
        let input = "a".repeat(MAX_QUERY_LEN + 1);
        assert_eq!(parse(&input), Err(ParseError::TooLongQuery));
    }

    #[test]
    fn test_optimize_idempotent() {
        let inputs = [
            "service:portal AND service:portal",
            "level:error OR level:error OR level:error",
            "a OR (b OR a)",
            "NOT (service:portal AND service:portal)",
            "service:portal",
            "timeout AND service:api AND timeout",
        ];
        for input in inputs {
            let once = optimize(parse(input).unwrap());
            let twice = optimize(once.clone());
            assert_eq!(once, twice, "optimize not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(parse("message:").unwrap_err().code(), "missing-value");
        assert_eq!(parse("color:red").unwrap_err().code(), "invalid-field");
        assert_eq!(parse("level:loud").unwrap_err().code(), "invalid-level");
        assert_eq!(parse("(a OR b").unwrap_err().code(), "unmatched-paren");
        assert_eq!(parse("a AND").unwrap_err().code(), "dangling-operator");
        assert_eq!(parse("\"open").unwrap_err().code(), "unmatched-quote");
        assert_eq!(parse("/abc").unwrap_err().code(), "unclosed-regex");
        assert_eq!(parse("").unwrap_err().code(), "empty-query");
    }
}
