use super::ParseError;
use super::ast::{Field, Node};
use super::lexer::Token;
use crate::models::log::Level;

/// Literal fragments known to blow up backtracking engines. Patterns
/// containing any of these are rejected outright.
const REGEX_DENYLIST: [&str; 5] = ["(a+)+", "(a*)*", "(a+)*", "(a|a)+", "(a|ab)+"];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

pub fn parse_tokens(tokens: Vec<Token>) -> Result<Node, ParseError> {
    let mut p = Parser { tokens, pos: 0 };
    let node = p.or_expr()?;
    match p.peek() {
        None => Ok(node),
        Some(Token::RParen) => Err(ParseError::UnmatchedParen),
        Some(other) => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Node, ParseError> {
        let mut node = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let rhs = self.and_expr()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn and_expr(&mut self) -> Result<Node, ParseError> {
        let mut node = self.not_expr()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let rhs = self.not_expr()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn not_expr(&mut self) -> Result<Node, ParseError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            let child = self.primary()?;
            return Ok(Node::Not(Box::new(child)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, ParseError> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError::UnmatchedParen),
                }
            }
            Some(Token::RParen) => Err(ParseError::UnmatchedParen),
            Some(Token::And | Token::Or | Token::Not) => Err(ParseError::DanglingOperator),
            Some(Token::Regex { pattern, flags }) => {
                validate_regex(&pattern)?;
                let pattern = if flags.contains('i') {
                    format!("(?i){pattern}")
                } else {
                    pattern
                };
                Ok(Node::Regex(Field::Message, pattern))
            }
            Some(Token::Quoted(text)) => Ok(Node::FieldContains(Field::Message, text)),
            Some(Token::Word(word)) => {
                if matches!(self.peek(), Some(Token::Colon)) {
                    self.bump();
                    self.field_expr(&word)
                } else {
                    Ok(Node::FieldContains(Field::Message, word))
                }
            }
            Some(Token::Colon) => Err(ParseError::MissingValue),
            None => Err(ParseError::DanglingOperator),
        }
    }

    fn field_expr(&mut self, name: &str) -> Result<Node, ParseError> {
        let field =
            Field::resolve(name).ok_or_else(|| ParseError::InvalidField(name.to_string()))?;
        let value = match self.bump() {
            Some(Token::Word(v)) => v,
            Some(Token::Quoted(v)) => v,
            _ => return Err(ParseError::MissingValue),
        };

        match field {
            Field::Level => {
                let level =
                    Level::parse(&value).ok_or_else(|| ParseError::InvalidLevel(value.clone()))?;
                Ok(Node::FieldEq(Field::Level, level.as_str().to_string()))
            }
            Field::Message => Ok(Node::FieldContains(Field::Message, value)),
            other => Ok(Node::FieldEq(other, value)),
        }
    }
}

/// Reject patterns from the denylist or of the nested-quantifier shape, then
/// require the pattern to compile.
fn validate_regex(pattern: &str) -> Result<(), ParseError> {
    for denied in REGEX_DENYLIST {
        if pattern.contains(denied) {
            return Err(ParseError::CatastrophicRegex);
        }
    }
    if has_catastrophic_shape(pattern) {
        return Err(ParseError::CatastrophicRegex);
    }
    regex::Regex::new(pattern).map_err(|e| ParseError::InvalidRegex(e.to_string()))?;
    Ok(())
}

/// Detect `(…+…)+`-style nesting and `(X|X…)+` duplicate alternations
/// without building the full pattern grammar: track groups and, when one
/// closes directly into a quantifier, inspect what it contained.
fn has_catastrophic_shape(pattern: &str) -> bool {
    let chars: Vec<char> = pattern.chars().collect();
    let mut stack: Vec<usize> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '(' => stack.push(i),
            ')' => {
                if let Some(start) = stack.pop() {
                    let quantified = matches!(chars.get(i + 1), Some('+' | '*'));
                    if quantified && group_is_dangerous(&chars[start + 1..i]) {
                        return true;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

fn group_is_dangerous(body: &[char]) -> bool {
    // A quantifier inside a quantified group nests repetition.
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            '\\' => i += 1,
            '+' | '*' => return true,
            _ => {}
        }
        i += 1;
    }

    // Duplicate/prefix alternation branches, e.g. (a|a) or (a|ab).
    let text: String = body.iter().collect();
    if text.contains('|') {
        let branches: Vec<&str> = text.split('|').collect();
        for (i, a) in branches.iter().enumerate() {
            for b in branches.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parse;

    #[test]
    fn test_precedence_or_lowest() {
        // a OR b AND c == a OR (b AND c)
        let node = parse("alpha OR beta AND gamma").unwrap();
        assert_eq!(
            node,
            Node::Or(
                Box::new(Node::FieldContains(Field::Message, "alpha".into())),
                Box::new(Node::And(
                    Box::new(Node::FieldContains(Field::Message, "beta".into())),
                    Box::new(Node::FieldContains(Field::Message, "gamma".into())),
                )),
            )
        );
    }

    #[test]
    fn test_not_binds_tightest() {
        let node = parse("NOT level:debug AND service:portal").unwrap();
        assert_eq!(
            node,
            Node::And(
                Box::new(Node::Not(Box::new(Node::FieldEq(
                    Field::Level,
                    "debug".into()
                )))),
                Box::new(Node::FieldEq(Field::Service, "portal".into())),
            )
        );
    }

    #[test]
    fn test_parens_override() {
        let node = parse("(alpha OR beta) AND gamma").unwrap();
        assert!(matches!(node, Node::And(_, _)));
    }

    #[test]
    fn test_field_aliases_in_expr() {
        assert_eq!(
            parse("svc:api").unwrap(),
            Node::FieldEq(Field::Service, "api".into())
        );
        assert_eq!(
            parse("MSG:timeout").unwrap(),
            Node::FieldContains(Field::Message, "timeout".into())
        );
    }

    #[test]
    fn test_level_value_normalized() {
        assert_eq!(
            parse("level:ERROR").unwrap(),
            Node::FieldEq(Field::Level, "error".into())
        );
    }

    #[test]
    fn test_fatal_is_a_level() {
        assert_eq!(
            parse("level:fatal").unwrap(),
            Node::FieldEq(Field::Level, "fatal".into())
        );
    }

    #[test]
    fn test_quoted_free_text() {
        assert_eq!(
            parse("\"connection refused\"").unwrap(),
            Node::FieldContains(Field::Message, "connection refused".into())
        );
    }

    #[test]
    fn test_dangling_not() {
        assert_eq!(parse("NOT"), Err(ParseError::DanglingOperator));
    }

    #[test]
    fn test_leading_operator() {
        assert_eq!(parse("AND service:a"), Err(ParseError::DanglingOperator));
    }

    #[test]
    fn test_stray_close_paren() {
        assert_eq!(parse("service:a)"), Err(ParseError::UnmatchedParen));
    }

    #[test]
    fn test_adjacent_terms_need_operator() {
        assert!(matches!(
            parse("alpha beta"),
            Err(ParseError::UnexpectedToken(_))
        ));
    }

    #[test]
    fn test_regex_case_insensitive_flag() {
        assert_eq!(
            parse("/timeout/i").unwrap(),
            Node::Regex(Field::Message, "(?i)timeout".into())
        );
    }

    #[test]
    fn test_nested_quantifier_variants_rejected() {
        for bad in ["/(b+)+/", "/(xy*)+/", "/see (ab|ab)+ here/"] {
            assert_eq!(parse(bad), Err(ParseError::CatastrophicRegex), "{bad}");
        }
    }

    #[test]
    fn test_safe_alternation_allowed() {
        // Distinct branches are fine.
        assert!(parse("/(error|panic)+/").is_ok());
        assert!(parse("/time.?out/").is_ok());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(matches!(parse("/[unclosed/"), Err(ParseError::InvalidRegex(_))));
    }
}
