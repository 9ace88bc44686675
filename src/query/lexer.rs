use super::{MAX_VALUE_LEN, ParseError};

/// Lexical tokens of the query language. Operator keywords are recognized
/// uppercase-only so lowercase "and"/"or"/"not" stay searchable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    LParen,
    RParen,
    Colon,
    And,
    Or,
    Not,
    Word(String),
    Quoted(String),
    Regex { pattern: String, flags: String },
}

pub fn lex(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            '"' => {
                chars.next();
                tokens.push(Token::Quoted(read_quoted(&mut chars)?));
            }
            '/' => {
                chars.next();
                tokens.push(read_regex(&mut chars)?);
            }
            _ => {
                let word = read_word(&mut chars);
                tokens.push(match word.as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Word(word),
                });
            }
        }
    }

    Ok(tokens)
}

fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<String, ParseError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some('"') => break,
            Some('\\') => match chars.next() {
                Some(escaped @ ('"' | '\\')) => value.push(escaped),
                Some(other) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return Err(ParseError::UnmatchedQuote),
            },
            Some(c) => value.push(c),
            None => return Err(ParseError::UnmatchedQuote),
        }
        if value.chars().count() > MAX_VALUE_LEN {
            return Err(ParseError::TooLongValue);
        }
    }
    Ok(value)
}

fn read_regex(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<Token, ParseError> {
    let mut pattern = String::new();
    loop {
        match chars.next() {
            Some('/') => break,
            Some('\\') => match chars.next() {
                // An escaped slash is a literal slash in the pattern; any
                // other escape is passed through for the regex engine.
                Some('/') => pattern.push('/'),
                Some(other) => {
                    pattern.push('\\');
                    pattern.push(other);
                }
                None => return Err(ParseError::UnclosedRegex),
            },
            Some(c) => pattern.push(c),
            None => return Err(ParseError::UnclosedRegex),
        }
    }

    let mut flags = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_lowercase() {
            flags.push(c);
            chars.next();
        } else {
            break;
        }
    }

    Ok(Token::Regex { pattern, flags })
}

fn read_word(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || matches!(c, '(' | ')' | ':' | '"') {
            break;
        }
        word.push(c);
        chars.next();
    }
    word
}
