//! Tokenizer for filter expressions

use super::FilterError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
}

/// A token and the byte offset where it starts
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = match c {
            '(' => single(&mut chars, Token::LParen),
            ')' => single(&mut chars, Token::RParen),
            '[' => single(&mut chars, Token::LBracket),
            ']' => single(&mut chars, Token::RBracket),
            ',' => single(&mut chars, Token::Comma),
            '+' => single(&mut chars, Token::Plus),
            '-' => single(&mut chars, Token::Minus),
            '*' => single(&mut chars, Token::Star),
            '/' => single(&mut chars, Token::Slash),
            '=' => {
                chars.next();
                // A lone `=` is accepted as equality
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                }
                Token::Eq
            }
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    Token::NotEq
                } else {
                    Token::Bang
                }
            }
            '<' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        if c == '&' {
                            Token::AndAnd
                        } else {
                            Token::OrOr
                        }
                    }
                    _ => {
                        return Err(FilterError::Syntax {
                            pos,
                            message: format!("expected '{c}{c}'"),
                        })
                    }
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == c => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, escaped)) => text.push(escaped),
                            None => {
                                return Err(FilterError::Syntax {
                                    pos,
                                    message: "unterminated string".to_string(),
                                })
                            }
                        },
                        Some((_, ch)) => text.push(ch),
                        None => {
                            return Err(FilterError::Syntax {
                                pos,
                                message: "unterminated string".to_string(),
                            })
                        }
                    }
                }
                Token::Str(text)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = pos;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' || ch == '_' {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text: String = input[pos..end].chars().filter(|c| *c != '_').collect();
                let value = text.parse().map_err(|_| FilterError::Syntax {
                    pos,
                    message: format!("invalid number {:?}", &input[pos..end]),
                })?;
                Token::Number(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = pos;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(input[pos..end].to_string())
            }
            other => {
                return Err(FilterError::Syntax {
                    pos,
                    message: format!("unexpected character {other:?}"),
                })
            }
        };

        tokens.push(Spanned { token, pos });
    }

    Ok(tokens)
}

fn single(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, token: Token) -> Token {
    chars.next();
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("== != < <= > >= && || ! ="),
            vec![
                Token::Eq,
                Token::NotEq,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::AndAnd,
                Token::OrOr,
                Token::Bang,
                Token::Eq,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"Status 404 0.25 "a\"b" 'c'"#),
            vec![
                Token::Ident("Status".to_string()),
                Token::Number(404.0),
                Token::Number(0.25),
                Token::Str("a\"b".to_string()),
                Token::Str("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("Uri  == 'x'").unwrap();
        let positions: Vec<_> = tokens.iter().map(|t| t.pos).collect();
        assert_eq!(positions, vec![0, 5, 8]);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            tokenize("Uri == 'open"),
            Err(FilterError::Syntax { pos: 7, .. })
        ));
        assert!(matches!(
            tokenize("a & b"),
            Err(FilterError::Syntax { pos: 2, .. })
        ));
        assert!(matches!(
            tokenize("Status # 1"),
            Err(FilterError::Syntax { pos: 7, .. })
        ));
        assert!(tokenize("1.2.3").is_err());
    }

    #[test]
    fn test_trailing_backslash_in_string() {
        let err = tokenize("Uri == 'abc\\").unwrap_err();
        assert!(matches!(err, FilterError::Syntax { pos: 7, .. }));
        assert!(err.to_string().contains("unterminated string"));
    }
}
