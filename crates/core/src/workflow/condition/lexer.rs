use super::ConditionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Split a condition into tokens, paired with their byte offsets.
pub(crate) fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = pos;
            let mut is_float = false;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '_' {
                    end = i + d.len_utf8();
                    chars.next();
                } else if d == '.' && !is_float {
                    is_float = true;
                    end = i + 1;
                    chars.next();
                } else {
                    break;
                }
            }
            let text: String = source[pos..end].chars().filter(|ch| *ch != '_').collect();
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| ConditionError::Lex {
                    pos,
                    message: format!("invalid number '{}'", text),
                })?)
            } else {
                Token::Int(text.parse().map_err(|_| ConditionError::Lex {
                    pos,
                    message: format!("integer '{}' out of range", text),
                })?)
            };
            tokens.push((pos, token));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut end = pos;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    end = i + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((pos, Token::Ident(source[pos..end].to_string())));
            continue;
        }

        if c == '\'' || c == '"' {
            chars.next();
            let quote = c;
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, d)) = chars.next() {
                match d {
                    '\\' => {
                        let (_, escaped) = chars.next().ok_or(ConditionError::Lex {
                            pos,
                            message: "unterminated string".to_string(),
                        })?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                    }
                    d if d == quote => {
                        closed = true;
                        break;
                    }
                    d => text.push(d),
                }
            }
            if !closed {
                return Err(ConditionError::Lex {
                    pos,
                    message: "unterminated string".to_string(),
                });
            }
            tokens.push((pos, Token::Str(text)));
            continue;
        }

        chars.next();
        let next = chars.peek().map(|&(_, d)| d);
        let token = match (c, next) {
            ('=', Some('=')) => {
                chars.next();
                Token::EqEq
            }
            ('!', Some('=')) => {
                chars.next();
                Token::NotEq
            }
            ('<', Some('=')) => {
                chars.next();
                Token::Le
            }
            ('>', Some('=')) => {
                chars.next();
                Token::Ge
            }
            ('<', _) => Token::Lt,
            ('>', _) => Token::Gt,
            ('(', _) => Token::LParen,
            (')', _) => Token::RParen,
            ('[', _) => Token::LBracket,
            (']', _) => Token::RBracket,
            (',', _) => Token::Comma,
            ('.', _) => Token::Dot,
            ('+', _) => Token::Plus,
            ('-', _) => Token::Minus,
            ('*', _) => Token::Star,
            ('/', _) => Token::Slash,
            ('%', _) => Token::Percent,
            _ => {
                return Err(ConditionError::Lex {
                    pos,
                    message: format!("unexpected character '{}'", c),
                })
            }
        };
        tokens.push((pos, token));
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|(_, t)| t).collect()
    }

    #[test]
    fn test_subscript_comparison() {
        assert_eq!(
            kinds("state['x'] >= 5"),
            vec![
                Token::Ident("state".into()),
                Token::LBracket,
                Token::Str("x".into()),
                Token::RBracket,
                Token::Ge,
                Token::Int(5),
            ]
        );
    }

    #[test]
    fn test_numbers_and_strings() {
        assert_eq!(
            kinds(r#"2.5 1_000 "a\"b""#),
            vec![Token::Float(2.5), Token::Int(1000), Token::Str("a\"b".into())]
        );
    }

    #[test]
    fn test_rejects_assignment_and_unterminated_strings() {
        assert!(matches!(tokenize("x = 1"), Err(ConditionError::Lex { pos: 2, .. })));
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a ; b").is_err());
    }
}
