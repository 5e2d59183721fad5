//! Recursive-descent parser producing the filter AST
//!
//! Precedence, loosest first: `||`, `&&`, `!`, comparisons (including `in`,
//! `matches`, `contains`, `startsWith`, `endsWith`), `+ -`, `* /`, unary `-`.

use super::lexer::{Spanned, Token};
use super::FilterError;
use crate::timeparse::parse_duration;
use chrono::TimeDelta;
use regex::Regex;

/// Record field referenced by an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Variable {
    Uri,
    Method,
    Time,
    ResponseTime,
    BodyBytes,
    Status,
}

impl Variable {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Uri" => Self::Uri,
            "Method" => Self::Method,
            "Time" => Self::Time,
            "ResponseTime" => Self::ResponseTime,
            "BodyBytes" => Self::BodyBytes,
            "Status" => Self::Status,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StrOp {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(Literal),
    Var(Variable),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Comparison where both sides are read as points in time
    TimeCompare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        negated: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `matches` with a literal pattern, compiled once
    Matches {
        lhs: Box<Expr>,
        regex: Regex,
    },
    /// `matches` with a computed pattern
    MatchesDynamic {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Str {
        op: StrOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Evaluation time minus a fixed duration
    TimeAgo(TimeDelta),
    BetweenTime {
        value: Box<Expr>,
        start: Box<Expr>,
        end: Box<Expr>,
    },
}

impl Expr {
    fn is_time(&self) -> bool {
        matches!(self, Expr::Var(Variable::Time) | Expr::TimeAgo(_))
    }
}

/// Deepest nesting of parentheses, lists, calls and prefix operators
const MAX_DEPTH: usize = 64;

pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    idx: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>, input_len: usize) -> Self {
        Self {
            tokens,
            idx: 0,
            end: input_len,
            depth: 0,
        }
    }

    /// Parse a complete expression, rejecting trailing tokens
    pub fn parse(mut self) -> Result<Expr, FilterError> {
        if self.tokens.is_empty() {
            return Err(self.error("empty expression"));
        }
        let expr = self.parse_or()?;
        if self.peek().is_some() {
            return Err(self.error("unexpected token"));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx).map(|s| &s.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.idx + offset).map(|s| &s.token)
    }

    fn pos(&self) -> usize {
        self.tokens.get(self.idx).map(|s| s.pos).unwrap_or(self.end)
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError::Syntax {
            pos: self.pos(),
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.idx).map(|s| s.token.clone());
        if token.is_some() {
            self.idx += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), FilterError> {
        if self.peek() == Some(&expected) {
            self.idx += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, FilterError>,
    ) -> Result<T, FilterError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) || self.is_keyword("or") {
            self.idx += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::AndAnd)) || self.is_keyword("and") {
            self.idx += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, FilterError> {
        if matches!(self.peek(), Some(Token::Bang)) || self.is_keyword("not") {
            self.idx += 1;
            let inner = self.nested(Self::parse_not)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, FilterError> {
        let lhs = self.parse_additive()?;

        let cmp = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::NotEq) => Some(CmpOp::NotEq),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = cmp {
            self.idx += 1;
            let rhs = self.parse_additive()?;
            let time = lhs.is_time() || rhs.is_time();
            let (lhs, rhs) = (Box::new(lhs), Box::new(rhs));
            return Ok(if time {
                Expr::TimeCompare { op, lhs, rhs }
            } else {
                Expr::Compare { op, lhs, rhs }
            });
        }

        let keyword = match self.peek() {
            Some(Token::Ident(name)) => name.clone(),
            _ => return Ok(lhs),
        };
        match keyword.as_str() {
            "in" => {
                self.idx += 1;
                let rhs = self.parse_additive()?;
                Ok(Expr::In {
                    negated: false,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            "not" if matches!(self.peek_at(1), Some(Token::Ident(next)) if next == "in") => {
                self.idx += 2;
                let rhs = self.parse_additive()?;
                Ok(Expr::In {
                    negated: true,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            "matches" => {
                self.idx += 1;
                let rhs = self.parse_additive()?;
                match rhs {
                    Expr::Literal(Literal::Str(pattern)) => {
                        let regex = Regex::new(&pattern)
                            .map_err(|source| FilterError::Regex { pattern, source })?;
                        Ok(Expr::Matches {
                            lhs: Box::new(lhs),
                            regex,
                        })
                    }
                    rhs => Ok(Expr::MatchesDynamic {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    }),
                }
            }
            "contains" | "startsWith" | "endsWith" => {
                let op = match keyword.as_str() {
                    "contains" => StrOp::Contains,
                    "startsWith" => StrOp::StartsWith,
                    _ => StrOp::EndsWith,
                };
                self.idx += 1;
                let rhs = self.parse_additive()?;
                Ok(Expr::Str {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            _ => Ok(lhs),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(lhs),
            };
            self.idx += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => return Ok(lhs),
            };
            self.idx += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.idx += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(match inner {
                Expr::Literal(Literal::Number(n)) => Expr::Literal(Literal::Number(-n)),
                other => Expr::Neg(Box::new(other)),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        let pos = self.pos();
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Literal::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::LParen) => {
                let inner = self.nested(Self::parse_or)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let items = self.nested(|p| p.parse_args(Token::RBracket, "']'"))?;
                Ok(Expr::List(items))
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.idx += 1;
                    let args = self.nested(|p| p.parse_args(Token::RParen, "')'"))?;
                    return self.call(name, args);
                }
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Literal::Bool(true))),
                    "false" => Ok(Expr::Literal(Literal::Bool(false))),
                    _ => Variable::from_name(&name)
                        .map(Expr::Var)
                        .ok_or(FilterError::UnknownVariable(name)),
                }
            }
            Some(_) => Err(FilterError::Syntax {
                pos,
                message: "unexpected token".to_string(),
            }),
            None => Err(FilterError::Syntax {
                pos,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }

    /// Comma-separated expressions up to `close`; the opening token is consumed
    fn parse_args(&mut self, close: Token, what: &str) -> Result<Vec<Expr>, FilterError> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.idx += 1;
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            match self.peek() {
                Some(Token::Comma) => self.idx += 1,
                _ => {
                    self.expect(close, what)?;
                    return Ok(items);
                }
            }
        }
    }

    fn call(&self, name: String, mut args: Vec<Expr>) -> Result<Expr, FilterError> {
        let expected = match name.as_str() {
            "TimeAgo" => 1,
            "BetweenTime" => 3,
            _ => return Err(FilterError::UnknownFunction(name)),
        };
        if args.len() != expected {
            return Err(FilterError::Arity {
                name,
                expected,
                got: args.len(),
            });
        }

        if name == "TimeAgo" {
            return match args.pop() {
                Some(Expr::Literal(Literal::Str(text))) => parse_duration(&text)
                    .map(Expr::TimeAgo)
                    .ok_or(FilterError::InvalidDuration(text)),
                _ => Err(FilterError::Type(
                    "TimeAgo expects a duration string".to_string(),
                )),
            };
        }

        let [value, start, end]: [Expr; 3] =
            args.try_into().map_err(|args: Vec<Expr>| FilterError::Arity {
                name,
                expected,
                got: args.len(),
            })?;
        Ok(Expr::BetweenTime {
            value: Box::new(value),
            start: Box::new(start),
            end: Box::new(end),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::lexer::tokenize;

    fn parse(input: &str) -> Result<Expr, FilterError> {
        Parser::new(tokenize(input)?, input.len()).parse()
    }

    #[test]
    fn test_precedence() {
        let expr = parse("Status == 200 || Status == 404 && Method == 'GET'").unwrap();
        match expr {
            Expr::Or(lhs, rhs) => {
                assert!(matches!(*lhs, Expr::Compare { op: CmpOp::Eq, .. }));
                assert!(matches!(*rhs, Expr::And(_, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_binds_tighter_than_comparison() {
        let expr = parse("ResponseTime * 1000 > 100 + 50").unwrap();
        match expr {
            Expr::Compare { op, lhs, rhs } => {
                assert_eq!(op, CmpOp::Gt);
                assert!(matches!(*lhs, Expr::Arith { op: ArithOp::Mul, .. }));
                assert!(matches!(*rhs, Expr::Arith { op: ArithOp::Add, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_time_comparison_detected() {
        assert!(matches!(
            parse("Time > '2024-01-01'").unwrap(),
            Expr::TimeCompare { .. }
        ));
        assert!(matches!(
            parse("TimeAgo('5m') <= Time").unwrap(),
            Expr::TimeCompare { .. }
        ));
        assert!(matches!(
            parse("Uri == 'Time'").unwrap(),
            Expr::Compare { .. }
        ));
    }

    #[test]
    fn test_not_in() {
        match parse("Method not in ['GET', 'HEAD']").unwrap() {
            Expr::In { negated, rhs, .. } => {
                assert!(negated);
                assert!(matches!(*rhs, Expr::List(ref items) if items.len() == 2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse("not Status in [200]").unwrap(),
            Expr::Not(_)
        ));
    }

    #[test]
    fn test_literal_regex_compiled() {
        assert!(matches!(
            parse("Uri matches '^/api/'").unwrap(),
            Expr::Matches { .. }
        ));
        assert!(matches!(
            parse("Uri matches '('"),
            Err(FilterError::Regex { .. })
        ));
    }

    #[test]
    fn test_negative_literal() {
        assert!(matches!(
            parse("-1 < Status").unwrap(),
            Expr::Compare { ref lhs, .. } if matches!(**lhs, Expr::Literal(Literal::Number(n)) if n == -1.0)
        ));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse(""), Err(FilterError::Syntax { .. })));
        assert!(matches!(
            parse("Status =="),
            Err(FilterError::Syntax { pos: 9, .. })
        ));
        assert!(matches!(
            parse("Status == 200 200"),
            Err(FilterError::Syntax { pos: 14, .. })
        ));
        assert!(matches!(parse("(Status == 200"), Err(FilterError::Syntax { .. })));
        assert!(matches!(
            parse("Host == 'a'"),
            Err(FilterError::UnknownVariable(ref v)) if v == "Host"
        ));
        assert!(matches!(
            parse("Now() > 1"),
            Err(FilterError::UnknownFunction(ref f)) if f == "Now"
        ));
        assert!(matches!(
            parse("TimeAgo('1m', '2m') < Time"),
            Err(FilterError::Arity { expected: 1, got: 2, .. })
        ));
        assert!(matches!(
            parse("TimeAgo('soon') < Time"),
            Err(FilterError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}Status == 200{}", "(".repeat(1000), ")".repeat(1000));
        let err = parse(&deep).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));
        for deep in [
            format!("{}true", "!".repeat(1000)),
            format!("{}1 < Status", "-".repeat(1000)),
            format!("Method in {}'GET'{}", "[".repeat(1000), "]".repeat(1000)),
        ] {
            assert!(matches!(parse(&deep), Err(FilterError::Syntax { .. })));
        }

        let shallow = format!("{}Status == 200{}", "(".repeat(10), ")".repeat(10));
        assert!(parse(&shallow).is_ok());
    }
}
