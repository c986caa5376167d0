use super::lexer::{tokenize, Token};
use super::ConditionError;
use serde_json::Value;

/// Parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// The run state itself
    State,
    List(Vec<Expr>),
    Index {
        target: Box<Expr>,
        key: Box<Expr>,
    },
    /// `target.get(key)` / `target.get(key, default)`
    Get {
        target: Box<Expr>,
        key: Box<Expr>,
        default: Option<Box<Expr>>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `a < b <= c`: every adjacent pair must hold
    Compare {
        first: Box<Expr>,
        rest: Vec<(CompareOp, Expr)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

/// The closed set of callable functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Len,
    Int,
    Float,
    Str,
    Bool,
    Abs,
    Min,
    Max,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "len" => Self::Len,
            "int" => Self::Int,
            "float" => Self::Float,
            "str" => Self::Str,
            "bool" => Self::Bool,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bool => "bool",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// Longest accepted condition, in tokens. Bounds the depth of left-leaning chains like `1 + 1 + ...`.
const MAX_TOKENS: usize = 1024;

/// Deepest accepted nesting of parentheses, lists, calls and prefix operators.
const MAX_DEPTH: usize = 64;

/// Parse condition source into an expression tree.
pub fn parse(source: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ConditionError::Parse("empty expression".to_string()));
    }
    if tokens.len() > MAX_TOKENS {
        return Err(ConditionError::Parse(format!(
            "expression too long ({} tokens, limit {})",
            tokens.len(),
            MAX_TOKENS
        )));
    }

    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
    };
    let expr = parser.or_expr()?;

    if let Some((pos, token)) = parser.tokens.get(parser.position) {
        return Err(ConditionError::Parse(format!(
            "unexpected {:?} at offset {}",
            token, pos
        )));
    }

    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, t)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.position + offset).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(_, t)| t.clone());
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == word)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ConditionError::Parse(format!(
                "expected {:?}, found {:?}",
                expected, token
            ))),
            None => Err(ConditionError::Parse(format!(
                "expected {:?}, found end of expression",
                expected
            ))),
        }
    }

    /// Run `parse` one nesting level deeper.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ConditionError>,
    ) -> Result<T, ConditionError> {
        if self.depth >= MAX_DEPTH {
            return Err(ConditionError::Parse(
                "expression nested too deeply".to_string(),
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn or_expr(&mut self) -> Result<Expr, ConditionError> {
        self.nested(Self::or_chain)
    }

    fn or_chain(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and_expr()?;
        while self.is_keyword("or") {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.not_expr()?;
        while self.is_keyword("and") {
            self.advance();
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ConditionError> {
        if self.is_keyword("not") {
            self.advance();
            let inner = self.nested(Self::not_expr)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn compare_op(&mut self) -> Option<CompareOp> {
        let op = match self.peek()? {
            Token::EqEq => CompareOp::Eq,
            Token::NotEq => CompareOp::Ne,
            Token::Lt => CompareOp::Lt,
            Token::Le => CompareOp::Le,
            Token::Gt => CompareOp::Gt,
            Token::Ge => CompareOp::Ge,
            Token::Ident(word) if word == "in" => CompareOp::In,
            Token::Ident(word)
                if word == "not"
                    && matches!(self.peek_at(1), Some(Token::Ident(next)) if next == "in") =>
            {
                self.advance();
                CompareOp::NotIn
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let first = self.sum()?;
        let mut rest = Vec::new();
        while let Some(op) = self.compare_op() {
            rest.push((op, self.sum()?));
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn sum(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                Some(Token::Percent) => ArithOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let inner = self.nested(Self::unary)?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.advance();
                    let key = self.or_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        key: Box::new(key),
                    };
                }
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(method)) if method == "get" => {}
                        Some(Token::Ident(method)) => {
                            return Err(ConditionError::UnknownName(method));
                        }
                        other => {
                            return Err(ConditionError::Parse(format!(
                                "expected method name after '.', found {:?}",
                                other
                            )));
                        }
                    }
                    self.expect(Token::LParen)?;
                    let mut args = self.arguments()?;
                    if args.is_empty() || args.len() > 2 {
                        return Err(ConditionError::Arity {
                            function: "get".to_string(),
                            expected: "1 or 2".to_string(),
                            got: args.len(),
                        });
                    }
                    let default = if args.len() == 2 {
                        args.pop().map(Box::new)
                    } else {
                        None
                    };
                    let key = args.pop().map(Box::new).ok_or_else(|| {
                        ConditionError::Parse("missing key for get()".to_string())
                    })?;
                    expr = Expr::Get {
                        target: Box::new(expr),
                        key,
                        default,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Comma-separated expressions up to the closing parenthesis, which is consumed.
    fn arguments(&mut self) -> Result<Vec<Expr>, ConditionError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => {
                    return Err(ConditionError::Parse(format!(
                        "expected ',' or ')' in argument list, found {:?}",
                        other
                    )))
                }
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let token = self
            .advance()
            .ok_or_else(|| ConditionError::Parse("unexpected end of expression".to_string()))?;

        match token {
            Token::Int(i) => Ok(Expr::Literal(Value::from(i))),
            Token::Float(f) => serde_json::Number::from_f64(f)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| ConditionError::Parse(format!("invalid number {}", f))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if matches!(self.peek(), Some(Token::RBracket)) {
                    self.advance();
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.or_expr()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => return Ok(Expr::List(items)),
                        other => {
                            return Err(ConditionError::Parse(format!(
                                "expected ',' or ']' in list, found {:?}",
                                other
                            )))
                        }
                    }
                }
            }
            Token::Ident(name) => match name.as_str() {
                "state" => Ok(Expr::State),
                "True" | "true" => Ok(Expr::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Bool(false))),
                "None" | "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let function =
                        Function::lookup(&name).ok_or(ConditionError::UnknownName(name))?;
                    self.expect(Token::LParen)?;
                    let args = self.arguments()?;
                    Ok(Expr::Call { function, args })
                }
            },
            other => Err(ConditionError::Parse(format!("unexpected {:?}", other))),
        }
    }
}
