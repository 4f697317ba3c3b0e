//! Tokenizer and recursive-descent parser for the condition grammar.
//!
//! Anything outside the grammar is rejected as a whole; there is no
//! fallback parse.

use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Var(String),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `a < b <= c`: the head operand and each `(op, operand)` link.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Var(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "**", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "&", "|", "(", ")", "[",
    "]", ".",
];

fn unsupported(expr: &str, reason: impl Into<String>) -> Error {
    Error::UnsupportedExpression {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            if c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
                i += 2;
                while i < chars.len() && chars[i].is_ascii_hexdigit() {
                    i += 1;
                }
                let text: String = chars[start + 2..i].iter().collect();
                let value = i64::from_str_radix(&text, 16)
                    .map_err(|_| unsupported(src, format!("bad hex literal 0x{}", text)))?;
                tokens.push(Token::Int(value));
                continue;
            }
            let mut is_float = false;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_digit() || d == '_' {
                    i += 1;
                } else if d == '.' && !is_float && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    is_float = true;
                    i += 1;
                } else if (d == 'e' || d == 'E')
                    && chars
                        .get(i + 1)
                        .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
                {
                    is_float = true;
                    i += 2;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let token = if is_float {
                Token::Float(
                    text.parse()
                        .map_err(|_| unsupported(src, format!("bad number {}", text)))?,
                )
            } else {
                Token::Int(
                    text.parse()
                        .map_err(|_| unsupported(src, format!("integer {} out of range", text)))?,
                )
            };
            tokens.push(token);
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let d = chars[i];
                i += 1;
                if d == '\\' {
                    let escaped = chars
                        .get(i)
                        .ok_or_else(|| unsupported(src, "unterminated string"))?;
                    text.push(match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        '0' => '\0',
                        other => *other,
                    });
                    i += 1;
                } else if d == quote {
                    closed = true;
                    break;
                } else {
                    text.push(d);
                }
            }
            if !closed {
                return Err(unsupported(src, "unterminated string"));
            }
            tokens.push(Token::Str(text));
            continue;
        }
        if c == '$' {
            let start = i + 1;
            i = start;
            if !chars.get(i).is_some_and(|n| n.is_alphabetic() || *n == '_') {
                return Err(unsupported(src, "'$' must be followed by a variable name"));
            }
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            if name.ends_with('.') || name.contains("..") {
                return Err(unsupported(src, format!("malformed variable path ${}", name)));
            }
            tokens.push(Token::Var(name));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(*op));
                i += op.chars().count();
            }
            None => return Err(unsupported(src, format!("unexpected character '{}'", c))),
        }
    }
    Ok(tokens)
}

/// Parse `src` into an expression tree.
pub(crate) fn parse(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(unsupported(src, "empty expression"));
    }
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
    };
    let expr = parser.ternary()?;
    if let Some(tok) = parser.peek() {
        return Err(unsupported(src, format!("unexpected {:?}", tok)));
    }
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(name)) if name == kw) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        unsupported(self.src, reason)
    }

    fn ternary(&mut self) -> Result<Expr> {
        let then = self.or_expr()?;
        if !self.eat_keyword("if") {
            return Ok(then);
        }
        let cond = self.or_expr()?;
        if !self.eat_keyword("else") {
            return Err(self.error("conditional expression is missing 'else'"));
        }
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let head = self.bit_or()?;
        let mut links = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Op("==")) => CmpOp::Eq,
                Some(Token::Op("!=")) => CmpOp::Ne,
                Some(Token::Op("<")) => CmpOp::Lt,
                Some(Token::Op("<=")) => CmpOp::Le,
                Some(Token::Op(">")) => CmpOp::Gt,
                Some(Token::Op(">=")) => CmpOp::Ge,
                _ => break,
            };
            self.pos += 1;
            links.push((op, self.bit_or()?));
        }
        if links.is_empty() {
            Ok(head)
        } else {
            Ok(Expr::Compare(Box::new(head), links))
        }
    }

    fn bit_or(&mut self) -> Result<Expr> {
        let mut left = self.bit_and()?;
        while self.eat_op("|") {
            let right = self.bit_and()?;
            left = Expr::Binary(BinOp::BitOr, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn bit_and(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        while self.eat_op("&") {
            let right = self.additive()?;
            left = Expr::Binary(BinOp::BitAnd, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat_op("+") {
            return Ok(Expr::Pos(Box::new(self.unary()?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            // Right-associative, and binds tighter than a unary minus on its left.
            let exp = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op(".") {
                match self.next() {
                    Some(Token::Ident(name)) => expr = Expr::Attr(Box::new(expr), name),
                    _ => return Err(self.error("expected attribute name after '.'")),
                }
            } else if self.eat_op("[") {
                let index = self.ternary()?;
                if !self.eat_op("]") {
                    return Err(self.error("expected ']'"));
                }
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Var(name)) => Ok(Expr::Var(name)),
            Some(Token::Ident(name)) => match name.as_str() {
                "True" | "true" => Ok(Expr::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Bool(false))),
                "None" | "null" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "if" | "else" | "lambda" | "import" | "for" | "in"
                | "is" => Err(self.error(format!("unexpected keyword '{}'", name))),
                _ => Ok(Expr::Var(name)),
            },
            Some(Token::Op("(")) => {
                let inner = self.ternary()?;
                if !self.eat_op(")") {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(tok) => Err(self.error(format!("unexpected {:?}", tok))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dollar_path_is_one_identifier() {
        assert_eq!(parse("$file.size").unwrap(), Expr::Var("file.size".into()));
    }

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Literal(Value::Int(1))),
                Box::new(Expr::Binary(
                    BinOp::Mul,
                    Box::new(Expr::Literal(Value::Int(2))),
                    Box::new(Expr::Literal(Value::Int(3)))
                ))
            )
        );
    }

    #[test]
    fn test_chained_comparison_shape() {
        match parse("$a < $b <= $c").unwrap() {
            Expr::Compare(_, links) => assert_eq!(links.len(), 2),
            other => panic!("expected comparison, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_outside_grammar() {
        for src in ["x = 1", "f(1)", "[1, 2]", "lambda: 1", "a if b", "$", "'open", "1 // 2", "a;b"] {
            assert!(
                matches!(parse(src), Err(Error::UnsupportedExpression { .. })),
                "accepted {src}"
            );
        }
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse("0x1F").unwrap(), Expr::Literal(Value::Int(31)));
        assert_eq!(parse("2.5").unwrap(), Expr::Literal(Value::Float(2.5)));
        assert_eq!(parse("'a\\n'").unwrap(), Expr::Literal(Value::Str("a\n".into())));
        assert_eq!(parse("None").unwrap(), Expr::Literal(Value::Null));
    }
}
