//! Safe arithmetic expressions over metric names.
//!
//! Grammar (no variables, no loops, no user-defined functions):
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := number | ident | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Functions: `min`, `max` (one or more args), `abs` (one arg).

use crate::error::FormulaError;

const MAX_LEN: usize = 512;
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("number {n}"),
            Token::Ident(s) => format!("identifier '{s}'"),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::Comma => "','".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Min,
    Max,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Metric(String),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

/// A parsed formula, ready to evaluate against any metric source.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    root: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        if source.len() > MAX_LEN {
            return Err(FormulaError::TooLong(MAX_LEN));
        }
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr(0)?;
        if let Some((tok, offset)) = parser.tokens.get(parser.pos) {
            return Err(FormulaError::UnexpectedToken {
                found: tok.describe(),
                offset: *offset,
            });
        }

        Ok(Self { root })
    }

    /// Metric names referenced by the formula, in first-seen order.
    pub fn metrics(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_metrics(&self.root, &mut out);
        out
    }

    /// Evaluate with `lookup` resolving metric names.
    ///
    /// Returns `Ok(None)` when any referenced metric is absent.
    pub fn evaluate<F>(&self, lookup: F) -> Result<Option<f64>, FormulaError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let value = match eval(&self.root, &lookup)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if !value.is_finite() {
            return Err(FormulaError::NonFinite);
        }
        Ok(Some(value))
    }
}

fn collect_metrics<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Num(_) => {}
        Expr::Metric(name) => {
            if !out.contains(&name.as_str()) {
                out.push(name);
            }
        }
        Expr::Neg(inner) => collect_metrics(inner, out),
        Expr::Bin(_, l, r) => {
            collect_metrics(l, out);
            collect_metrics(r, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_metrics(a, out)),
    }
}

fn eval<F>(expr: &Expr, lookup: &F) -> Result<Option<f64>, FormulaError>
where
    F: Fn(&str) -> Option<f64>,
{
    Ok(Some(match expr {
        Expr::Num(n) => *n,
        Expr::Metric(name) => match lookup(name) {
            Some(v) => v,
            None => return Ok(None),
        },
        Expr::Neg(inner) => match eval(inner, lookup)? {
            Some(v) => -v,
            None => return Ok(None),
        },
        Expr::Bin(op, l, r) => {
            let (Some(l), Some(r)) = (eval(l, lookup)?, eval(r, lookup)?) else {
                return Ok(None);
            };
            match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => {
                    if r == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    l / r
                }
            }
        }
        Expr::Call(func, args) => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                match eval(a, lookup)? {
                    Some(v) => values.push(v),
                    None => return Ok(None),
                }
            }
            match func {
                Func::Abs => values[0].abs(),
                Func::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                Func::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            }
        }
    }))
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut i = 0;

    while i < chars.len() {
        let (offset, ch) = chars[i];
        match ch {
            c if c.is_whitespace() => {
                i += 1;
            }
            '+' | '-' | '*' | '/' | '(' | ')' | ',' => {
                let tok = match ch {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                };
                tokens.push((tok, offset));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| FormulaError::UnexpectedToken {
                        found: format!("number '{text}'"),
                        offset,
                    })?;
                tokens.push((Token::Num(n), offset));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((Token::Ident(ident), offset));
            }
            other => return Err(FormulaError::UnexpectedChar { ch: other, offset }),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), FormulaError> {
        let tok = self.tokens.get(self.pos).cloned().ok_or(FormulaError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, want: Token) -> Result<(), FormulaError> {
        let (tok, offset) = self.next()?;
        if tok == want {
            Ok(())
        } else {
            Err(FormulaError::UnexpectedToken {
                found: tok.describe(),
                offset,
            })
        }
    }

    fn expr(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        if depth > MAX_DEPTH {
            return Err(FormulaError::TooDeep(MAX_DEPTH));
        }
        let mut lhs = self.term(depth)?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        } {
            self.pos += 1;
            let rhs = self.term(depth)?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary(depth)?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            _ => None,
        } {
            self.pos += 1;
            let rhs = self.unary(depth)?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        if depth > MAX_DEPTH {
            return Err(FormulaError::TooDeep(MAX_DEPTH));
        }
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary(depth + 1)?)));
        }
        self.primary(depth)
    }

    fn primary(&mut self, depth: usize) -> Result<Expr, FormulaError> {
        let (tok, offset) = self.next()?;
        match tok {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::LParen => {
                let inner = self.expr(depth + 1)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Metric(name));
                }
                self.pos += 1;
                let func = match name.as_str() {
                    "min" => Func::Min,
                    "max" => Func::Max,
                    "abs" => Func::Abs,
                    _ => return Err(FormulaError::UnknownFunction(name)),
                };
                let mut args = vec![self.expr(depth + 1)?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr(depth + 1)?);
                }
                self.expect(Token::RParen)?;

                if func == Func::Abs && args.len() != 1 {
                    return Err(FormulaError::Arity {
                        name,
                        expected: "1",
                        got: args.len(),
                    });
                }
                Ok(Expr::Call(func, args))
            }
            other => Err(FormulaError::UnexpectedToken {
                found: other.describe(),
                offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn eval_with(src: &str, m: &HashMap<String, f64>) -> Result<Option<f64>, FormulaError> {
        Formula::parse(src)?.evaluate(|name| m.get(name).copied())
    }

    #[test]
    fn precedence_and_parentheses() {
        let m = metrics(&[]);
        assert_eq!(eval_with("1 + 2 * 3", &m), Ok(Some(7.0)));
        assert_eq!(eval_with("(1 + 2) * 3", &m), Ok(Some(9.0)));
        assert_eq!(eval_with("-2 * -3", &m), Ok(Some(6.0)));
        assert_eq!(eval_with("10 / 4 - 1", &m), Ok(Some(1.5)));
    }

    #[test]
    fn metrics_and_functions() {
        let m = metrics(&[("revenue", 120.0), ("spend", 40.0), ("stock_on_hand", 3.0)]);
        assert_eq!(eval_with("revenue / spend", &m), Ok(Some(3.0)));
        assert_eq!(eval_with("max(stock_on_hand, 5) - min(1, 2, 0.5)", &m), Ok(Some(4.5)));
        assert_eq!(eval_with("abs(spend - revenue)", &m), Ok(Some(80.0)));
    }

    #[test]
    fn missing_metric_is_not_applicable() {
        let m = metrics(&[("revenue", 1.0)]);
        assert_eq!(eval_with("revenue / spend", &m), Ok(None));
    }

    #[test]
    fn lists_referenced_metrics_once() {
        let f = Formula::parse("a + b * a - max(c, b)").unwrap();
        assert_eq!(f.metrics(), vec!["a", "b", "c"]);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(Formula::parse("   "), Err(FormulaError::Empty));
        assert!(matches!(Formula::parse("1 +"), Err(FormulaError::UnexpectedEnd)));
        assert!(matches!(Formula::parse("1 2"), Err(FormulaError::UnexpectedToken { .. })));
        assert!(matches!(Formula::parse("a; drop"), Err(FormulaError::UnexpectedChar { ch: ';', .. })));
        assert!(matches!(Formula::parse("exec(1)"), Err(FormulaError::UnknownFunction(_))));
        assert!(matches!(Formula::parse("abs(1, 2)"), Err(FormulaError::Arity { .. })));
        assert!(matches!(Formula::parse("1..2"), Err(FormulaError::UnexpectedToken { .. })));

        let deep = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(Formula::parse(&deep), Err(FormulaError::TooDeep(MAX_DEPTH)));
        assert_eq!(Formula::parse(&"1+".repeat(300)), Err(FormulaError::TooLong(MAX_LEN)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let m = metrics(&[("spend", 0.0)]);
        assert_eq!(eval_with("10 / spend", &m), Err(FormulaError::DivisionByZero));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Arbitrary input never panics; it either parses or yields a typed error.
            #[test]
            fn parse_is_total(input in "[a-z0-9_+*/()., -]{0,80}") {
                if let Ok(f) = Formula::parse(&input) {
                    let _ = f.evaluate(|_| Some(1.0));
                }
            }

            #[test]
            fn sums_match_native_arithmetic(a in -1.0e6f64..1.0e6, b in -1.0e6f64..1.0e6) {
                let m = metrics(&[("a", a), ("b", b)]);
                let got = eval_with("a + b * 2", &m).unwrap().unwrap();
                prop_assert!((got - (a + b * 2.0)).abs() < 1e-6);
            }
        }
    }
}
