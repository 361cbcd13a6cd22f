//! Expressions attached to relations (`expression-get`/`expression-set`) and to constraints.
//!
//! The language is a small Python-flavoured subset: integer and string literals, arithmetic,
//! comparisons, boolean connectives and the functions `len`, `int` and `str`. Variables are
//! supplied by the caller (`size`, `count`, `offset`, `value`). Every failure, syntactic or
//! at runtime, is an [`ExpressionError`].

use crate::error::ExpressionError;
use crate::value::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Op(&'static str),
    OpenParen,
    CloseParen,
    Comma,
    Dot,
}

struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn tokens(mut self) -> Result<Vec<Token>, String> {
        let mut out = Vec::new();
        while let Some(token) = self.next_token()? {
            out.push(token);
        }
        Ok(out)
    }

    fn next_token(&mut self) -> Result<Option<Token>, String> {
        while self.position < self.input.len() && self.current_char().is_whitespace() {
            self.position += 1;
        }
        if self.position >= self.input.len() {
            return Ok(None);
        }

        let token = match self.current_char() {
            '(' => self.single(Token::OpenParen),
            ')' => self.single(Token::CloseParen),
            ',' => self.single(Token::Comma),
            '.' => self.single(Token::Dot),
            '\'' | '"' => Token::Str(self.read_string()?),
            '0' if matches!(self.peek(), Some('x') | Some('X')) => {
                self.position += 2;
                let digits = self.read_while(|c| c.is_ascii_hexdigit());
                let value = i64::from_str_radix(&digits, 16)
                    .map_err(|_| format!("invalid hex literal 0x{digits}"))?;
                Token::Int(value)
            }
            c if c.is_ascii_digit() => {
                let digits = self.read_while(|c| c.is_ascii_digit());
                let value = digits
                    .parse::<i64>()
                    .map_err(|_| format!("invalid number {digits}"))?;
                Token::Int(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                Token::Ident(self.read_while(|c| c.is_ascii_alphanumeric() || c == '_'))
            }
            _ => Token::Op(self.read_operator()?),
        };
        Ok(Some(token))
    }

    fn current_char(&self) -> char {
        self.input[self.position]
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn single(&mut self, token: Token) -> Token {
        self.position += 1;
        token
    }

    fn read_while(&mut self, keep: impl Fn(char) -> bool) -> String {
        let start = self.position;
        while self.position < self.input.len() && keep(self.current_char()) {
            self.position += 1;
        }
        self.input[start..self.position].iter().collect()
    }

    fn read_operator(&mut self) -> Result<&'static str, String> {
        const OPERATORS: [&str; 16] = [
            "==", "!=", "<=", ">=", "&&", "||", "//", "<", ">", "+", "-", "*", "/", "%", "!",
            "&",
        ];
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = self.input[self.position..]
                .iter()
                .take(len)
                .copied()
                .eq(op.chars());
            if matches {
                self.position += len;
                return Ok(op);
            }
        }
        Err(format!("unexpected character '{}'", self.current_char()))
    }

    fn read_string(&mut self) -> Result<String, String> {
        let quote = self.current_char();
        self.position += 1;
        let mut out = String::new();
        while self.position < self.input.len() {
            let c = self.current_char();
            self.position += 1;
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let escaped = self
                .input
                .get(self.position)
                .copied()
                .ok_or("unterminated escape")?;
            self.position += 1;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                'x' => {
                    let hex: String = self.input.iter().skip(self.position).take(2).collect();
                    let code =
                        u8::from_str_radix(&hex, 16).map_err(|_| format!("bad escape \\x{hex}"))?;
                    self.position += 2;
                    out.push(code as char);
                }
                other => out.push(other),
            }
        }
        Err("unterminated string literal".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Int(i64),
    Str(String),
    Bool(bool),
    Var(String),
    Attr(Box<Expr>, String),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn parse(tokens: Vec<Token>) -> Result<Expr, String> {
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expr = parser.parse_or()?;
        match parser.tokens.get(parser.position) {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected {token:?}")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.position += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(id)) if id == word) {
            self.position += 1;
            return true;
        }
        false
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") || self.eat_op(&["||"]).is_some() {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary("or", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("and") || self.eat_op(&["&&"]).is_some() {
            let rhs = self.parse_not()?;
            lhs = Expr::Binary("and", Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("not") || self.eat_op(&["!"]).is_some() {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_sum()?;
        if let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) {
            let rhs = self.parse_sum()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_sum(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_term()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "//", "/", "%", "&"]) {
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat_op(&["-"]).is_some() {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        let mut expr = self.parse_primary()?;
        while matches!(self.peek(), Some(Token::Dot)) {
            self.position += 1;
            match self.advance() {
                Some(Token::Ident(attr)) => expr = Expr::Attr(Box::new(expr), attr),
                other => return Err(format!("expected attribute name, found {other:?}")),
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::OpenParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::CloseParen) => Ok(inner),
                    other => Err(format!("expected ')', found {other:?}")),
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "True" | "true" => Ok(Expr::Bool(true)),
                "False" | "false" => Ok(Expr::Bool(false)),
                _ if matches!(self.peek(), Some(Token::OpenParen)) => {
                    self.position += 1;
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::CloseParen)) {
                        loop {
                            args.push(self.parse_or()?);
                            if matches!(self.peek(), Some(Token::Comma)) {
                                self.position += 1;
                                continue;
                            }
                            break;
                        }
                    }
                    match self.advance() {
                        Some(Token::CloseParen) => Ok(Expr::Call(name, args)),
                        other => Err(format!("expected ')' after arguments, found {other:?}")),
                    }
                }
                _ => Ok(Expr::Var(name)),
            },
            Some(token) => Err(format!("unexpected {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl Val {
    fn type_name(&self) -> &'static str {
        match self {
            Val::Int(_) => "int",
            Val::Str(_) => "str",
            Val::Bytes(_) => "bytes",
            Val::Bool(_) => "bool",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Val::Int(v) => *v != 0,
            Val::Str(s) => !s.is_empty(),
            Val::Bytes(b) => !b.is_empty(),
            Val::Bool(b) => *b,
        }
    }

    fn as_int(&self) -> Result<i64, String> {
        match self {
            Val::Int(v) => Ok(*v),
            Val::Bool(b) => Ok(i64::from(*b)),
            other => Err(format!("expected int, found {}", other.type_name())),
        }
    }
}

/// Named inputs to an expression.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    values: HashMap<String, Value>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.values.insert(name.to_string(), value.into());
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let ast = Lexer::new(source)
            .tokens()
            .and_then(Parser::parse)
            .map_err(|reason| ExpressionError::Syntax {
                expr: source.to_string(),
                reason,
            })?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval_int(&self, vars: &Vars) -> Result<i64, ExpressionError> {
        self.eval(vars)?.as_int().map_err(|reason| self.runtime(reason))
    }

    pub fn eval_bool(&self, vars: &Vars) -> Result<bool, ExpressionError> {
        Ok(self.eval(vars)?.truthy())
    }

    fn eval(&self, vars: &Vars) -> Result<Val, ExpressionError> {
        eval_expr(&self.ast, vars).map_err(|reason| self.runtime(reason))
    }

    fn runtime(&self, reason: String) -> ExpressionError {
        ExpressionError::Runtime {
            expr: self.source.clone(),
            reason,
        }
    }
}

/// Parses and evaluates `source` to an integer in one step.
pub fn eval_int(source: &str, vars: &Vars) -> Result<i64, ExpressionError> {
    Expression::parse(source)?.eval_int(vars)
}

pub fn eval_bool(source: &str, vars: &Vars) -> Result<bool, ExpressionError> {
    Expression::parse(source)?.eval_bool(vars)
}

fn lookup(vars: &Vars, name: &str) -> Result<Val, String> {
    match vars.values.get(name) {
        Some(Value::Int(v)) => Ok(Val::Int(*v)),
        Some(Value::UInt(v)) => i64::try_from(*v)
            .map(Val::Int)
            .map_err(|_| format!("'{name}' does not fit in a signed 64-bit integer")),
        Some(Value::Str(s)) => Ok(Val::Str(s.clone())),
        Some(Value::Bits(b)) => Ok(Val::Bytes(b.as_bytes().to_vec())),
        None => Err(format!("name '{name}' is not defined")),
    }
}

fn eval_expr(expr: &Expr, vars: &Vars) -> Result<Val, String> {
    match expr {
        Expr::Int(v) => Ok(Val::Int(*v)),
        Expr::Str(s) => Ok(Val::Str(s.clone())),
        Expr::Bool(b) => Ok(Val::Bool(*b)),
        Expr::Var(name) => lookup(vars, name),
        Expr::Attr(target, attr) => {
            let target = eval_expr(target, vars)?;
            Err(format!(
                "'{}' object has no attribute '{attr}'",
                target.type_name()
            ))
        }
        Expr::Neg(inner) => {
            let v = eval_expr(inner, vars)?.as_int()?;
            v.checked_neg()
                .map(Val::Int)
                .ok_or_else(|| "integer overflow".to_string())
        }
        Expr::Not(inner) => Ok(Val::Bool(!eval_expr(inner, vars)?.truthy())),
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| eval_expr(a, vars))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
        Expr::Binary("and", lhs, rhs) => {
            let l = eval_expr(lhs, vars)?;
            if !l.truthy() {
                return Ok(l);
            }
            eval_expr(rhs, vars)
        }
        Expr::Binary("or", lhs, rhs) => {
            let l = eval_expr(lhs, vars)?;
            if l.truthy() {
                return Ok(l);
            }
            eval_expr(rhs, vars)
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, vars)?;
            let r = eval_expr(rhs, vars)?;
            binary(op, l, r)
        }
    }
}

fn call(name: &str, args: Vec<Val>) -> Result<Val, String> {
    let [arg] = <[Val; 1]>::try_from(args)
        .map_err(|args| format!("{name}() takes exactly one argument ({} given)", args.len()))?;
    match (name, arg) {
        ("len", Val::Str(s)) => Ok(Val::Int(s.chars().count() as i64)),
        ("len", Val::Bytes(b)) => Ok(Val::Int(b.len() as i64)),
        ("int", Val::Int(v)) => Ok(Val::Int(v)),
        ("int", Val::Bool(b)) => Ok(Val::Int(i64::from(b))),
        ("int", Val::Str(s)) => s
            .trim()
            .parse()
            .map(Val::Int)
            .map_err(|_| format!("invalid literal for int(): '{s}'")),
        ("str", Val::Int(v)) => Ok(Val::Str(v.to_string())),
        ("str", Val::Str(s)) => Ok(Val::Str(s)),
        ("len" | "int" | "str", other) => Err(format!(
            "{name}() does not accept {}",
            other.type_name()
        )),
        _ => Err(format!("name '{name}' is not defined")),
    }
}

fn binary(op: &str, l: Val, r: Val) -> Result<Val, String> {
    let overflow = || "integer overflow".to_string();
    match op {
        "==" => return Ok(Val::Bool(loose_eq(&l, &r))),
        "!=" => return Ok(Val::Bool(!loose_eq(&l, &r))),
        _ => {}
    }
    if let ("+", Val::Str(a), Val::Str(b)) = (op, &l, &r) {
        return Ok(Val::Str(format!("{a}{b}")));
    }
    if let (Val::Str(a), Val::Str(b)) = (&l, &r) {
        return match op {
            "<" => Ok(Val::Bool(a < b)),
            "<=" => Ok(Val::Bool(a <= b)),
            ">" => Ok(Val::Bool(a > b)),
            ">=" => Ok(Val::Bool(a >= b)),
            _ => Err(format!("unsupported operand for {op}: str and str")),
        };
    }
    let a = l.as_int()?;
    let b = r.as_int()?;
    let v = match op {
        "+" => a.checked_add(b).ok_or_else(overflow)?,
        "-" => a.checked_sub(b).ok_or_else(overflow)?,
        "*" => a.checked_mul(b).ok_or_else(overflow)?,
        "/" | "//" | "%" if b == 0 => return Err("division by zero".to_string()),
        "/" | "//" => floor_div(a, b).ok_or_else(overflow)?,
        "%" => floor_mod(a, b).ok_or_else(overflow)?,
        "&" => a & b,
        "<" => return Ok(Val::Bool(a < b)),
        "<=" => return Ok(Val::Bool(a <= b)),
        ">" => return Ok(Val::Bool(a > b)),
        ">=" => return Ok(Val::Bool(a >= b)),
        other => return Err(format!("unknown operator {other}")),
    };
    Ok(Val::Int(v))
}

/// Division rounding toward negative infinity.
fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    let r = a.checked_rem(b)?;
    Some(if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q })
}

/// Remainder taking the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    Some(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
}

fn loose_eq(l: &Val, r: &Val) -> bool {
    match (l, r) {
        (Val::Bool(_) | Val::Int(_), Val::Bool(_) | Val::Int(_)) => l.as_int() == r.as_int(),
        (Val::Bytes(a), Val::Str(s)) | (Val::Str(s), Val::Bytes(a)) => a == s.as_bytes(),
        _ => l == r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitBuf;

    #[test]
    fn arithmetic_and_precedence() {
        let vars = Vars::new().with("size", 10i64);
        assert_eq!(eval_int("size * 2 + 1", &vars).unwrap(), 21);
        assert_eq!(eval_int("(size + 2) / 4", &vars).unwrap(), 3);
        assert_eq!(eval_int("size % 3 - -1", &vars).unwrap(), 2);
        assert_eq!(eval_int("0x10 + size", &vars).unwrap(), 26);
    }

    #[test]
    fn division_floors_toward_negative_infinity() {
        let vars = Vars::new().with("a", -7i64).with("b", 2i64);
        assert_eq!(eval_int("a // b", &vars).unwrap(), -4);
        assert_eq!(eval_int("a % b", &vars).unwrap(), 1);
        assert_eq!(eval_int("7 / -2", &vars).unwrap(), -4);
        assert_eq!(eval_int("7 % -2", &vars).unwrap(), -1);
        assert_eq!(eval_int("a // -1", &vars).unwrap(), 7);
    }

    #[test]
    fn division_overflow_is_an_error() {
        let vars = Vars::new().with("size", i64::MIN);
        for source in ["size // -1", "size / -1", "size % -1"] {
            let err = eval_int(source, &vars).unwrap_err();
            assert!(matches!(err, ExpressionError::Runtime { .. }), "{err:?}");
            assert!(err.to_string().ends_with("integer overflow"), "'{source}' gave {err}");
        }
    }

    #[test]
    fn get_and_set_pairs_are_inverse() {
        let get = Expression::parse("size - 4").unwrap();
        let set = Expression::parse("size + 4").unwrap();
        for raw in [4i64, 9, 100] {
            let logical = get.eval_int(&Vars::new().with("size", raw)).unwrap();
            let back = set.eval_int(&Vars::new().with("size", logical)).unwrap();
            assert_eq!(back, raw, "set(get(x)) must be x");
        }
    }

    #[test]
    fn constraints_over_values() {
        let bytes = Vars::new().with("value", BitBuf::from_bytes(&[1, 2, 3, 4, 5]));
        assert!(!eval_bool("len(value) < 3", &bytes).unwrap());
        let text = Vars::new().with("value", "abc");
        assert!(eval_bool("value == 'abc' and len(value) == 3", &text).unwrap());
        assert!(eval_bool("not value != \"abc\"", &text).unwrap());
        assert!(eval_bool("int('42') == 42 || false", &Vars::new()).unwrap());
    }

    #[test]
    fn malformed_expression_is_syntax_error() {
        let err = Expression::parse("a bad scripting expression").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { .. }), "{err:?}");
        assert!(matches!(
            Expression::parse("(1 + 2"),
            Err(ExpressionError::Syntax { .. })
        ));
    }

    #[test]
    fn runtime_failures_are_errors_not_falsy() {
        let vars = Vars::new().with("value", "Bar");
        for source in ["value.foo", "unknown + 1", "1 / 0", "len(5)", "int(value)"] {
            let err = eval_bool(source, &vars).unwrap_err();
            assert!(
                matches!(err, ExpressionError::Runtime { .. }),
                "'{source}' should fail at runtime, got {err:?}"
            );
        }
    }
}
