//! Sandboxed evaluation of descriptor expressions.
//!
//! Descriptor fields whose string value begins with `(`, `'` or `"`
//! are expressions; everything else passes through as a literal. An
//! expression is compiled to a small AST and evaluated against three
//! named scopes: `constants` (fixed physical constants), `metadata`
//! (values accumulated from ancestor tasks) and `requested_metadata`
//! (values pulled from explicitly named tasks). Evaluation is pure:
//! arithmetic, comparisons, boolean logic, subscripting and a fixed
//! function allow-list; nothing else resolves.

use std::collections::HashMap;
use std::fmt;

use crate::entities::MetadataValue;
use crate::errors::{PipelineError, PipelineResult};

/// The fixed constants table available to every expression, taken from
/// the pipeline's physical-constants registry.
pub fn constants_table() -> HashMap<String, f64> {
    let mut c = HashMap::new();
    c.insert("day".to_string(), 1.0); // days
    c.insert("month".to_string(), 28.0); // days
    c.insert("year".to_string(), 365.25); // days
    c.insert("sun_radius".to_string(), 695_500e3); // metres
    c.insert("earth_radius".to_string(), 6_371e3); // metres
    c.insert("jupiter_radius".to_string(), 71_492e3); // metres
    c.insert("phy_AU".to_string(), 149_597_870_700.0); // metres
    c.insert("Rearth".to_string(), 0.08911486); // Jupiter radii
    c.insert("plato_noise".to_string(), 0.000315); // 25-sec cadence pixel
    c.insert("pi".to_string(), std::f64::consts::PI);
    c.insert("e".to_string(), std::f64::consts::E);
    c
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn as_num(&self) -> PipelineResult<f64> {
        match self {
            Value::Num(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => Err(PipelineError::expression(format!(
                "expected a number, got string '{s}'"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<Value> for MetadataValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Num(n) => MetadataValue::Float(n),
            Value::Str(s) => MetadataValue::Str(s),
            Value::Bool(b) => MetadataValue::Float(if b { 1.0 } else { 0.0 }),
        }
    }
}

impl From<&MetadataValue> for Value {
    fn from(v: &MetadataValue) -> Self {
        match v {
            MetadataValue::Float(n) => Value::Num(*n),
            MetadataValue::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// Returns true if a descriptor string is to be parsed as an
/// expression rather than passed through literally.
pub fn is_expression(s: &str) -> bool {
    matches!(s.trim_start().chars().next(), Some('(') | Some('\'') | Some('"'))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
}

fn tokenize(input: &str) -> PipelineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else if (d == 'e' || d == 'E')
                        && !text.is_empty()
                        && text.chars().all(|t| t.is_ascii_digit() || t == '.')
                    {
                        text.push(d);
                        chars.next();
                        if let Some(&sign) = chars.peek() {
                            if sign == '+' || sign == '-' {
                                text.push(sign);
                                chars.next();
                            }
                        }
                    } else {
                        break;
                    }
                }
                let value: f64 = text
                    .parse()
                    .map_err(|_| PipelineError::expression(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(value));
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(d) if d == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => {
                                return Err(PipelineError::expression("unterminated string"))
                            }
                        },
                        Some(d) => text.push(d),
                        None => return Err(PipelineError::expression("unterminated string")),
                    }
                }
                tokens.push(Token::Str(text));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(text));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err(PipelineError::expression("assignment is not allowed"));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    return Err(PipelineError::expression("unexpected '!'"));
                }
            }
            other => {
                return Err(PipelineError::expression(format!(
                    "unexpected character '{other}'"
                )))
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Ast {
    Num(f64),
    Str(String),
    Ident(String),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    Index(Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> PipelineResult<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(PipelineError::expression(format!(
                "expected {expected:?}, got {other:?}"
            ))),
        }
    }

    fn peek_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn parse_expression(&mut self) -> PipelineResult<Ast> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PipelineResult<Ast> {
        let mut left = self.parse_and()?;
        while self.peek_ident("or") {
            self.next();
            let right = self.parse_and()?;
            left = Ast::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PipelineResult<Ast> {
        let mut left = self.parse_not()?;
        while self.peek_ident("and") {
            self.next();
            let right = self.parse_not()?;
            left = Ast::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> PipelineResult<Ast> {
        if self.peek_ident("not") {
            self.next();
            let operand = self.parse_not()?;
            return Ok(Ast::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PipelineResult<Ast> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_additive()?;
        Ok(Ast::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> PipelineResult<Ast> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.parse_multiplicative()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PipelineResult<Ast> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.next();
            let right = self.parse_unary()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PipelineResult<Ast> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let operand = self.parse_unary()?;
            return Ok(Ast::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PipelineResult<Ast> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.parse_expression()?;
                    self.expect(Token::RBracket)?;
                    node = Ast::Index(Box::new(node), Box::new(index));
                }
                Some(Token::LParen) => {
                    // Only a bare identifier can be called; the name is
                    // checked against the allow-list at evaluation time.
                    let name = match &node {
                        Ast::Ident(name) => name.clone(),
                        _ => {
                            return Err(PipelineError::expression(
                                "only named functions can be called",
                            ))
                        }
                    };
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.parse_expression()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    node = Ast::Call(name, args);
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> PipelineResult<Ast> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Ast::Num(n)),
            Some(Token::Str(s)) => Ok(Ast::Str(s)),
            Some(Token::Ident(name)) => Ok(Ast::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(PipelineError::expression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

/// Evaluates expressions against the metadata visible to one task.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator {
    pub metadata: HashMap<String, MetadataValue>,
    pub requested_metadata: HashMap<String, HashMap<String, MetadataValue>>,
}

impl ExpressionEvaluator {
    pub fn new(
        metadata: HashMap<String, MetadataValue>,
        requested_metadata: HashMap<String, HashMap<String, MetadataValue>>,
    ) -> Self {
        Self {
            metadata,
            requested_metadata,
        }
    }

    /// Evaluate a descriptor field. Non-string JSON scalars and
    /// non-expression strings pass through unevaluated.
    pub fn evaluate_field(&self, field: &serde_json::Value) -> PipelineResult<MetadataValue> {
        match field {
            serde_json::Value::Number(n) => {
                let v = n.as_f64().ok_or_else(|| {
                    PipelineError::expression(format!("non-finite number {n}"))
                })?;
                Ok(MetadataValue::Float(v))
            }
            serde_json::Value::Bool(b) => {
                Ok(MetadataValue::Float(if *b { 1.0 } else { 0.0 }))
            }
            serde_json::Value::String(s) => {
                if is_expression(s) {
                    Ok(self.evaluate_expression(s)?.into())
                } else {
                    Ok(MetadataValue::Str(s.clone()))
                }
            }
            other => Err(PipelineError::expression(format!(
                "unsupported descriptor value {other}"
            ))),
        }
    }

    /// Evaluate an expression string to a value. Non-expression strings
    /// pass through as string literals.
    pub fn evaluate_expression(&self, expression: &str) -> PipelineResult<Value> {
        let trimmed = expression.trim();
        if !is_expression(trimmed) {
            return Ok(Value::Str(trimmed.to_string()));
        }
        let tokens = tokenize(trimmed)?;
        let mut parser = Parser::new(tokens);
        let ast = parser.parse_expression()?;
        if parser.peek().is_some() {
            return Err(PipelineError::expression(format!(
                "trailing tokens in expression <{trimmed}>"
            )));
        }
        self.eval(&ast)
    }

    fn eval(&self, ast: &Ast) -> PipelineResult<Value> {
        match ast {
            Ast::Num(n) => Ok(Value::Num(*n)),
            Ast::Str(s) => Ok(Value::Str(s.clone())),
            Ast::Ident(name) => Err(PipelineError::expression(format!(
                "name '{name}' is not directly readable; \
                 use constants[...], metadata[...] or requested_metadata[...]"
            ))),
            Ast::Unary(op, operand) => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => Ok(Value::Num(-v.as_num()?)),
                    UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                }
            }
            Ast::Binary(op, left, right) => self.eval_binary(*op, left, right),
            Ast::Index(target, index) => self.eval_index(target, index),
            Ast::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Ast, right: &Ast) -> PipelineResult<Value> {
        // Short-circuit the logical operators.
        match op {
            BinaryOp::And => {
                let l = self.eval(left)?;
                if !l.truthy() {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval(right)?.truthy()));
            }
            BinaryOp::Or => {
                let l = self.eval(left)?;
                if l.truthy() {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval(right)?.truthy()));
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        match op {
            BinaryOp::Add => match (&l, &r) {
                (Value::Str(a), b) => Ok(Value::Str(format!("{a}{b}"))),
                (a, Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
                _ => Ok(Value::Num(l.as_num()? + r.as_num()?)),
            },
            BinaryOp::Sub => Ok(Value::Num(l.as_num()? - r.as_num()?)),
            BinaryOp::Mul => Ok(Value::Num(l.as_num()? * r.as_num()?)),
            BinaryOp::Div => {
                let denominator = r.as_num()?;
                if denominator == 0.0 {
                    return Err(PipelineError::expression("division by zero"));
                }
                Ok(Value::Num(l.as_num()? / denominator))
            }
            BinaryOp::Mod => Ok(Value::Num(l.as_num()? % r.as_num()?)),
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
            BinaryOp::Lt => Ok(Value::Bool(l.as_num()? < r.as_num()?)),
            BinaryOp::Le => Ok(Value::Bool(l.as_num()? <= r.as_num()?)),
            BinaryOp::Gt => Ok(Value::Bool(l.as_num()? > r.as_num()?)),
            BinaryOp::Ge => Ok(Value::Bool(l.as_num()? >= r.as_num()?)),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn eval_index(&self, target: &Ast, index: &Ast) -> PipelineResult<Value> {
        let key = match self.eval(index)? {
            Value::Str(s) => s,
            other => {
                return Err(PipelineError::expression(format!(
                    "subscript must be a string key, got {other}"
                )))
            }
        };

        match target {
            Ast::Ident(scope) => match scope.as_str() {
                "constants" => constants_table()
                    .get(&key)
                    .map(|v| Value::Num(*v))
                    .ok_or_else(|| {
                        PipelineError::expression(format!("unknown constant '{key}'"))
                    }),
                "metadata" => self
                    .metadata
                    .get(&key)
                    .map(Value::from)
                    .ok_or_else(|| {
                        PipelineError::expression(format!("metadata key '{key}' is not available"))
                    }),
                "requested_metadata" => Err(PipelineError::expression(format!(
                    "requested_metadata['{key}'] needs a second subscript naming the key"
                ))),
                other => Err(PipelineError::expression(format!(
                    "unknown scope '{other}'"
                ))),
            },
            // requested_metadata['task_name']['keyword']
            Ast::Index(inner_target, inner_index) => {
                match inner_target.as_ref() {
                    Ast::Ident(name) if name == "requested_metadata" => {}
                    _ => {
                        return Err(PipelineError::expression(
                            "only requested_metadata supports double subscripting",
                        ))
                    }
                }
                let task_name = match self.eval(inner_index)? {
                    Value::Str(s) => s,
                    other => {
                        return Err(PipelineError::expression(format!(
                            "task name subscript must be a string, got {other}"
                        )))
                    }
                };
                let task_metadata = self.requested_metadata.get(&task_name).ok_or_else(|| {
                    PipelineError::expression(format!(
                        "no metadata requested from task '{task_name}'"
                    ))
                })?;
                task_metadata.get(&key).map(Value::from).ok_or_else(|| {
                    PipelineError::expression(format!(
                        "task '{task_name}' has not recorded metadata key '{key}'"
                    ))
                })
            }
            _ => Err(PipelineError::expression("invalid subscript target")),
        }
    }

    fn eval_call(&self, name: &str, args: &[Ast]) -> PipelineResult<Value> {
        let values: Vec<Value> = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<PipelineResult<_>>()?;

        let unary = |values: &[Value]| -> PipelineResult<f64> {
            match values {
                [v] => v.as_num(),
                _ => Err(PipelineError::expression(format!(
                    "{name}() takes exactly one argument"
                ))),
            }
        };

        match name {
            "abs" => Ok(Value::Num(unary(&values)?.abs())),
            "sqrt" => Ok(Value::Num(unary(&values)?.sqrt())),
            "log10" => {
                let v = unary(&values)?;
                if v <= 0.0 {
                    return Err(PipelineError::expression("log10 of a non-positive value"));
                }
                Ok(Value::Num(v.log10()))
            }
            "floor" => Ok(Value::Num(unary(&values)?.floor())),
            "ceil" => Ok(Value::Num(unary(&values)?.ceil())),
            "round" => Ok(Value::Num(unary(&values)?.round())),
            "pow" => match &values[..] {
                [base, exp] => Ok(Value::Num(base.as_num()?.powf(exp.as_num()?))),
                _ => Err(PipelineError::expression("pow() takes two arguments")),
            },
            "min" | "max" => {
                if values.is_empty() {
                    return Err(PipelineError::expression(format!(
                        "{name}() needs at least one argument"
                    )));
                }
                let mut nums = Vec::with_capacity(values.len());
                for v in &values {
                    nums.push(v.as_num()?);
                }
                let folded = if name == "min" {
                    nums.into_iter().fold(f64::INFINITY, f64::min)
                } else {
                    nums.into_iter().fold(f64::NEG_INFINITY, f64::max)
                };
                Ok(Value::Num(folded))
            }
            // format('mask_{}.lc', i): each '{}' is replaced by the next
            // argument in order.
            "format" => {
                let template = match values.first() {
                    Some(Value::Str(s)) => s.clone(),
                    _ => {
                        return Err(PipelineError::expression(
                            "format() needs a string template as its first argument",
                        ))
                    }
                };
                let mut out = String::new();
                let mut pieces = template.split("{}");
                let mut args_iter = values[1..].iter();
                out.push_str(pieces.next().unwrap_or(""));
                for piece in pieces {
                    let arg = args_iter.next().ok_or_else(|| {
                        PipelineError::expression("format() has more '{}' than arguments")
                    })?;
                    out.push_str(&render_format_arg(arg));
                    out.push_str(piece);
                }
                if args_iter.next().is_some() {
                    return Err(PipelineError::expression(
                        "format() has more arguments than '{}' slots",
                    ));
                }
                Ok(Value::Str(out))
            }
            other => Err(PipelineError::expression(format!(
                "function '{other}' is not allowed"
            ))),
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => a == b,
        _ => match (l.as_num(), r.as_num()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
    }
}

/// Integral numbers render without a trailing ".0" so that filenames
/// built with format() look the way users expect.
fn render_format_arg(v: &Value) -> String {
    match v {
        Value::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator_with(pairs: &[(&str, MetadataValue)]) -> ExpressionEvaluator {
        let metadata = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ExpressionEvaluator::new(metadata, HashMap::new())
    }

    #[test]
    fn plain_strings_pass_through() {
        let ev = ExpressionEvaluator::default();
        assert_eq!(
            ev.evaluate_expression("earth.lc").unwrap(),
            Value::Str("earth.lc".to_string())
        );
        assert_eq!(
            ev.evaluate_field(&serde_json::json!(730)).unwrap(),
            MetadataValue::Float(730.0)
        );
    }

    #[test]
    fn quoted_strings_are_literals() {
        let ev = ExpressionEvaluator::default();
        assert_eq!(
            ev.evaluate_expression("'earth.lc'").unwrap(),
            Value::Str("earth.lc".to_string())
        );
    }

    #[test]
    fn arithmetic_with_constants() {
        let ev = ExpressionEvaluator::default();
        let v = ev
            .evaluate_expression("(2 * constants['year'])")
            .unwrap();
        assert_eq!(v, Value::Num(730.5));
    }

    #[test]
    fn metadata_lookup_and_comparison() {
        let ev = evaluator_with(&[("size_index", MetadataValue::Float(2.0))]);
        assert_eq!(
            ev.evaluate_expression("(metadata['size_index'] < 3)").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            ev.evaluate_expression("(metadata['size_index'] >= 3)").unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn requested_metadata_needs_two_subscripts() {
        let mut requested = HashMap::new();
        let mut from_search = HashMap::new();
        from_search.insert("snr".to_string(), MetadataValue::Float(7.5));
        requested.insert("search".to_string(), from_search);
        let ev = ExpressionEvaluator::new(HashMap::new(), requested);

        assert_eq!(
            ev.evaluate_expression("(requested_metadata['search']['snr'] > 5)")
                .unwrap(),
            Value::Bool(true)
        );
        assert!(ev
            .evaluate_expression("(requested_metadata['search'])")
            .is_err());
    }

    #[test]
    fn unknown_names_fail() {
        let ev = ExpressionEvaluator::default();
        assert!(ev.evaluate_expression("(metadata['missing'])").is_err());
        assert!(ev.evaluate_expression("(constants['bogus'])").is_err());
        assert!(ev.evaluate_expression("(nonsense['x'])").is_err());
    }

    #[test]
    fn malformed_expressions_fail() {
        let ev = ExpressionEvaluator::default();
        assert!(ev.evaluate_expression("(1 +").is_err());
        assert!(ev.evaluate_expression("(metadata['a'] = 3)").is_err());
        assert!(ev.evaluate_expression("('x' ; 'y')").is_err());
    }

    #[test]
    fn function_allow_list() {
        let ev = ExpressionEvaluator::default();
        assert_eq!(
            ev.evaluate_expression("(log10(100))").unwrap(),
            Value::Num(2.0)
        );
        assert_eq!(
            ev.evaluate_expression("(max(1, 7, 3))").unwrap(),
            Value::Num(7.0)
        );
        // No host evaluation: arbitrary callables never resolve.
        assert!(ev.evaluate_expression("(open('/etc/passwd'))").is_err());
    }

    #[test]
    fn format_builds_filenames() {
        let ev = evaluator_with(&[("size_index", MetadataValue::Float(3.0))]);
        assert_eq!(
            ev.evaluate_expression("(format('earth_{}.lc', metadata['size_index']))")
                .unwrap(),
            Value::Str("earth_3.lc".to_string())
        );
    }

    #[test]
    fn logic_short_circuits() {
        let ev = evaluator_with(&[("flag", MetadataValue::Float(0.0))]);
        // Right side would fail if evaluated.
        assert_eq!(
            ev.evaluate_expression("(metadata['flag'] and metadata['missing'])")
                .unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            ev.evaluate_expression("(not metadata['flag'])").unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn string_concatenation() {
        let ev = evaluator_with(&[("run", MetadataValue::Str("a".to_string()))]);
        assert_eq!(
            ev.evaluate_expression("('lc_' + metadata['run'])").unwrap(),
            Value::Str("lc_a".to_string())
        );
    }
}
