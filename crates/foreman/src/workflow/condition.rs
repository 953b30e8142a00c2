//! Step guard expressions.
//!
//! A tiny, sandboxed language: one operand, or two operands
//! joined by `==` or `!=`.
//!
//! ```text
//! condition := operand [ ("==" | "!=") operand ]
//! operand   := "${" path "}" | quoted-string | number | true | false | null | identifier
//! ```
//!
//! `${path}` and bare identifiers are variable lookups. Comparison is loose:
//! numbers compare numerically, a string compared with anything else compares
//! against that value's text (`"3" == 3` holds). A lone operand is tested for
//! truthiness.

use crate::error::ConditionError;
use crate::value::render;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Variable(String),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
}

/// A parsed guard.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    left: Operand,
    comparison: Option<(Op, Operand)>,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(expression)?;
        let mut tokens = tokens.into_iter();

        let left = match tokens.next() {
            Some(Token::Operand(op)) => op,
            Some(Token::Op(_)) => return Err(ConditionError::parse(expression, "expected an operand first")),
            None => return Err(ConditionError::parse(expression, "empty condition")),
        };

        let comparison = match tokens.next() {
            None => None,
            Some(Token::Op(op)) => match tokens.next() {
                Some(Token::Operand(right)) => Some((op, right)),
                _ => return Err(ConditionError::parse(expression, "expected an operand after the operator")),
            },
            Some(Token::Operand(_)) => {
                return Err(ConditionError::parse(expression, "expected == or != between operands"))
            }
        };

        if tokens.next().is_some() {
            return Err(ConditionError::parse(expression, "unexpected trailing input"));
        }
        Ok(Self { left, comparison })
    }

    /// Evaluate with `lookup` resolving variables. Unknown variables are an
    /// error, never silently false.
    pub fn evaluate<F>(&self, lookup: F) -> Result<bool, ConditionError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let left = resolve(&self.left, &lookup)?;
        match &self.comparison {
            None => Ok(truthy(&left)),
            Some((op, right)) => {
                let right = resolve(right, &lookup)?;
                let equal = loose_eq(&left, &right);
                Ok(match op {
                    Op::Eq => equal,
                    Op::Ne => !equal,
                })
            }
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate<F>(expression: &str, lookup: F) -> Result<bool, ConditionError>
where
    F: Fn(&str) -> Option<Value>,
{
    Condition::parse(expression)?.evaluate(lookup)
}

fn resolve<F>(operand: &Operand, lookup: &F) -> Result<Value, ConditionError>
where
    F: Fn(&str) -> Option<Value>,
{
    match operand {
        Operand::Literal(value) => Ok(value.clone()),
        Operand::Variable(name) => lookup(name).ok_or_else(|| ConditionError::UnknownVariable(name.clone())),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(s), other) | (other, Value::String(s)) => *s == render(other),
        _ => a == b,
    }
}

#[derive(Debug)]
enum Token {
    Operand(Operand),
    Op(Op),
}

fn tokenize(expression: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '$' => {
                if chars.get(i + 1) != Some(&'{') {
                    return Err(ConditionError::parse(expression, "expected '{' after '$'"));
                }
                let start = i + 2;
                let end = (start..chars.len())
                    .find(|&j| chars[j] == '}')
                    .ok_or_else(|| ConditionError::parse(expression, "unclosed '${'"))?;
                let path: String = chars[start..end].iter().collect::<String>().trim().to_string();
                if path.is_empty() {
                    return Err(ConditionError::parse(expression, "empty variable reference"));
                }
                tokens.push(Token::Operand(Operand::Variable(path)));
                i = end + 1;
            }
            '"' | '\'' => {
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(ConditionError::parse(expression, "unterminated string")),
                        Some(&ch) if ch == c => break,
                        Some('\\') => {
                            let escaped = chars
                                .get(j + 1)
                                .ok_or_else(|| ConditionError::parse(expression, "unterminated string"))?;
                            text.push(*escaped);
                            j += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            j += 1;
                        }
                    }
                }
                tokens.push(Token::Operand(Operand::Literal(Value::String(text))));
                i = j + 1;
            }
            '=' | '!' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(ConditionError::parse(expression, format!("unsupported operator '{c}'")));
                }
                tokens.push(Token::Op(if c == '=' { Op::Eq } else { Op::Ne }));
                i += 2;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let end = (i + 1..chars.len())
                    .find(|&j| !(chars[j].is_ascii_alphanumeric() || chars[j] == '.'))
                    .unwrap_or(chars.len());
                let text: String = chars[i..end].iter().collect();
                let number = text
                    .parse::<i64>()
                    .map(Value::from)
                    .ok()
                    .or_else(|| {
                        text.parse::<f64>()
                            .ok()
                            .and_then(serde_json::Number::from_f64)
                            .map(Value::Number)
                    })
                    .ok_or_else(|| ConditionError::parse(expression, format!("invalid number '{text}'")))?;
                tokens.push(Token::Operand(Operand::Literal(number)));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let end = (i + 1..chars.len())
                    .find(|&j| !(chars[j].is_alphanumeric() || matches!(chars[j], '_' | '.' | '-')))
                    .unwrap_or(chars.len());
                let word: String = chars[i..end].iter().collect();
                let operand = match word.as_str() {
                    "true" | "True" => Operand::Literal(Value::Bool(true)),
                    "false" | "False" => Operand::Literal(Value::Bool(false)),
                    "null" | "None" => Operand::Literal(Value::Null),
                    _ => Operand::Variable(word),
                };
                tokens.push(Token::Operand(operand));
                i = end;
            }
            other => {
                return Err(ConditionError::parse(expression, format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}
