//! Sandboxed evaluation of rule expressions and statements.
//!
//! Scripts only read and write the facts map they are handed. Every node
//! visited costs one step; a run that exceeds its step budget fails.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::ast::{BinaryOp, Expr, Function, Path, Stmt, UnaryOp};
use super::Facts;
use crate::error::{FactError, FactResult};

fn runtime(message: impl Into<String>) -> FactError {
    FactError::ScriptRuntime(message.into())
}

/// Loose truthiness: null, false, zero and empty values are false
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

fn float(value: f64) -> FactResult<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| runtime("arithmetic produced a non-finite number"))
}

/// Step-bounded interpreter for one rule invocation
pub(crate) struct Evaluator<'a> {
    fields: &'a Map<String, Value>,
    steps: usize,
    max_steps: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(fields: &'a Map<String, Value>, max_steps: usize) -> Self {
        Self {
            fields,
            steps: 0,
            max_steps,
        }
    }

    fn tick(&mut self) -> FactResult<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(runtime(format!("evaluation exceeded {} steps", self.max_steps)));
        }
        Ok(())
    }

    /// Resolve a path against the fields first, then the facts
    fn lookup<'v>(&self, path: &Path, facts: &'v Facts) -> Option<&'v Value>
    where
        'a: 'v,
    {
        let (head, rest) = path.split_first()?;
        let mut current = self.fields.get(head).or_else(|| facts.get(head))?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn eval(&mut self, expr: &Expr, facts: &Facts) -> FactResult<Value> {
        self.tick()?;
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, facts)?);
                }
                Ok(Value::Array(values))
            }
            Expr::Path(path) => Ok(self.lookup(path, facts).cloned().unwrap_or(Value::Null)),
            Expr::Unary(UnaryOp::Not, operand) => {
                Ok(Value::Bool(!truthy(&self.eval(operand, facts)?)))
            }
            Expr::Unary(UnaryOp::Neg, operand) => match self.eval(operand, facts)? {
                Value::Number(n) => match n.as_i64() {
                    Some(i) => i
                        .checked_neg()
                        .map(Value::from)
                        .ok_or_else(|| runtime("integer overflow")),
                    None => float(-n.as_f64().unwrap_or_default()),
                },
                other => Err(runtime(format!("cannot negate a {}", type_name(&other)))),
            },
            Expr::Binary(BinaryOp::And, left, right) => {
                let result = truthy(&self.eval(left, facts)?) && truthy(&self.eval(right, facts)?);
                Ok(Value::Bool(result))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                let result = truthy(&self.eval(left, facts)?) || truthy(&self.eval(right, facts)?);
                Ok(Value::Bool(result))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, facts)?;
                let right = self.eval(right, facts)?;
                binary(*op, &left, &right)
            }
            Expr::Call(Function::Exists, args) => match args.first() {
                Some(Expr::Path(path)) => Ok(Value::Bool(self.lookup(path, facts).is_some())),
                _ => Err(runtime("exists takes a fact path")),
            },
            Expr::Call(function, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, facts)?);
                }
                call(*function, &values)
            }
        }
    }

    /// Evaluate `expr` as a condition
    pub fn test(&mut self, expr: &Expr, facts: &Facts) -> FactResult<bool> {
        Ok(truthy(&self.eval(expr, facts)?))
    }

    pub fn exec(&mut self, stmts: &[Stmt], facts: &mut Facts) -> FactResult<()> {
        for stmt in stmts {
            self.tick()?;
            match stmt {
                Stmt::Set(path, expr) => {
                    let value = self.eval(expr, facts)?;
                    assign(facts, path, value)?;
                }
                Stmt::Unset(path) => unset(facts, path),
                Stmt::If {
                    condition,
                    then,
                    otherwise,
                } => {
                    if self.test(condition, facts)? {
                        self.exec(then, facts)?;
                    } else {
                        self.exec(otherwise, facts)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn assign(facts: &mut Facts, path: &Path, value: Value) -> FactResult<()> {
    let (leaf, parents) = match path.split_last() {
        Some(split) => split,
        None => return Err(runtime("empty fact path")),
    };

    let mut target = facts;
    for segment in parents {
        let slot = target
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        target = match slot {
            Value::Object(map) => map,
            other => {
                return Err(runtime(format!(
                    "cannot set {}: {} is a {}",
                    path.join("."),
                    segment,
                    type_name(other)
                )))
            }
        };
    }
    target.insert(leaf.clone(), value);
    Ok(())
}

fn unset(facts: &mut Facts, path: &Path) {
    let (leaf, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut target = facts;
    for segment in parents {
        target = match target.get_mut(segment) {
            Some(Value::Object(map)) => map,
            _ => return,
        };
    }
    target.remove(leaf);
}

fn compare(left: &Value, right: &Value) -> FactResult<Option<Ordering>> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(None),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Ok(Some(x.cmp(&y))),
            _ => Ok(a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y))),
        },
        (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
        (Value::Bool(a), Value::Bool(b)) => Ok(Some(a.cmp(b))),
        _ => Err(runtime(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn member(needle: &Value, haystack: &Value) -> FactResult<bool> {
    match (needle, haystack) {
        (_, Value::Array(items)) => Ok(items.iter().any(|item| loose_eq(needle, item))),
        (Value::String(n), Value::String(h)) => Ok(h.contains(n.as_str())),
        (Value::String(key), Value::Object(map)) => Ok(map.contains_key(key)),
        (_, Value::Null) => Ok(false),
        _ => Err(runtime(format!(
            "cannot look for a {} in a {}",
            type_name(needle),
            type_name(haystack)
        ))),
    }
}

fn arithmetic(op: BinaryOp, a: &Number, b: &Number) -> FactResult<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let overflow = || runtime("integer overflow");
        return match op {
            BinaryOp::Add => x.checked_add(y).map(Value::from).ok_or_else(overflow),
            BinaryOp::Sub => x.checked_sub(y).map(Value::from).ok_or_else(overflow),
            BinaryOp::Mul => x.checked_mul(y).map(Value::from).ok_or_else(overflow),
            BinaryOp::Div if y == 0 => Err(runtime("division by zero")),
            BinaryOp::Div if x.checked_rem(y) == Some(0) => {
                x.checked_div(y).map(Value::from).ok_or_else(overflow)
            }
            BinaryOp::Div => float(x as f64 / y as f64),
            BinaryOp::Rem if y == 0 => Err(runtime("division by zero")),
            BinaryOp::Rem => x.checked_rem(y).map(Value::from).ok_or_else(overflow),
            _ => Err(runtime("not an arithmetic operator")),
        };
    }

    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(runtime("number out of range")),
    };
    match op {
        BinaryOp::Add => float(x + y),
        BinaryOp::Sub => float(x - y),
        BinaryOp::Mul => float(x * y),
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => Err(runtime("division by zero")),
        BinaryOp::Div => float(x / y),
        BinaryOp::Rem => float(x % y),
        _ => Err(runtime("not an arithmetic operator")),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> FactResult<Value> {
    match op {
        BinaryOp::Equal => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::NotEqual => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Less => Ok(Value::Bool(compare(left, right)? == Some(Ordering::Less))),
        BinaryOp::LessEqual => Ok(Value::Bool(matches!(
            compare(left, right)?,
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Greater => Ok(Value::Bool(compare(left, right)? == Some(Ordering::Greater))),
        BinaryOp::GreaterEqual => Ok(Value::Bool(matches!(
            compare(left, right)?,
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOp::In => Ok(Value::Bool(member(left, right)?)),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            match (left, right) {
                (Value::Number(a), Value::Number(b)) => arithmetic(op, a, b),
                (Value::String(a), Value::String(b)) if op == BinaryOp::Add => {
                    Ok(Value::String(format!("{}{}", a, b)))
                }
                (Value::Array(a), Value::Array(b)) if op == BinaryOp::Add => {
                    Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
                }
                _ => Err(runtime(format!(
                    "unsupported operands {} and {}",
                    type_name(left),
                    type_name(right)
                ))),
            }
        }
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(match op {
            BinaryOp::And => truthy(left) && truthy(right),
            _ => truthy(left) || truthy(right),
        })),
    }
}

fn call(function: Function, args: &[Value]) -> FactResult<Value> {
    let wrong = |value: &Value| {
        runtime(format!(
            "{} does not accept a {}",
            function.name(),
            type_name(value)
        ))
    };

    match (function, args) {
        (Function::Len, [value]) => match value {
            Value::Null => Ok(Value::from(0)),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            other => Err(wrong(other)),
        },
        (Function::Lower, [Value::String(s)]) => Ok(Value::String(s.to_lowercase())),
        (Function::Upper, [Value::String(s)]) => Ok(Value::String(s.to_uppercase())),
        (Function::Lower | Function::Upper, [Value::Null]) => Ok(Value::Null),
        (Function::Contains, [haystack, needle]) => Ok(Value::Bool(member(needle, haystack)?)),
        (Function::StartsWith, [Value::String(s), Value::String(prefix)]) => {
            Ok(Value::Bool(s.starts_with(prefix.as_str())))
        }
        (Function::StartsWith, [Value::Null, _]) => Ok(Value::Bool(false)),
        (Function::Abs, [Value::Number(n)]) => match n.as_i64() {
            Some(i) => i.checked_abs().map(Value::from).ok_or_else(|| runtime("integer overflow")),
            None => float(n.as_f64().unwrap_or_default().abs()),
        },
        (_, [first, ..]) => Err(wrong(first)),
        _ => Err(runtime(format!("{} called with no arguments", function.name()))),
    }
}
