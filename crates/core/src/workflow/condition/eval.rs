use super::parser::{ArithOp, CompareOp, Expr, Function};
use super::ConditionError;
use crate::types::RunState;
use serde_json::{Number, Value};
use std::borrow::Cow;
use std::cmp::Ordering;

/// Evaluate a parsed expression against the state and return its truthiness.
pub fn evaluate_expr(expr: &Expr, state: &RunState) -> Result<bool, ConditionError> {
    let evaluator = Evaluator { state };
    let value = evaluator.eval(expr)?;
    Ok(truthy(&value))
}

/// Python-style truthiness: null, false, zero and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

struct Evaluator<'s> {
    state: &'s RunState,
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    /// Booleans count as 0 and 1.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Number(n) => n
                .as_i64()
                .map(Num::Int)
                .or_else(|| n.as_f64().map(Num::Float)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Result<Value, ConditionError> {
        match self {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => Number::from_f64(f)
                .map(Value::Number)
                .ok_or(ConditionError::Overflow),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn mismatch(op: &str, left: &Value, right: &Value) -> ConditionError {
    ConditionError::TypeMismatch(format!(
        "unsupported operand types for {}: '{}' and '{}'",
        op,
        type_name(left),
        type_name(right)
    ))
}

/// Look up `key` inside a map (string key) or a list (integer index).
fn lookup<'v>(container: &'v Value, key: &Value) -> Result<&'v Value, ConditionError> {
    match (container, key) {
        (Value::Object(map), Value::String(k)) => map
            .get(k)
            .ok_or_else(|| ConditionError::MissingKey(k.clone())),
        (Value::Array(items), Value::Number(_)) => {
            let index = key.as_i64().ok_or_else(|| {
                ConditionError::TypeMismatch("list indices must be integers".to_string())
            })?;
            let len = items.len() as i64;
            let resolved = if index < 0 { len + index } else { index };
            if resolved < 0 || resolved >= len {
                return Err(ConditionError::IndexOutOfRange(index));
            }
            Ok(&items[resolved as usize])
        }
        (container, key) => Err(mismatch("[]", container, key)),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_)) => {
            match (Num::from_value(left), Num::from_value(right)) {
                (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
                (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
                _ => false,
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Result<Ordering, ConditionError> {
    match (left, right) {
        (Value::Number(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_)) => {
            match (Num::from_value(left), Num::from_value(right)) {
                (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(a.cmp(&b)),
                (Some(a), Some(b)) => a
                    .as_f64()
                    .partial_cmp(&b.as_f64())
                    .ok_or_else(|| mismatch("comparison", left, right)),
                _ => Err(mismatch("comparison", left, right)),
            }
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b) {
                match compare_values(x, y)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => Err(mismatch("comparison", left, right)),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, ConditionError> {
    match (container, item) {
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Array(items), item) => Ok(items.iter().any(|v| values_equal(v, item))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (container, item) => Err(mismatch("in", item, container)),
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    Ok(match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Lt => compare_values(left, right)? == Ordering::Less,
        CompareOp::Le => compare_values(left, right)? != Ordering::Greater,
        CompareOp::Gt => compare_values(left, right)? == Ordering::Greater,
        CompareOp::Ge => compare_values(left, right)? != Ordering::Less,
        CompareOp::In => contains(right, left)?,
        CompareOp::NotIn => !contains(right, left)?,
    })
}

fn arith(op: ArithOp, left: &Value, right: &Value) -> Result<Value, ConditionError> {
    if op == ArithOp::Add {
        match (left, right) {
            (Value::String(a), Value::String(b)) => return Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                return Ok(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            _ => {}
        }
    }

    let symbol = match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
        ArithOp::Rem => "%",
    };
    let (a, b) = match (Num::from_value(left), Num::from_value(right)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(mismatch(symbol, left, right)),
    };

    let result = match (op, a, b) {
        (ArithOp::Div | ArithOp::Rem, _, b) if b.as_f64() == 0.0 => {
            return Err(ConditionError::DivisionByZero)
        }
        (ArithOp::Div, a, b) => Num::Float(a.as_f64() / b.as_f64()),
        (ArithOp::Add, Num::Int(x), Num::Int(y)) => {
            Num::Int(x.checked_add(y).ok_or(ConditionError::Overflow)?)
        }
        (ArithOp::Sub, Num::Int(x), Num::Int(y)) => {
            Num::Int(x.checked_sub(y).ok_or(ConditionError::Overflow)?)
        }
        (ArithOp::Mul, Num::Int(x), Num::Int(y)) => {
            Num::Int(x.checked_mul(y).ok_or(ConditionError::Overflow)?)
        }
        (ArithOp::Rem, Num::Int(x), Num::Int(y)) => {
            let r = x.checked_rem(y).ok_or(ConditionError::Overflow)?;
            Num::Int(if r != 0 && (r < 0) != (y < 0) { r + y } else { r })
        }
        (ArithOp::Add, a, b) => Num::Float(a.as_f64() + b.as_f64()),
        (ArithOp::Sub, a, b) => Num::Float(a.as_f64() - b.as_f64()),
        (ArithOp::Mul, a, b) => Num::Float(a.as_f64() * b.as_f64()),
        (ArithOp::Rem, a, b) => {
            let (x, y) = (a.as_f64(), b.as_f64());
            let r = x % y;
            Num::Float(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r })
        }
    };
    result.into_value()
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn call(function: Function, args: Vec<Value>) -> Result<Value, ConditionError> {
    match function {
        Function::Min | Function::Max => min_max(function, &args),
        _ => match args.as_slice() {
            [value] => call_unary(function, value),
            _ => Err(ConditionError::Arity {
                function: function.name().to_string(),
                expected: "1".to_string(),
                got: args.len(),
            }),
        },
    }
}

fn min_max(function: Function, args: &[Value]) -> Result<Value, ConditionError> {
    let candidates: &[Value] = match args {
        [] => {
            return Err(ConditionError::Arity {
                function: function.name().to_string(),
                expected: "at least 1".to_string(),
                got: 0,
            })
        }
        [Value::Array(items)] => items.as_slice(),
        [_] => {
            return Err(ConditionError::TypeMismatch(format!(
                "{}() expects a list or several arguments",
                function.name()
            )))
        }
        all => all,
    };

    let (first, others) = candidates.split_first().ok_or_else(|| {
        ConditionError::TypeMismatch(format!("{}() of an empty list", function.name()))
    })?;
    let mut best = first;
    for candidate in others {
        let ordering = compare_values(candidate, best)?;
        let better = match function {
            Function::Min => ordering == Ordering::Less,
            _ => ordering == Ordering::Greater,
        };
        if better {
            best = candidate;
        }
    }
    Ok(best.clone())
}

fn call_unary(function: Function, value: &Value) -> Result<Value, ConditionError> {
    match function {
        Function::Len => match value {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            other => Err(ConditionError::TypeMismatch(format!(
                "object of type '{}' has no len()",
                type_name(other)
            ))),
        },
        Function::Int => match value {
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            Value::Number(_) => match Num::from_value(value) {
                Some(Num::Int(i)) => Ok(Value::from(i)),
                Some(Num::Float(f)) if f.is_finite() && f.abs() < i64::MAX as f64 => {
                    Ok(Value::from(f.trunc() as i64))
                }
                _ => Err(ConditionError::Overflow),
            },
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| {
                ConditionError::TypeMismatch(format!("invalid literal for int(): '{}'", s))
            }),
            other => Err(ConditionError::TypeMismatch(format!(
                "int() argument must be a string or a number, not '{}'",
                type_name(other)
            ))),
        },
        Function::Float => {
            let f = match value {
                Value::Bool(b) => *b as i64 as f64,
                Value::Number(n) => n.as_f64().ok_or(ConditionError::Overflow)?,
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                    ConditionError::TypeMismatch(format!(
                        "could not convert string to float: '{}'",
                        s
                    ))
                })?,
                other => {
                    return Err(ConditionError::TypeMismatch(format!(
                        "float() argument must be a string or a number, not '{}'",
                        type_name(other)
                    )))
                }
            };
            Num::Float(f).into_value()
        }
        Function::Str => Ok(Value::String(display(value))),
        Function::Bool => Ok(Value::Bool(truthy(value))),
        Function::Abs => match Num::from_value(value) {
            Some(Num::Int(i)) => Ok(Value::from(i.checked_abs().ok_or(ConditionError::Overflow)?)),
            Some(Num::Float(f)) => Num::Float(f.abs()).into_value(),
            None => Err(ConditionError::TypeMismatch(format!(
                "bad operand type for abs(): '{}'",
                type_name(value)
            ))),
        },
        Function::Min | Function::Max => min_max(function, std::slice::from_ref(value)),
    }
}

impl<'s> Evaluator<'s> {
    fn eval(&self, expr: &Expr) -> Result<Cow<'s, Value>, ConditionError> {
        match expr {
            Expr::Literal(value) => Ok(Cow::Owned(value.clone())),
            Expr::State => Ok(Cow::Owned(Value::Object(self.state.clone()))),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item).map(Cow::into_owned))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Cow::Owned(Value::Array(values)))
            }
            Expr::Index { target, key } => {
                let key = self.eval(key)?;
                if **target == Expr::State {
                    let name = key.as_str().ok_or_else(|| {
                        ConditionError::TypeMismatch("state keys must be strings".to_string())
                    })?;
                    return self
                        .state
                        .get(name)
                        .map(Cow::Borrowed)
                        .ok_or_else(|| ConditionError::MissingKey(name.to_string()));
                }
                match self.eval(target)? {
                    Cow::Borrowed(container) => lookup(container, &key).map(Cow::Borrowed),
                    Cow::Owned(container) => lookup(&container, &key).map(|v| Cow::Owned(v.clone())),
                }
            }
            Expr::Get {
                target,
                key,
                default,
            } => {
                let key = self.eval(key)?;
                let name = key.as_str().ok_or_else(|| {
                    ConditionError::TypeMismatch("get() keys must be strings".to_string())
                })?;

                let found = if **target == Expr::State {
                    self.state.get(name).map(Cow::Borrowed)
                } else {
                    match self.eval(target)? {
                        Cow::Borrowed(Value::Object(map)) => map.get(name).map(Cow::Borrowed),
                        Cow::Owned(Value::Object(mut map)) => map.remove(name).map(Cow::Owned),
                        other => {
                            return Err(ConditionError::TypeMismatch(format!(
                                "'{}' object has no attribute 'get'",
                                type_name(&other)
                            )))
                        }
                    }
                };

                match (found, default) {
                    (Some(value), _) => Ok(value),
                    (None, Some(default)) => self.eval(default),
                    (None, None) => Ok(Cow::Owned(Value::Null)),
                }
            }
            Expr::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg).map(Cow::into_owned))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*function, values).map(Cow::Owned)
            }
            Expr::Neg(inner) => {
                let value = self.eval(inner)?;
                let negated = match Num::from_value(&value) {
                    Some(Num::Int(i)) => Num::Int(i.checked_neg().ok_or(ConditionError::Overflow)?),
                    Some(Num::Float(f)) => Num::Float(-f),
                    None => {
                        return Err(ConditionError::TypeMismatch(format!(
                            "bad operand type for unary -: '{}'",
                            type_name(&value)
                        )))
                    }
                };
                negated.into_value().map(Cow::Owned)
            }
            Expr::Not(inner) => {
                let value = self.eval(inner)?;
                Ok(Cow::Owned(Value::Bool(!truthy(&value))))
            }
            Expr::Arith { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                arith(*op, &left, &right).map(Cow::Owned)
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first)?;
                for (op, operand) in rest {
                    let right = self.eval(operand)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Cow::Owned(Value::Bool(false)));
                    }
                    left = right;
                }
                Ok(Cow::Owned(Value::Bool(true)))
            }
        }
    }
}
