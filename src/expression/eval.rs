//! Tree-walking evaluation of a parsed expression against a variable
//! snapshot.

use super::parser::{BinOp, CmpOp, Expr};
use crate::error::{Error, Result};
use crate::value::{Value, ValueMap};
use std::cmp::Ordering;

pub(crate) struct Evaluator<'a> {
    pub source: &'a str,
    pub vars: &'a ValueMap,
    pub now: i64,
}

impl Evaluator<'_> {
    fn fail(&self, reason: impl Into<String>) -> Error {
        Error::Evaluation {
            expr: self.source.to_string(),
            reason: reason.into(),
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => self.lookup(name),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| self.fail("integer overflow")),
                Value::Bool(b) => Ok(Value::Int(-(b as i64))),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(self.fail(format!("bad operand for unary -: {}", other.type_name()))),
            },
            Expr::Pos(inner) => match self.eval(inner)? {
                Value::Bool(b) => Ok(Value::Int(b as i64)),
                v @ (Value::Int(_) | Value::Float(_)) => Ok(v),
                other => Err(self.fail(format!("bad operand for unary +: {}", other.type_name()))),
            },
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::And(left, right) => {
                let l = self.eval(left)?;
                if !l.is_truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let l = self.eval(left)?;
                if l.is_truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Compare(head, links) => {
                let mut left = self.eval(head)?;
                for (op, operand) in links {
                    let right = self.eval(operand)?;
                    if !self.compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Binary(op, left, right) => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.binary(*op, l, r)
            }
            Expr::Attr(target, name) => match self.eval(target)? {
                Value::Map(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.fail(format!("mapping has no key '{}'", name))),
                other => Err(self.fail(format!("{} has no attribute '{}'", other.type_name(), name))),
            },
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                self.index(target, index)
            }
        }
    }

    /// Look a name up, injecting `now` and falling back to walking map keys
    /// for dotted paths whose flattened form is not a variable.
    fn lookup(&self, name: &str) -> Result<Value> {
        if name == "now" {
            return Ok(Value::Int(self.now));
        }
        if let Some(v) = self.vars.get(name) {
            return Ok(v.clone());
        }
        let mut parts = name.split('.');
        let head = parts.next().unwrap_or(name);
        let mut current = self
            .vars
            .get(head)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        for part in parts {
            current = current
                .as_map()
                .and_then(|m| m.get(part))
                .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        }
        Ok(current.clone())
    }

    fn compare(&self, op: CmpOp, l: &Value, r: &Value) -> Result<bool> {
        match op {
            CmpOp::Eq => return Ok(l.loose_eq(r)),
            CmpOp::Ne => return Ok(!l.loose_eq(r)),
            _ => {}
        }
        let ordering = match (l, r) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (a, b) if is_integral(a) && is_integral(b) => Some(int_of(a).cmp(&int_of(b))),
            (a, b) if a.is_number() && b.is_number() => {
                a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y))
            }
            _ => {
                return Err(self.fail(format!(
                    "cannot order {} and {}",
                    l.type_name(),
                    r.type_name()
                )));
            }
        };
        // NaN compares false in every direction.
        let Some(ordering) = ordering else {
            return Ok(false);
        };
        Ok(match op {
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
            CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
        })
    }

    fn binary(&self, op: BinOp, l: Value, r: Value) -> Result<Value> {
        match (op, &l, &r) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{}{}", a, b))),
            (BinOp::Add, Value::Bytes(a), Value::Bytes(b)) => {
                return Ok(Value::Bytes([a.as_slice(), b.as_slice()].concat()));
            }
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                return Ok(Value::List(a.iter().chain(b).cloned().collect()));
            }
            (BinOp::BitAnd, Value::Bool(a), Value::Bool(b)) => return Ok(Value::Bool(*a & *b)),
            (BinOp::BitOr, Value::Bool(a), Value::Bool(b)) => return Ok(Value::Bool(*a | *b)),
            _ => {}
        }

        if !l.is_number() || !r.is_number() {
            return Err(self.fail(format!(
                "unsupported operand types for {:?}: {} and {}",
                op,
                l.type_name(),
                r.type_name()
            )));
        }

        if is_integral(&l) && is_integral(&r) {
            let (a, b) = (int_of(&l), int_of(&r));
            let overflow = || self.fail("integer overflow");
            return match op {
                BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
                BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
                BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
                BinOp::Div => {
                    if b == 0 {
                        return Err(self.fail("division by zero"));
                    }
                    Ok(Value::Float(a as f64 / b as f64))
                }
                BinOp::Mod => {
                    if b == 0 {
                        return Err(self.fail("modulo by zero"));
                    }
                    // Result takes the sign of the divisor.
                    let m = a.checked_rem(b).ok_or_else(overflow)?;
                    Ok(Value::Int(if m != 0 && (m < 0) != (b < 0) { m + b } else { m }))
                }
                BinOp::Pow => {
                    if b < 0 {
                        return Ok(Value::Float((a as f64).powf(b as f64)));
                    }
                    u32::try_from(b)
                        .ok()
                        .and_then(|e| a.checked_pow(e))
                        .map(Value::Int)
                        .ok_or_else(overflow)
                }
                BinOp::BitAnd => Ok(Value::Int(a & b)),
                BinOp::BitOr => Ok(Value::Int(a | b)),
            };
        }

        let (a, b) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
        match op {
            BinOp::Add => Ok(Value::Float(a + b)),
            BinOp::Sub => Ok(Value::Float(a - b)),
            BinOp::Mul => Ok(Value::Float(a * b)),
            BinOp::Div => {
                if b == 0.0 {
                    return Err(self.fail("division by zero"));
                }
                Ok(Value::Float(a / b))
            }
            BinOp::Mod => {
                if b == 0.0 {
                    return Err(self.fail("modulo by zero"));
                }
                Ok(Value::Float(a - b * (a / b).floor()))
            }
            BinOp::Pow => Ok(Value::Float(a.powf(b))),
            BinOp::BitAnd | BinOp::BitOr => Err(self.fail("bitwise operators need integers")),
        }
    }

    fn index(&self, target: Value, index: Value) -> Result<Value> {
        let position = |len: usize| -> Result<usize> {
            let i = index
                .as_i64()
                .filter(|_| is_integral(&index))
                .ok_or_else(|| self.fail(format!("index must be an integer, got {}", index.type_name())))?;
            let resolved = if i < 0 { len as i64 + i } else { i };
            if resolved < 0 || resolved >= len as i64 {
                return Err(self.fail(format!("index {} out of range", i)));
            }
            Ok(resolved as usize)
        };
        match &target {
            Value::List(items) => Ok(items[position(items.len())?].clone()),
            Value::Bytes(bytes) => Ok(Value::Int(bytes[position(bytes.len())?] as i64)),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::Str(chars[position(chars.len())?].to_string()))
            }
            Value::Map(map) => {
                let key = match &index {
                    Value::Str(s) => s.clone(),
                    other => other.to_string(),
                };
                map.get(&key)
                    .cloned()
                    .ok_or_else(|| self.fail(format!("key '{}' not found", key)))
            }
            other => Err(self.fail(format!("{} is not subscriptable", other.type_name()))),
        }
    }
}

fn is_integral(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Bool(_))
}

fn int_of(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        _ => 0,
    }
}
