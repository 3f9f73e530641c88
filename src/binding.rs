//! Host binding: dynamically typed entry points over `IdWeakMap`.
//!
//! A scripting host hands over loosely typed argument lists. All shape
//! checking happens here so the registry itself only ever sees valid keys
//! and objects; a rejected call has not mutated anything.

use crate::error::RegistryError;
use crate::heap::Gc;
use crate::id_alloc::{allocate_id, MAX_ID};
use crate::id_weak_map::IdWeakMap;
use crate::Key;
use core::fmt;
use core::hash::BuildHasher;
use core::str::FromStr;

/// A host value as seen at the binding boundary.
pub enum Value<T> {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(Gc<T>),
}

impl<T> Value<T> {
    pub fn as_object(&self) -> Option<&Gc<T>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(_) => "object",
        }
    }
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        match self {
            Value::Undefined => Value::Undefined,
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Number(*n),
            Value::String(s) => Value::String(s.clone()),
            Value::Object(o) => Value::Object(o.clone()),
        }
    }
}

/// Objects compare by identity.
impl<T> PartialEq for Value<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Gc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "Number({n})"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::String(s) => write!(f, "String({s:?})"),
            other => f.write_str(other.type_name()),
        }
    }
}

impl<T> From<Gc<T>> for Value<T> {
    fn from(o: Gc<T>) -> Self {
        Value::Object(o)
    }
}

impl<T> From<Option<Gc<T>>> for Value<T> {
    fn from(o: Option<Gc<T>>) -> Self {
        o.map_or(Value::Null, Value::Object)
    }
}

impl<T> From<bool> for Value<T> {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T> From<f64> for Value<T> {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl<T> From<&str> for Value<T> {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

/// Methods the binding exposes, under their host-facing names.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Method {
    Set,
    Get,
    Has,
    Delete,
    AllocateId,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Set,
        Method::Get,
        Method::Has,
        Method::Delete,
        Method::AllocateId,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::Set => "set",
            Method::Get => "get",
            Method::Has => "has",
            Method::Delete => "delete",
            Method::AllocateId => "allocateId",
        }
    }

    fn arity(self) -> usize {
        match self {
            Method::Set => 2,
            Method::Get | Method::Has | Method::Delete => 1,
            Method::AllocateId => 0,
        }
    }
}

impl FromStr for Method {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| RegistryError::invalid(format!("unknown method `{s}`")))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Convert a host number into a registry key.
///
/// Accepts finite, integral values in `0..=MAX_ID`.
pub fn key_from_value<T>(value: &Value<T>) -> Result<Key, RegistryError> {
    let Value::Number(n) = *value else {
        return Err(RegistryError::invalid(format!(
            "key must be a number, got {}",
            value.type_name()
        )));
    };
    if !n.is_finite() || n.fract() != 0.0 || n < 0.0 || n > MAX_ID as f64 {
        return Err(RegistryError::invalid(format!(
            "key must be an integer in 0..={MAX_ID}, got {n}"
        )));
    }
    Ok(n as Key)
}

impl<T, S> IdWeakMap<T, S>
where
    T: 'static,
    S: BuildHasher + 'static,
{
    /// Invoke `method` with host arguments. Extra arguments are ignored.
    pub fn call(&self, method: Method, args: &[Value<T>]) -> Result<Value<T>, RegistryError> {
        if args.len() < method.arity() {
            return Err(RegistryError::invalid(format!(
                "{method} expects {} argument(s), got {}",
                method.arity(),
                args.len()
            )));
        }
        match method {
            Method::Set => {
                let key = key_from_value(&args[0])?;
                let object = args[1].as_object().ok_or_else(|| {
                    RegistryError::invalid(format!(
                        "value must be an object, got {}",
                        args[1].type_name()
                    ))
                })?;
                self.set(key, object)?;
                Ok(Value::Undefined)
            }
            Method::Get => Ok(self.get(key_from_value(&args[0])?).into()),
            Method::Has => Ok(self.has(key_from_value(&args[0])?).into()),
            Method::Delete => {
                self.delete(key_from_value(&args[0])?);
                Ok(Value::Undefined)
            }
            Method::AllocateId => Ok(Value::Number(allocate_id()? as f64)),
        }
    }

    /// `call` with the method looked up by host name.
    pub fn call_named(&self, name: &str, args: &[Value<T>]) -> Result<Value<T>, RegistryError> {
        self.call(name.parse()?, args)
    }
}
