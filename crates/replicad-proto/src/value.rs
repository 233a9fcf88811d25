//! Distributable attribute values.

use crate::dset::DSet;
use crate::oid_list::OidList;
use crate::Oid;
use serde::{Deserialize, Serialize};

/// A value that can live in an object attribute, an event payload, or an
/// invocation argument list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Oids(OidList),
    Set(DSet),
}

impl Value {
    /// Short name of the variant, used in type mismatch errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Oids(_) => "oids",
            Value::Set(_) => "set",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_oids(&self) -> Option<&OidList> {
        match self {
            Value::Oids(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&DSet> {
        match self {
            Value::Set(set) => Some(set),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<OidList> for Value {
    fn from(list: OidList) -> Self {
        Value::Oids(list)
    }
}

impl From<DSet> for Value {
    fn from(set: DSet) -> Self {
        Value::Set(set)
    }
}

impl FromIterator<Oid> for Value {
    fn from_iter<I: IntoIterator<Item = Oid>>(iter: I) -> Self {
        Value::Oids(iter.into_iter().collect())
    }
}
