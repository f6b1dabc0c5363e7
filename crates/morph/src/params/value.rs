//! Dynamically typed values carried in data links.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::FixedOffset;
use chrono::NaiveDateTime;
use chrono::SecondsFormat;

use crate::apartment::Servlet;
use crate::error::Fault;
use crate::servlet_proxy::ServletProxy;

/// An application object handed through the runtime without being encoded by it.
pub type Native = Arc<dyn Any + Send + Sync>;

/// Named fields of a struct, in wire order.
pub type StructValues = Vec<(String, Value)>;

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Char(char),
    String(String),
    DateTime(DateTime),
    Bytes(Vec<u8>),
    Int16s(Vec<i16>),
    Int32s(Vec<i32>),
    Int64s(Vec<i64>),
    Chars(Vec<char>),
    Strings(Vec<String>),
    /// An untyped array of arbitrary values.
    Array(Vec<Value>),
    /// A struct and/or array the instance factories did not turn into anything else.
    Instance(ValueInstance),
    /// A servlet in this process.
    Servlet(Arc<Servlet>),
    /// A servlet somewhere else.
    Proxy(Arc<ServletProxy>),
    Native(Native),
    Fault(Fault),
}

impl Value {
    pub fn native<T: Any + Send + Sync>(value: T) -> Self {
        Value::Native(Arc::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer that fits.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Byte(v) => Some(*v as i32),
            Value::Int16(v) => Some(*v as i32),
            Value::Int32(v) => Some(*v),
            Value::Int64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            other => other.as_i32().map(i64::from),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_servlet(&self) -> Option<&Arc<Servlet>> {
        match self {
            Value::Servlet(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Arc<ServletProxy>> {
        match self {
            Value::Proxy(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ValueInstance> {
        match self {
            Value::Instance(v) => Some(v),
            _ => None,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Value::Native(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Looks up a field of a struct instance.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_instance()?.field(name)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Byte(a), Byte(b)) => a == b,
            (Int16(a), Int16(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (Int64(a), Int64(b)) => a == b,
            (Float32(a), Float32(b)) => a == b,
            (Float64(a), Float64(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (String(a), String(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Int16s(a), Int16s(b)) => a == b,
            (Int32s(a), Int32s(b)) => a == b,
            (Int64s(a), Int64s(b)) => a == b,
            (Chars(a), Chars(b)) => a == b,
            (Strings(a), Strings(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Instance(a), Instance(b)) => a == b,
            (Servlet(a), Servlet(b)) => Arc::ptr_eq(a, b),
            (Proxy(a), Proxy(b)) => Arc::ptr_eq(a, b),
            (Native(a), Native(b)) => Arc::ptr_eq(a, b),
            (Fault(a), Fault(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Byte(v) => write!(f, "Byte({})", v),
            Value::Int16(v) => write!(f, "Int16({})", v),
            Value::Int32(v) => write!(f, "Int32({})", v),
            Value::Int64(v) => write!(f, "Int64({})", v),
            Value::Float32(v) => write!(f, "Float32({})", v),
            Value::Float64(v) => write!(f, "Float64({})", v),
            Value::Char(v) => write!(f, "Char({:?})", v),
            Value::String(v) => write!(f, "String({:?})", v),
            Value::DateTime(v) => write!(f, "DateTime({})", v),
            Value::Bytes(v) => write!(f, "Bytes({:?})", v),
            Value::Int16s(v) => write!(f, "Int16s({:?})", v),
            Value::Int32s(v) => write!(f, "Int32s({:?})", v),
            Value::Int64s(v) => write!(f, "Int64s({:?})", v),
            Value::Chars(v) => write!(f, "Chars({:?})", v),
            Value::Strings(v) => write!(f, "Strings({:?})", v),
            Value::Array(v) => f.debug_tuple("Array").field(v).finish(),
            Value::Instance(v) => write!(f, "{:?}", v),
            Value::Servlet(v) => write!(f, "Servlet({}, {})", v.apartment_id(), v.id()),
            Value::Proxy(v) => write!(f, "Proxy({})", v.id()),
            Value::Native(_) => write!(f, "Native(..)"),
            Value::Fault(v) => write!(f, "Fault({})", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Fault> for Value {
    fn from(v: Fault) -> Self {
        Value::Fault(v)
    }
}

/// The decoded shape of a struct and/or array value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueInstance {
    pub type_name: Option<String>,
    pub fields: Option<StructValues>,
    pub items: Option<ArrayValues>,
}

impl ValueInstance {
    pub fn structure(type_name: impl Into<String>, fields: StructValues) -> Self {
        Self { type_name: Some(type_name.into()), fields: Some(fields), items: None }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref()?.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayValues {
    pub element_type: Option<String>,
    pub items: Vec<Value>,
}

// ============================================================================
//  DATE TIME
// ============================================================================

/// A calendar date and time, carried on the wire as an XML schema string
/// such as `2024-03-01T12:30:05.250+01:00`. The zone is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTime {
    /// No zone given: a wall-clock time.
    Local(NaiveDateTime),
    Zoned(chrono::DateTime<FixedOffset>),
}

const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

impl DateTime {
    pub fn parse(text: &str) -> Option<Self> {
        if let Ok(zoned) = chrono::DateTime::parse_from_rfc3339(text) {
            return Some(DateTime::Zoned(zoned));
        }
        NaiveDateTime::parse_from_str(text, LOCAL_FORMAT).ok().map(DateTime::Local)
    }
}

impl From<NaiveDateTime> for DateTime {
    fn from(value: NaiveDateTime) -> Self {
        DateTime::Local(value)
    }
}

impl From<chrono::DateTime<FixedOffset>> for DateTime {
    fn from(value: chrono::DateTime<FixedOffset>) -> Self {
        DateTime::Zoned(value)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateTime::Local(local) => write!(f, "{}", local.format(LOCAL_FORMAT)),
            DateTime::Zoned(zoned) => f.write_str(&zoned.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(text: &str) -> DateTime {
        DateTime::Local(NaiveDateTime::parse_from_str(text, LOCAL_FORMAT).unwrap())
    }

    #[test]
    fn test_date_time_text() {
        let cases = [
            ("2024-03-01T12:30:05", local("2024-03-01T12:30:05")),
            ("2024-03-01T12:30:05.250Z", DateTime::Zoned(chrono::DateTime::parse_from_rfc3339("2024-03-01T12:30:05.25+00:00").unwrap())),
            ("1999-12-31T23:59:59-05:30", DateTime::Zoned(chrono::DateTime::parse_from_rfc3339("1999-12-31T23:59:59-05:30").unwrap())),
        ];
        for (text, expected) in cases {
            assert_eq!(DateTime::parse(text), Some(expected), "{}", text);
            assert_eq!(expected.to_string(), text);
        }
    }

    #[test]
    fn test_date_time_keeps_full_precision() {
        let parsed = DateTime::parse("2024-03-01T12:30:05.1234567").unwrap();
        let DateTime::Local(local) = parsed else {
            panic!("expected a local time");
        };
        assert_eq!(local.and_utc().timestamp_subsec_nanos(), 123_456_700);
        assert_eq!(DateTime::parse(&parsed.to_string()), Some(parsed));
    }

    #[test]
    fn test_date_time_rejects_garbage() {
        assert_eq!(DateTime::parse("yesterday"), None);
        assert_eq!(DateTime::parse("2024-13-01T00:00:00"), None);
        assert_eq!(DateTime::parse("2024-01-01T25:00:00"), None);
        assert_eq!(DateTime::parse("2024-02-30T00:00:00"), None);
        assert_eq!(DateTime::parse("2023-02-29T00:00:00Z"), None);
    }

    #[test]
    fn test_value_numeric_views() {
        assert_eq!(Value::Int16(7).as_i32(), Some(7));
        assert_eq!(Value::Int64(i64::MAX).as_i32(), None);
        assert_eq!(Value::Byte(3).as_i64(), Some(3));
        assert_eq!(Value::from("x").as_i32(), None);
    }
}
