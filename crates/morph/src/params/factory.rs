//! # Instance Factories
//!
//! Chains of converters between application values and their wire shapes.
//! Each chain is tried in order and the first factory that recognises a value
//! wins. Four chains exist:
//!
//! - **Simple**: a value that travels as a simple value plus a type name
//!   (`true` as byte `0xFF` named `"Bool"`).
//! - **Encoders**: a value that travels as a struct or array instance.
//! - **Decoders**: an instance turned back into an application value.
//! - **References**: a servlet proxy wrapped in an application facade.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::params::value::DateTime;
use crate::params::value::Native;
use crate::params::value::StructValues;
use crate::params::value::Value;
use crate::params::value::ValueInstance;
use crate::servlet_proxy::ServletProxy;

pub trait SimpleFactory: Send + Sync + 'static {
    /// Returns the type name and the simple value standing in for `value`.
    fn encode_simple(&self, value: &Value) -> Result<Option<(String, Value)>>;

    /// Rebuilds the value a simple value named `type_name` stands for.
    fn decode_simple(&self, type_name: &str, value: &Value) -> Result<Option<Value>>;
}

pub trait InstanceEncoder: Send + Sync + 'static {
    fn encode_instance(&self, value: &Value) -> Result<Option<ValueInstance>>;
}

pub trait InstanceDecoder: Send + Sync + 'static {
    fn decode_instance(&self, instance: &ValueInstance) -> Result<Option<Value>>;
}

pub trait ReferenceDecoder: Send + Sync + 'static {
    fn decode_reference(&self, proxy: &Arc<ServletProxy>) -> Result<Option<Native>>;
}

#[derive(Clone)]
pub struct InstanceFactories {
    simple: Vec<Arc<dyn SimpleFactory>>,
    encoders: Vec<Arc<dyn InstanceEncoder>>,
    decoders: Vec<Arc<dyn InstanceDecoder>>,
    references: Vec<Arc<dyn ReferenceDecoder>>,
}

impl Default for InstanceFactories {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstanceFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceFactories")
            .field("simple", &self.simple.len())
            .field("encoders", &self.encoders.len())
            .field("decoders", &self.decoders.len())
            .field("references", &self.references.len())
            .finish()
    }
}

impl InstanceFactories {
    /// The predefined chains: booleans, date-times and faults.
    pub fn new() -> Self {
        let mut factories = Self::empty();
        factories.add_simple(PredefinedSimple);
        factories.add_encoder(FaultEncoder);
        factories
    }

    pub fn empty() -> Self {
        Self { simple: Vec::new(), encoders: Vec::new(), decoders: Vec::new(), references: Vec::new() }
    }

    pub fn add_simple(&mut self, factory: impl SimpleFactory) -> &mut Self {
        self.simple.push(Arc::new(factory));
        self
    }

    pub fn add_encoder(&mut self, factory: impl InstanceEncoder) -> &mut Self {
        self.encoders.push(Arc::new(factory));
        self
    }

    pub fn add_decoder(&mut self, factory: impl InstanceDecoder) -> &mut Self {
        self.decoders.push(Arc::new(factory));
        self
    }

    pub fn add_reference(&mut self, factory: impl ReferenceDecoder) -> &mut Self {
        self.references.push(Arc::new(factory));
        self
    }

    /// Carries `T` as a struct named `type_name`, both ways.
    pub fn add_struct<T, E, D>(&mut self, type_name: impl Into<String>, encode: E, decode: D) -> &mut Self
    where
        T: Any + Send + Sync,
        E: Fn(&T) -> StructValues + Send + Sync + 'static,
        D: Fn(&ValueInstance) -> Result<T> + Send + Sync + 'static,
    {
        let factory = Arc::new(StructFactory { type_name: type_name.into(), encode, decode, _marker: std::marker::PhantomData });
        self.encoders.push(factory.clone());
        self.decoders.push(factory);
        self
    }

    /// Wraps proxies to servlets whose type name is `type_name` in a `T`.
    pub fn add_facade<T, F>(&mut self, type_name: impl Into<String>, make: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(Arc<ServletProxy>) -> T + Send + Sync + 'static,
    {
        self.references.push(Arc::new(FacadeFactory { type_name: type_name.into(), make, _marker: std::marker::PhantomData }));
        self
    }

    pub(crate) fn encode_simple(&self, value: &Value) -> Result<Option<(String, Value)>> {
        for factory in &self.simple {
            if let Some(found) = factory.encode_simple(value)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Without a type name, or when no factory claims it, the simple value stands as is.
    pub(crate) fn decode_simple(&self, type_name: Option<&str>, value: Value) -> Result<Value> {
        let Some(type_name) = type_name else {
            return Ok(value);
        };
        for factory in &self.simple {
            if let Some(found) = factory.decode_simple(type_name, &value)? {
                return Ok(found);
            }
        }
        Ok(value)
    }

    pub(crate) fn encode_instance(&self, value: &Value) -> Result<Option<ValueInstance>> {
        for factory in &self.encoders {
            if let Some(found) = factory.encode_instance(value)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub(crate) fn decode_instance(&self, instance: &ValueInstance) -> Result<Option<Value>> {
        for factory in &self.decoders {
            if let Some(found) = factory.decode_instance(instance)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub(crate) fn decode_reference(&self, proxy: &Arc<ServletProxy>) -> Result<Option<Native>> {
        for factory in &self.references {
            if let Some(found) = factory.decode_reference(proxy)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

// ============================================================================
//  PREDEFINED
// ============================================================================

const BOOL: &str = "Bool";
const DATE_TIME: &str = "DateTime";

/// Booleans and date-times. Dates, times and currency have no wire form yet.
struct PredefinedSimple;

impl SimpleFactory for PredefinedSimple {
    fn encode_simple(&self, value: &Value) -> Result<Option<(String, Value)>> {
        Ok(match value {
            Value::Bool(b) => Some((BOOL.to_string(), Value::Byte(if *b { 0xFF } else { 0x00 }))),
            Value::DateTime(dt) => Some((DATE_TIME.to_string(), Value::String(dt.to_string()))),
            _ => None,
        })
    }

    fn decode_simple(&self, type_name: &str, value: &Value) -> Result<Option<Value>> {
        match (type_name, value) {
            (BOOL, Value::Byte(b)) => Ok(Some(Value::Bool(*b != 0))),
            (DATE_TIME, Value::String(s)) => DateTime::parse(s)
                .map(|dt| Some(Value::DateTime(dt)))
                .ok_or_else(|| Error::protocol(format!("Invalid date time \"{}\"", s))),
            ("Date" | "Time" | "Currency", _) => {
                Err(Error::protocol(format!("Decoding of {} values is not supported", type_name)))
            }
            _ => Ok(None),
        }
    }
}

/// Faults travel as `{message, trace}` structs named after their class.
struct FaultEncoder;

impl InstanceEncoder for FaultEncoder {
    fn encode_instance(&self, value: &Value) -> Result<Option<ValueInstance>> {
        let Value::Fault(fault) = value else {
            return Ok(None);
        };
        Ok(Some(ValueInstance::structure(
            fault.class_name.clone(),
            vec![
                ("message".to_string(), Value::String(fault.message.clone())),
                ("trace".to_string(), Value::String(fault.trace.clone())),
            ],
        )))
    }
}

/// Reads a fault back out of whatever an exception payload decoded to.
pub(crate) fn fault_from(value: Value) -> Fault {
    match value {
        Value::Fault(fault) => fault,
        Value::Instance(instance) => {
            let text = |name: &str| instance.field(name).and_then(Value::as_str).unwrap_or_default().to_string();
            Fault {
                class_name: instance.type_name.clone().unwrap_or_else(|| "Error".to_string()),
                message: text("message"),
                trace: text("trace"),
            }
        }
        Value::String(message) => Fault::new("Error", message),
        other => Fault::new("Error", format!("Unrecognised exception payload {:?}", other)),
    }
}

// ============================================================================
//  TYPED FACTORIES
// ============================================================================

struct StructFactory<T, E, D> {
    type_name: String,
    encode: E,
    decode: D,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, E, D> InstanceEncoder for StructFactory<T, E, D>
where
    T: Any + Send + Sync,
    E: Fn(&T) -> StructValues + Send + Sync + 'static,
    D: Fn(&ValueInstance) -> Result<T> + Send + Sync + 'static,
{
    fn encode_instance(&self, value: &Value) -> Result<Option<ValueInstance>> {
        Ok(value.downcast::<T>().map(|t| ValueInstance::structure(self.type_name.clone(), (self.encode)(t))))
    }
}

impl<T, E, D> InstanceDecoder for StructFactory<T, E, D>
where
    T: Any + Send + Sync,
    E: Fn(&T) -> StructValues + Send + Sync + 'static,
    D: Fn(&ValueInstance) -> Result<T> + Send + Sync + 'static,
{
    fn decode_instance(&self, instance: &ValueInstance) -> Result<Option<Value>> {
        if instance.type_name.as_deref() != Some(self.type_name.as_str()) || instance.fields.is_none() {
            return Ok(None);
        }
        Ok(Some(Value::native((self.decode)(instance)?)))
    }
}

struct FacadeFactory<T, F> {
    type_name: String,
    make: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> ReferenceDecoder for FacadeFactory<T, F>
where
    T: Any + Send + Sync,
    F: Fn(Arc<ServletProxy>) -> T + Send + Sync + 'static,
{
    fn decode_reference(&self, proxy: &Arc<ServletProxy>) -> Result<Option<Native>> {
        if proxy.type_name() != Some(self.type_name.as_str()) {
            return Ok(None);
        }
        Ok(Some(proxy.facade(|| Arc::new((self.make)(proxy.clone())) as Native)))
    }
}

/// The fields of a struct instance by name.
pub fn field_map(instance: &ValueInstance) -> HashMap<&str, &Value> {
    instance.fields.iter().flatten().map(|(name, value)| (name.as_str(), value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn point_factories() -> InstanceFactories {
        let mut factories = InstanceFactories::new();
        factories.add_struct(
            "Point",
            |p: &Point| vec![("x".to_string(), Value::Int32(p.x)), ("y".to_string(), Value::Int32(p.y))],
            |instance| {
                let fields = field_map(instance);
                let get = |name: &str| {
                    fields.get(name).and_then(|v| v.as_i32()).ok_or_else(|| Error::protocol("Point field missing"))
                };
                Ok(Point { x: get("x")?, y: get("y")? })
            },
        );
        factories
    }

    #[test]
    fn test_bool_is_a_named_byte() {
        let factories = InstanceFactories::new();
        let (name, value) = factories.encode_simple(&Value::Bool(true)).unwrap().unwrap();
        assert_eq!(name, "Bool");
        assert_eq!(value, Value::Byte(0xFF));
        assert_eq!(factories.decode_simple(Some("Bool"), Value::Byte(0)).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_date_time_is_a_named_string() {
        let factories = InstanceFactories::new();
        let at = DateTime::parse("2024-03-01T12:30:05.5+01:00").unwrap();
        let (name, value) = factories.encode_simple(&Value::DateTime(at)).unwrap().unwrap();
        assert_eq!(name, "DateTime");
        assert_eq!(value.as_str(), Some("2024-03-01T12:30:05.500+01:00"));
        assert_eq!(factories.decode_simple(Some("DateTime"), value).unwrap(), Value::DateTime(at));

        let impossible = Value::from("2024-02-30T00:00:00");
        assert!(factories.decode_simple(Some("DateTime"), impossible).is_err());
    }

    #[test]
    fn test_unknown_type_name_keeps_simple_value() {
        let factories = InstanceFactories::new();
        assert_eq!(factories.decode_simple(Some("Celsius"), Value::Int32(21)).unwrap(), Value::Int32(21));
    }

    #[test]
    fn test_unsupported_simple_types() {
        let factories = InstanceFactories::new();
        assert!(factories.decode_simple(Some("Currency"), Value::Int64(5)).is_err());
    }

    #[test]
    fn test_struct_factory_both_ways() {
        let factories = point_factories();
        let instance = factories.encode_instance(&Value::native(Point { x: 1, y: 2 })).unwrap().unwrap();
        assert_eq!(instance.type_name.as_deref(), Some("Point"));
        let decoded = factories.decode_instance(&instance).unwrap().unwrap();
        assert_eq!(decoded.downcast::<Point>(), Some(&Point { x: 1, y: 2 }));
    }

    #[test]
    fn test_fault_travels_as_struct() {
        let factories = InstanceFactories::new();
        let fault = Fault::new("BookingError", "No seats").with_trace("at Book");
        let instance = factories.encode_instance(&Value::Fault(fault.clone())).unwrap().unwrap();
        assert_eq!(fault_from(Value::Instance(instance)), fault);
    }
}
