//! # Parameters
//!
//! The payload of a data link: `[count:i32][special][param]*`, where `count`
//! includes the special value. The special value is a method's result or a
//! property's new value; the params are a method's arguments or a property's
//! index.
//!
//! Each value starts with a flags byte, then an optional name and type name,
//! then exactly one of: nothing (null), a servlet reference, a struct and/or
//! array, or a simple value.

pub mod factory;
pub mod simple;
pub mod value;

use morphwire::Reader;
use morphwire::Writer;

pub use factory::InstanceDecoder;
pub use factory::InstanceEncoder;
pub use factory::InstanceFactories;
pub use factory::ReferenceDecoder;
pub use factory::SimpleFactory;
pub use factory::field_map;
pub use value::ArrayValues;
pub use value::DateTime;
pub use value::Native;
pub use value::StructValues;
pub use value::Value;
pub use value::ValueInstance;

use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::ids::ApartmentId;
use crate::ids::ServletId;
use crate::link::Link;
use crate::link::LinkData;
use crate::path::collapse;
use crate::runtime::Runtime;
use crate::stack::LinkStack;

const HAS_VALUE_NAME: u8 = 0x01;
const IS_NULL: u8 = 0x02;
const HAS_TYPE_NAME: u8 = 0x04;
const IS_REFERENCE: u8 = 0x08;
const IS_SERVLET: u8 = 0x10;
const HAS_DEVICE_PATH: u8 = 0x20;
const IS_STRUCT: u8 = 0x10;
const IS_ARRAY: u8 = 0x40;
const ARRAY_ELEM_TYPE: u8 = 0x80;

/// Deepest struct or array nesting a decoder will follow.
pub const MAX_NESTING: usize = 64;

/// Encodes a special value and params into a data link payload.
pub fn encode(factories: &InstanceFactories, special: Option<&Value>, params: &[Value]) -> Result<LinkData> {
    let mut encoder = Encoder { w: Writer::new(), factories };
    encoder.w.count(2, 1 + params.len())?;
    encoder.value(None, special.unwrap_or(&Value::Null))?;
    for param in params {
        encoder.value(None, param)?;
    }
    Ok(LinkData::new(encoder.w.into_bytes()))
}

/// Encodes a fault as an exception payload carrying `code`.
pub fn encode_fault(factories: &InstanceFactories, fault: &Fault, code: i32) -> Result<LinkData> {
    let data = encode(factories, Some(&Value::Fault(fault.clone())), &[])?;
    Ok(LinkData::exception(data.bytes, code))
}

/// Decodes a data link payload into its params and special value.
///
/// `device_path` is how this runtime reaches whoever sent the payload; servlet
/// references are interpreted relative to it.
pub fn decode(
    runtime: &Runtime,
    factories: &InstanceFactories,
    device_path: &LinkStack,
    data: &LinkData,
) -> Result<(Vec<Value>, Value)> {
    let mut r = data.reader();
    if !r.can_read() {
        return Ok((Vec::new(), Value::Null));
    }
    let decoder = Decoder { runtime, factories, device_path };
    let count = r.length()?;
    if count == 0 {
        return Err(Error::protocol("Parameter count must include the special value"));
    }
    let (_, special) = decoder.value(&mut r, 0)?;
    let mut params = Vec::with_capacity(count - 1);
    for _ in 1..count {
        params.push(decoder.value(&mut r, 0)?.1);
    }
    Ok((params, special))
}

/// Decodes an exception payload back into the fault it carries.
pub fn decode_fault(
    runtime: &Runtime,
    factories: &InstanceFactories,
    device_path: &LinkStack,
    data: &LinkData,
) -> Result<Fault> {
    let (_, special) = decode(runtime, factories, device_path, data)?;
    Ok(factory::fault_from(special))
}

struct Encoder<'a> {
    w: Writer,
    factories: &'a InstanceFactories,
}

impl Encoder<'_> {
    fn value(&mut self, name: Option<&str>, value: &Value) -> Result<()> {
        let pos = self.w.placeholder();
        let mut flags = 0;
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            flags |= HAS_VALUE_NAME;
            self.w.identifier(name)?;
        }
        flags |= self.body(value)?;
        self.w.patch(pos, flags)?;
        Ok(())
    }

    fn type_name(&mut self, type_name: Option<&str>) -> Result<u8> {
        match type_name {
            Some(type_name) => {
                self.w.identifier(type_name)?;
                Ok(HAS_TYPE_NAME)
            }
            None => Ok(0),
        }
    }

    fn body(&mut self, value: &Value) -> Result<u8> {
        if value.is_null() {
            return Ok(IS_NULL);
        }
        if let Some((type_name, simple)) = self.factories.encode_simple(value)? {
            let flags = self.type_name(Some(&type_name))?;
            if !simple::encode(&mut self.w, &simple)? {
                return Err(Error::usage(format!("Simple factory for {} produced a complex value", type_name)));
            }
            return Ok(flags);
        }
        if simple::encode(&mut self.w, value)? {
            return Ok(0);
        }
        match value {
            Value::Servlet(servlet) => {
                let flags = self.type_name(servlet.type_name())?;
                self.w.i32(servlet.id().value());
                self.w.i32(servlet.apartment_id().value());
                Ok(flags | IS_REFERENCE | IS_SERVLET)
            }
            Value::Proxy(proxy) => {
                let apartment = proxy
                    .apartment_proxy()
                    .apartment_id()
                    .ok_or_else(|| Error::usage("Servlet proxy has not reached its apartment yet"))?;
                let flags = self.type_name(proxy.type_name())?;
                self.w.i32(proxy.id().value());
                self.w.i32(apartment.value());
                let device_path = proxy.apartment_proxy().device().path().to_bytes()?;
                self.w.blob(&device_path)?;
                Ok(flags | IS_REFERENCE | IS_SERVLET | HAS_DEVICE_PATH)
            }
            Value::Array(items) => {
                self.w.count(2, items.len())?;
                for item in items {
                    self.value(None, item)?;
                }
                Ok(IS_ARRAY)
            }
            Value::Instance(instance) => self.instance(instance),
            other => match self.factories.encode_instance(other)? {
                Some(instance) => self.instance(&instance),
                None => Err(Error::protocol(format!("Encoding of {:?} is not supported", other))),
            },
        }
    }

    fn instance(&mut self, instance: &ValueInstance) -> Result<u8> {
        let mut flags = self.type_name(instance.type_name.as_deref())?;
        if let Some(fields) = &instance.fields {
            flags |= IS_STRUCT;
            self.w.count(2, fields.len())?;
            for (name, value) in fields {
                self.value(Some(name), value)?;
            }
        }
        if let Some(array) = &instance.items {
            flags |= IS_ARRAY;
            self.w.count(2, array.items.len())?;
            if let Some(element_type) = &array.element_type {
                flags |= ARRAY_ELEM_TYPE;
                self.w.identifier(element_type)?;
            }
            for item in &array.items {
                self.value(None, item)?;
            }
        }
        Ok(flags)
    }
}

struct Decoder<'a> {
    runtime: &'a Runtime,
    factories: &'a InstanceFactories,
    device_path: &'a LinkStack,
}

impl Decoder<'_> {
    fn value(&self, r: &mut Reader<'_>, depth: usize) -> Result<(Option<String>, Value)> {
        if depth > MAX_NESTING {
            return Err(Error::protocol("Value nesting too deep"));
        }
        let flags = r.u8()?;
        let name = if flags & HAS_VALUE_NAME != 0 { Some(r.identifier()?) } else { None };
        if flags & IS_NULL != 0 {
            return Ok((name, Value::Null));
        }
        let type_name = if flags & HAS_TYPE_NAME != 0 { Some(r.identifier()?) } else { None };

        if flags & IS_REFERENCE != 0 {
            if flags & IS_SERVLET == 0 {
                return Err(Error::protocol("Only servlet references are supported"));
            }
            return Ok((name, self.servlet(r, flags, type_name)?));
        }

        let is_struct = flags & IS_STRUCT != 0;
        let is_array = flags & IS_ARRAY != 0;
        if is_struct || is_array {
            let instance = self.instance(r, flags, type_name, depth + 1)?;
            if let Some(value) = self.factories.decode_instance(&instance)? {
                return Ok((name, value));
            }
            let value = match instance {
                ValueInstance { type_name: None, fields: None, items: Some(array) } if array.element_type.is_none() => {
                    Value::Array(array.items)
                }
                other => Value::Instance(other),
            };
            return Ok((name, value));
        }

        let simple = simple::decode(r)?;
        Ok((name, self.factories.decode_simple(type_name.as_deref(), simple)?))
    }

    fn instance(&self, r: &mut Reader<'_>, flags: u8, type_name: Option<String>, depth: usize) -> Result<ValueInstance> {
        let mut instance = ValueInstance { type_name, fields: None, items: None };
        if flags & IS_STRUCT != 0 {
            let count = r.length()?;
            let mut fields = Vec::with_capacity(count.min(r.remaining()));
            for _ in 0..count {
                let (name, value) = self.value(r, depth)?;
                fields.push((name.unwrap_or_default(), value));
            }
            instance.fields = Some(fields);
        }
        if flags & IS_ARRAY != 0 {
            let count = r.length()?;
            let element_type = if flags & ARRAY_ELEM_TYPE != 0 { Some(r.identifier()?) } else { None };
            let mut items = Vec::with_capacity(count.min(r.remaining()));
            for _ in 0..count {
                items.push(self.value(r, depth)?.1);
            }
            instance.items = Some(ArrayValues { element_type, items });
        }
        Ok(instance)
    }

    /// Resolves a servlet reference as seen from this runtime: the servlet itself
    /// when it lives here, otherwise a proxy through the shortest known path.
    fn servlet(&self, r: &mut Reader<'_>, flags: u8, type_name: Option<String>) -> Result<Value> {
        let servlet_id = ServletId(r.i32()?);
        let apartment_id = ApartmentId(r.i32()?);
        let mut full_path = if flags & HAS_DEVICE_PATH != 0 {
            LinkStack::from_bytes(r.blob()?.to_vec(), self.runtime.readers().clone())
        } else {
            LinkStack::new()
        };
        full_path.push_stack(self.device_path.clone())?;
        let links = collapse(full_path.to_links()?);

        // A lone hop names this runtime only if it is one of our endpoints. Deeper
        // paths are relative to the hop before them, so they always get a proxy.
        let is_local = match links.as_slice() {
            [] => true,
            [Link::Internet(internet)] => self.runtime.is_local_endpoint(internet.endpoint),
            _ => false,
        };
        if is_local {
            let apartment = self.runtime.apartment(apartment_id).ok_or_else(|| Error::protocol("Apartment not found"))?;
            let servlet = apartment.servlets().find(servlet_id).ok_or_else(|| Error::protocol("Servlet not found"))?;
            return Ok(Value::Servlet(servlet));
        }

        let device = self.runtime.devices().obtain(LinkStack::from_links(links))?;
        let apartment_proxy = device.obtain(self.runtime, apartment_id, self.factories)?;
        let proxy = apartment_proxy.servlet(servlet_id, type_name);
        match self.factories.decode_reference(&proxy)? {
            Some(facade) => Ok(Value::Native(facade)),
            None => Ok(Value::Proxy(proxy)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::object::ObjectBuilder;
    use crate::service::ServiceDef;

    fn endpoint(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), crate::DEFAULT_PORT)
    }

    fn reference(servlet: ServletId, apartment: ApartmentId, path: Vec<Link>) -> LinkData {
        let mut w = Writer::new();
        w.count(2, 1).unwrap();
        w.u8(IS_REFERENCE | IS_SERVLET | HAS_DEVICE_PATH);
        w.i32(servlet.value());
        w.i32(apartment.value());
        w.blob(&LinkStack::from_links(path).to_bytes().unwrap()).unwrap();
        LinkData::new(w.into_bytes())
    }

    fn nested(depth: usize) -> Value {
        (0..depth).fold(Value::Int32(1), |inner, _| Value::Array(vec![inner]))
    }

    #[tokio::test]
    async fn test_reference_locality() {
        let here = endpoint("10.0.0.1");
        let peer = endpoint("10.0.0.2");
        let runtime = Runtime::builder()
            .service(ServiceDef::shared("Library", ObjectBuilder::new().build()))
            .build()
            .unwrap();
        runtime.add_local_endpoint(here);
        let proxy = runtime.via_local("Library").await.unwrap();
        let apartment = proxy.apartment_id().unwrap();
        let factories = runtime.factories();

        // One hop naming this runtime is local.
        let data = reference(ServletId::DEFAULT, apartment, vec![Link::internet(here)]);
        let (_, value) = decode(&runtime, factories, &LinkStack::new(), &data).unwrap();
        assert!(matches!(value, Value::Servlet(_)), "{value:?}");

        // The same address seen through a peer belongs to that peer's side.
        let through_peer = LinkStack::from_links(vec![Link::internet(peer)]);
        let (_, value) = decode(&runtime, factories, &through_peer, &data).unwrap();
        let Value::Proxy(remote) = value else {
            panic!("expected a proxy, got {value:?}");
        };
        assert_eq!(
            remote.apartment_proxy().device().path().to_links().unwrap(),
            vec![Link::internet(here), Link::internet(peer)]
        );
    }

    #[tokio::test]
    async fn test_nesting_is_capped() {
        let runtime = Runtime::new().unwrap();
        let factories = runtime.factories();

        let data = encode(factories, None, &[nested(MAX_NESTING)]).unwrap();
        let (params, _) = decode(&runtime, factories, &LinkStack::new(), &data).unwrap();
        assert_eq!(params, vec![nested(MAX_NESTING)]);

        let data = encode(factories, None, &[nested(MAX_NESTING + 1)]).unwrap();
        let err = decode(&runtime, factories, &LinkStack::new(), &data).unwrap_err();
        assert!(matches!(&err, Error::Protocol { message, .. } if message == "Value nesting too deep"), "{err:?}");
    }
}
