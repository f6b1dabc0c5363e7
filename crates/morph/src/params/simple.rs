//! Simple values: integers, floats, characters, strings and arrays of them.
//!
//! A simple value starts with one type byte:
//!
//! - bit 0: character (else numeric)
//! - bit 1: array, with bits 2..3 the count size code
//! - numeric: bit 4 float, bits 6..7 the value size code
//! - character: bit 4 unicode, bit 5 string, bits 6..7 the string length size code

use morphwire::Reader;
use morphwire::Writer;

use crate::error::Error;
use crate::error::Result;
use crate::params::value::Value;

const IS_CHARACTER: u8 = 0x01;
const IS_ARRAY: u8 = 0x02;
const ARRAY_SIZE: u8 = 0x0C;
const IS_FLOAT: u8 = 0x10;
const VALUE_SIZE: u8 = 0xC0;
const IS_UNICODE: u8 = 0x10;
const IS_STRING: u8 = 0x20;
const STRING_LENGTH: u8 = 0xC0;

const BYTE: u8 = 0x00;
const INT16: u8 = 0x40;
const INT32: u8 = 0x80;
const INT64: u8 = 0xC0;
const FLOAT32: u8 = 0x90;
const FLOAT64: u8 = 0xD0;
const CHAR: u8 = 0x11;
const STRING: u8 = 0xB1;
const BYTES: u8 = 0x0A;
const INT16S: u8 = 0x4A;
const INT32S: u8 = 0x8A;
const INT64S: u8 = 0xCA;
const CHARS: u8 = 0x1B;
const STRINGS: u8 = 0xBB;

fn utf16_unit(c: char) -> Result<i16> {
    let mut units = [0u16; 2];
    match c.encode_utf16(&mut units) {
        [unit] => Ok(*unit as i16),
        _ => Err(Error::usage(format!("Character {:?} does not fit in one UTF-16 unit", c))),
    }
}

fn char_from(unit: u16) -> Result<char> {
    char::from_u32(unit as u32).ok_or_else(|| Error::protocol(format!("Invalid character 0x{:04X}", unit)))
}

/// Writes `value` if it is simple. Returns `false`, writing nothing, otherwise.
pub(crate) fn encode(w: &mut Writer, value: &Value) -> Result<bool> {
    match value {
        Value::Byte(v) => {
            w.u8(BYTE);
            w.u8(*v);
        }
        Value::Int16(v) => {
            w.u8(INT16);
            w.i16(*v);
        }
        Value::Int32(v) => {
            w.u8(INT32);
            w.i32(*v);
        }
        Value::Int64(v) => {
            w.u8(INT64);
            w.i64(*v);
        }
        Value::Float32(v) => {
            w.u8(FLOAT32);
            w.f32(*v);
        }
        Value::Float64(v) => {
            w.u8(FLOAT64);
            w.f64(*v);
        }
        Value::Char(c) => {
            let unit = utf16_unit(*c)?;
            w.u8(CHAR);
            w.i16(unit);
        }
        Value::String(s) => {
            w.u8(STRING);
            w.string(s)?;
        }
        Value::Bytes(v) => {
            w.u8(BYTES);
            w.count(2, v.len())?;
            w.bytes(v);
        }
        Value::Int16s(v) => {
            w.u8(INT16S);
            w.count(2, v.len())?;
            v.iter().for_each(|x| w.i16(*x));
        }
        Value::Int32s(v) => {
            w.u8(INT32S);
            w.count(2, v.len())?;
            v.iter().for_each(|x| w.i32(*x));
        }
        Value::Int64s(v) => {
            w.u8(INT64S);
            w.count(2, v.len())?;
            v.iter().for_each(|x| w.i64(*x));
        }
        Value::Chars(v) => {
            let units = v.iter().map(|c| utf16_unit(*c)).collect::<Result<Vec<_>>>()?;
            w.u8(CHARS);
            w.count(2, units.len())?;
            units.into_iter().for_each(|u| w.i16(u));
        }
        Value::Strings(v) => {
            w.u8(STRINGS);
            w.count(2, v.len())?;
            for s in v {
                w.string(s)?;
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Value> {
    let simple = r.u8()?;
    let is_array = simple & IS_ARRAY != 0;
    let count = if is_array { Some(r.count((simple & ARRAY_SIZE) >> 2)?) } else { None };

    if simple & IS_CHARACTER == 0 {
        let size = (simple & VALUE_SIZE) >> 6;
        if simple & IS_FLOAT != 0 {
            return match (size, count) {
                (2, None) => Ok(Value::Float32(r.f32()?)),
                (3, None) => Ok(Value::Float64(r.f64()?)),
                _ => Err(Error::protocol(format!("Unsupported simple type 0x{:02X}", simple))),
            };
        }
        return Ok(match (size, count) {
            (0, None) => Value::Byte(r.u8()?),
            (1, None) => Value::Int16(r.i16()?),
            (2, None) => Value::Int32(r.i32()?),
            (_, None) => Value::Int64(r.i64()?),
            (0, Some(n)) => Value::Bytes(r.bytes(n)?.to_vec()),
            (1, Some(n)) => Value::Int16s((0..n).map(|_| r.i16()).collect::<morphwire::Result<_>>()?),
            (2, Some(n)) => Value::Int32s((0..n).map(|_| r.i32()).collect::<morphwire::Result<_>>()?),
            (_, Some(n)) => Value::Int64s((0..n).map(|_| r.i64()).collect::<morphwire::Result<_>>()?),
        });
    }

    let unicode = simple & IS_UNICODE != 0;
    let read_char = |r: &mut Reader<'_>| -> Result<char> {
        if unicode { char_from(r.i16()? as u16) } else { Ok(r.u8()? as char) }
    };
    if simple & IS_STRING == 0 {
        return match count {
            None => Ok(Value::Char(read_char(r)?)),
            Some(n) => Ok(Value::Chars((0..n).map(|_| read_char(r)).collect::<Result<_>>()?)),
        };
    }
    let length_size = (simple & STRING_LENGTH) >> 6;
    match count {
        None => Ok(Value::String(r.counted_string(length_size, unicode)?)),
        Some(n) => Ok(Value::Strings(
            (0..n).map(|_| r.counted_string(length_size, unicode)).collect::<morphwire::Result<_>>()?,
        )),
    }
}
