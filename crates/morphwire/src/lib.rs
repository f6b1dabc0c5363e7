//! # Morphwire
//!
//! Leaf encoding and decoding for the morph link-chain protocol.
//!
//! ## Philosophy
//!
//! - **Bounded**: A `Reader` is a bounds-checked view over a borrowed slice. Over-reading
//!   is an error, never a panic.
//! - **Explicit Endianness**: Every link starts with a link byte whose top bit selects the
//!   byte order of the integers that follow. Writers always emit big-endian (MSB set).
//! - **Patchable**: A `Writer` can reserve a placeholder byte and patch it once the real
//!   value is known.
//!
//! ## Format
//!
//! - **Link byte**: `[msb:1][z:1][y:1][x:1][type:4]`
//! - **Integers**: fixed width, order selected by the last link byte read
//! - **Strings**: `[len:i32][utf-16le bytes]`
//! - **Identifiers**: `[len:i16][utf-16le bytes]`

#[cfg(test)]
mod tests;

/// Wire encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted while reading.
    UnexpectedEnd { wanted: usize, remaining: usize },
    /// A length prefix was negative.
    NegativeLength(i64),
    /// String payload is not valid UTF-16.
    InvalidUtf16,
    /// String or blob does not fit its length prefix.
    TooLarge(usize),
    /// Count size code outside `0..=3`.
    InvalidCountSize(u8),
    /// Patch position lies outside the written buffer.
    PatchOutOfRange(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnexpectedEnd { wanted, remaining } => {
                write!(f, "EOS: wanted {} bytes, {} remaining", wanted, remaining)
            }
            Error::NegativeLength(n) => write!(f, "Negative length prefix: {}", n),
            Error::InvalidUtf16 => write!(f, "Invalid UTF-16 string data"),
            Error::TooLarge(n) => write!(f, "Value of {} bytes is too large for its length prefix", n),
            Error::InvalidCountSize(c) => write!(f, "Invalid count size code: {}", c),
            Error::PatchOutOfRange(p) => write!(f, "Patch position {} is out of range", p),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
//  LINK BYTE
// ============================================================================

/// The 4-bit type tag carried in the low nibble of every link byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    End = 0x0,
    Process = 0x1,
    Service = 0x2,
    Sequence = 0x3,
    Data = 0x4,
    Reserved5 = 0x5,
    Member = 0x6,
    Stream = 0x7,
    Message = 0x8,
    Internet = 0x9,
    Servlet = 0xA,
    Encoding = 0xB,
    Information = 0xC,
    ReservedD = 0xD,
    ReservedE = 0xE,
    ReservedF = 0xF,
}

impl LinkType {
    /// Number of addressable type tags.
    pub const COUNT: usize = 16;

    /// Returns the type encoded in the low nibble of `b`.
    pub fn from_nibble(b: u8) -> Self {
        match b & 0x0F {
            0x0 => LinkType::End,
            0x1 => LinkType::Process,
            0x2 => LinkType::Service,
            0x3 => LinkType::Sequence,
            0x4 => LinkType::Data,
            0x5 => LinkType::Reserved5,
            0x6 => LinkType::Member,
            0x7 => LinkType::Stream,
            0x8 => LinkType::Message,
            0x9 => LinkType::Internet,
            0xA => LinkType::Servlet,
            0xB => LinkType::Encoding,
            0xC => LinkType::Information,
            0xD => LinkType::ReservedD,
            0xE => LinkType::ReservedE,
            _ => LinkType::ReservedF,
        }
    }

    /// Slot index in a 16-entry table.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One-byte link header: type tag, three per-type flags, and the byte-order bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkByte(u8);

impl LinkByte {
    const MSB: u8 = 0x80;
    const X: u8 = 0x10;
    const Y: u8 = 0x20;
    const Z: u8 = 0x40;

    /// A big-endian link byte for `link_type` with all flags clear.
    pub fn new(link_type: LinkType) -> Self {
        Self(Self::MSB | link_type as u8)
    }

    pub fn from_raw(b: u8) -> Self {
        Self(b)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn link_type(self) -> LinkType {
        LinkType::from_nibble(self.0)
    }

    /// True when integers following this byte are big-endian.
    pub fn msb(self) -> bool {
        self.0 & Self::MSB != 0
    }

    pub fn x(self) -> bool {
        self.0 & Self::X != 0
    }

    pub fn y(self) -> bool {
        self.0 & Self::Y != 0
    }

    pub fn z(self) -> bool {
        self.0 & Self::Z != 0
    }

    pub fn with_x(self, on: bool) -> Self {
        self.with(Self::X, on)
    }

    pub fn with_y(self, on: bool) -> Self {
        self.with(Self::Y, on)
    }

    pub fn with_z(self, on: bool) -> Self {
        self.with(Self::Z, on)
    }

    fn with(self, bit: u8, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }
}

// ============================================================================
//  STRING SIZES
// ============================================================================

/// Bytes needed for the UTF-16 form of `s`.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// Encoded size of a string written by [`Writer::string`].
pub fn string_size(s: &str) -> usize {
    4 + utf16_len(s)
}

/// Encoded size of an identifier written by [`Writer::identifier`].
pub fn identifier_size(s: &str) -> usize {
    2 + utf16_len(s)
}

fn decode_utf16(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidUtf16);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Error::InvalidUtf16)
}

// ============================================================================
//  WRITER
// ============================================================================

/// An append-only encoder. Integers are always written big-endian.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(128) }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn link_byte(&mut self, b: LinkByte) {
        self.buf.push(b.raw());
    }

    pub fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Writes `[len:i32][bytes]`.
    pub fn blob(&mut self, v: &[u8]) -> Result<()> {
        self.i32(Self::length_i32(v.len())?);
        self.bytes(v);
        Ok(())
    }

    /// Writes `[len:i32][utf-16le]`.
    pub fn string(&mut self, s: &str) -> Result<()> {
        self.i32(Self::length_i32(utf16_len(s))?);
        self.utf16(s);
        Ok(())
    }

    /// Writes `[len:i16][utf-16le]`.
    pub fn identifier(&mut self, s: &str) -> Result<()> {
        let len = utf16_len(s);
        let len = i16::try_from(len).map_err(|_| Error::TooLarge(len))?;
        self.i16(len);
        self.utf16(s);
        Ok(())
    }

    /// Writes a count using a 0..=3 size code (1, 2, 4 or 8 bytes).
    pub fn count(&mut self, count_size: u8, count: usize) -> Result<()> {
        match count_size {
            0 => {
                let c = u8::try_from(count).map_err(|_| Error::TooLarge(count))?;
                self.u8(c);
                Ok(())
            }
            1 => {
                let c = i16::try_from(count).map_err(|_| Error::TooLarge(count))?;
                self.i16(c);
                Ok(())
            }
            2 => {
                self.i32(Self::length_i32(count)?);
                Ok(())
            }
            3 => {
                let c = i64::try_from(count).map_err(|_| Error::TooLarge(count))?;
                self.i64(c);
                Ok(())
            }
            other => Err(Error::InvalidCountSize(other)),
        }
    }

    fn utf16(&mut self, s: &str) {
        for unit in s.encode_utf16() {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
    }

    fn length_i32(len: usize) -> Result<i32> {
        i32::try_from(len).map_err(|_| Error::TooLarge(len))
    }

    /// Reserves one byte and returns its position for a later [`Writer::patch`].
    pub fn placeholder(&mut self) -> usize {
        self.buf.push(0);
        self.buf.len() - 1
    }

    /// Overwrites a byte previously reserved with [`Writer::placeholder`].
    pub fn patch(&mut self, pos: usize, v: u8) -> Result<()> {
        let slot = self.buf.get_mut(pos).ok_or(Error::PatchOutOfRange(pos))?;
        *slot = v;
        Ok(())
    }

    /// Copies every remaining byte of `reader` into this writer.
    pub fn copy_from(&mut self, reader: &mut Reader<'_>) {
        let rest = reader.rest();
        self.buf.extend_from_slice(rest);
    }
}

// ============================================================================
//  READER
// ============================================================================

/// A bounded, zero-copy view over a byte slice.
///
/// The byte order of integer reads follows the MSB bit of the most recent
/// link byte read through [`Reader::link_byte`]. Fresh readers assume big-endian.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    msb: bool,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, msb: true }
    }

    /// A reader over `buf` that starts with the given byte order.
    pub fn with_msb(buf: &'a [u8], msb: bool) -> Self {
        Self { buf, pos: 0, msb }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn can_read(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn msb(&self) -> bool {
        self.msb
    }

    pub fn set_msb(&mut self, msb: bool) {
        self.msb = msb;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::UnexpectedEnd { wanted: n, remaining: self.remaining() });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(Error::UnexpectedEnd { wanted: 1, remaining: 0 })
    }

    pub fn u8(&mut self) -> Result<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    /// Reads a link byte and adopts its byte order for subsequent integers.
    pub fn link_byte(&mut self) -> Result<LinkByte> {
        let lb = LinkByte::from_raw(self.u8()?);
        self.msb = lb.msb();
        Ok(lb)
    }

    pub fn i16(&mut self) -> Result<i16> {
        let b = self.array::<2>()?;
        Ok(if self.msb { i16::from_be_bytes(b) } else { i16::from_le_bytes(b) })
    }

    pub fn i32(&mut self) -> Result<i32> {
        let b = self.array::<4>()?;
        Ok(if self.msb { i32::from_be_bytes(b) } else { i32::from_le_bytes(b) })
    }

    pub fn i64(&mut self) -> Result<i64> {
        let b = self.array::<8>()?;
        Ok(if self.msb { i64::from_be_bytes(b) } else { i64::from_le_bytes(b) })
    }

    pub fn f32(&mut self) -> Result<f32> {
        let b = self.array::<4>()?;
        Ok(if self.msb { f32::from_be_bytes(b) } else { f32::from_le_bytes(b) })
    }

    pub fn f64(&mut self) -> Result<f64> {
        let b = self.array::<8>()?;
        Ok(if self.msb { f64::from_be_bytes(b) } else { f64::from_le_bytes(b) })
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Reads a non-negative `i32` length prefix.
    pub fn length(&mut self) -> Result<usize> {
        let n = self.i32()?;
        usize::try_from(n).map_err(|_| Error::NegativeLength(n as i64))
    }

    /// Reads `[len:i32][bytes]`.
    pub fn blob(&mut self) -> Result<&'a [u8]> {
        let n = self.length()?;
        self.take(n)
    }

    /// Reads `[len:i32][utf-16le]`.
    pub fn string(&mut self) -> Result<String> {
        let n = self.length()?;
        decode_utf16(self.take(n)?)
    }

    /// Reads `[len:i16][utf-16le]`.
    pub fn identifier(&mut self) -> Result<String> {
        let n = self.i16()?;
        let n = usize::try_from(n).map_err(|_| Error::NegativeLength(n as i64))?;
        decode_utf16(self.take(n)?)
    }

    /// Reads a count encoded with a 0..=3 size code (1, 2, 4 or 8 bytes).
    pub fn count(&mut self, count_size: u8) -> Result<usize> {
        match count_size {
            0 => Ok(self.u8()? as usize),
            1 => {
                let n = self.i16()?;
                usize::try_from(n).map_err(|_| Error::NegativeLength(n as i64))
            }
            2 => self.length(),
            3 => {
                let n = self.i64()?;
                usize::try_from(n).map_err(|_| Error::NegativeLength(n))
            }
            other => Err(Error::InvalidCountSize(other)),
        }
    }

    /// Reads a string whose byte length uses a 0..=3 size code.
    ///
    /// Non-unicode strings are single-byte characters.
    pub fn counted_string(&mut self, count_size: u8, unicode: bool) -> Result<String> {
        let n = self.count(count_size)?;
        let bytes = self.take(n)?;
        if unicode {
            decode_utf16(bytes)
        } else {
            Ok(bytes.iter().map(|&b| b as char).collect())
        }
    }

    /// Bounds a new reader to the next `n` bytes and skips them here.
    pub fn sub_reader(&mut self, n: usize) -> Result<Reader<'a>> {
        let slice = self.take(n)?;
        Ok(Reader { buf: slice, pos: 0, msb: self.msb })
    }

    /// Everything not yet read. Consumes it.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}
