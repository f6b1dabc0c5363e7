use crate::*;

// ============================================================================
//  LINK BYTE
// ============================================================================

#[test]
fn test_link_byte_layout() {
    let lb = LinkByte::new(LinkType::Member).with_x(true).with_z(true);
    assert_eq!(lb.raw(), 0x80 | 0x40 | 0x10 | 0x06);
    assert!(lb.msb());
    assert!(lb.x());
    assert!(!lb.y());
    assert!(lb.z());
    assert_eq!(lb.link_type(), LinkType::Member);

    let cleared = lb.with_x(false);
    assert!(!cleared.x());
    assert!(cleared.z());
}

#[test]
fn test_link_type_covers_every_nibble() {
    for b in 0u8..=0xFF {
        let t = LinkType::from_nibble(b);
        assert_eq!(t as u8, b & 0x0F);
        assert!(t.index() < LinkType::COUNT);
    }
}

// ============================================================================
//  INTEGERS AND BYTE ORDER
// ============================================================================

#[test]
fn test_integers_are_written_big_endian() -> Result<()> {
    let mut w = Writer::new();
    w.i16(0x0102);
    w.i32(0x03040506);
    w.i64(-2);

    assert_eq!(&w.as_bytes()[..6], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

    let bytes = w.into_bytes();
    let mut r = Reader::new(&bytes);
    assert_eq!(r.i16()?, 0x0102);
    assert_eq!(r.i32()?, 0x03040506);
    assert_eq!(r.i64()?, -2);
    assert!(!r.can_read());
    Ok(())
}

#[test]
fn test_reader_honors_little_endian_link_byte() -> Result<()> {
    // Link byte without the MSB bit, followed by a little-endian i32.
    let bytes = [0x0A, 0x07, 0x00, 0x00, 0x00];
    let mut r = Reader::new(&bytes);
    let lb = r.link_byte()?;
    assert!(!lb.msb());
    assert_eq!(lb.link_type(), LinkType::Servlet);
    assert_eq!(r.i32()?, 7);
    Ok(())
}

#[test]
fn test_over_read_is_an_error() {
    let bytes = [0x00, 0x01];
    let mut r = Reader::new(&bytes);
    match r.i32() {
        Err(Error::UnexpectedEnd { wanted: 4, remaining: 2 }) => {}
        other => panic!("expected UnexpectedEnd, got {:?}", other),
    }
}

// ============================================================================
//  STRINGS
// ============================================================================

#[test]
fn test_string_is_utf16le_with_i32_length() -> Result<()> {
    let mut w = Writer::new();
    w.string("Hi")?;
    assert_eq!(w.as_bytes(), &[0, 0, 0, 4, b'H', 0, b'i', 0]);
    assert_eq!(w.len(), string_size("Hi"));

    let bytes = w.into_bytes();
    let mut r = Reader::new(&bytes);
    assert_eq!(r.string()?, "Hi");
    Ok(())
}

#[test]
fn test_identifier_uses_i16_length() -> Result<()> {
    let mut w = Writer::new();
    w.identifier("Book")?;
    assert_eq!(&w.as_bytes()[..2], &[0, 8]);
    assert_eq!(w.len(), identifier_size("Book"));

    let bytes = w.into_bytes();
    let mut r = Reader::new(&bytes);
    assert_eq!(r.identifier()?, "Book");
    Ok(())
}

#[test]
fn test_non_bmp_string() -> Result<()> {
    let text = "seat \u{1F4BA}";
    let mut w = Writer::new();
    w.string(text)?;
    let bytes = w.into_bytes();
    assert_eq!(Reader::new(&bytes).string()?, text);
    Ok(())
}

#[test]
fn test_odd_utf16_payload_is_rejected() {
    let bytes = [0, 0, 0, 3, b'a', 0, b'b'];
    assert_eq!(Reader::new(&bytes).string(), Err(Error::InvalidUtf16));
}

#[test]
fn test_counted_string_sizes() -> Result<()> {
    for count_size in 0..=3u8 {
        let mut w = Writer::new();
        w.count(count_size, 4)?;
        w.bytes(&[b'o', 0, b'k', 0]);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.counted_string(count_size, true)?, "ok");
    }

    let ascii = [2u8, b'o', b'k'];
    assert_eq!(Reader::new(&ascii).counted_string(0, false)?, "ok");
    Ok(())
}

// ============================================================================
//  PATCHING AND SUB-READERS
// ============================================================================

#[test]
fn test_placeholder_patch() -> Result<()> {
    let mut w = Writer::new();
    let pos = w.placeholder();
    w.i32(9);
    w.patch(pos, 0x42)?;
    assert_eq!(w.as_bytes()[0], 0x42);
    assert_eq!(w.patch(99, 0), Err(Error::PatchOutOfRange(99)));
    Ok(())
}

#[test]
fn test_sub_reader_is_bounded() -> Result<()> {
    let bytes = [0, 0, 0, 1, 0, 0, 0, 2, 0xFF];
    let mut r = Reader::new(&bytes);
    let mut sub = r.sub_reader(4)?;
    assert_eq!(sub.i32()?, 1);
    assert!(sub.i32().is_err());
    assert_eq!(r.i32()?, 2);
    assert_eq!(r.remaining(), 1);
    Ok(())
}

#[test]
fn test_copy_from_drains_reader() -> Result<()> {
    let bytes = [1, 2, 3, 4];
    let mut r = Reader::new(&bytes);
    r.u8()?;
    let mut w = Writer::new();
    w.copy_from(&mut r);
    assert_eq!(w.as_bytes(), &[2, 3, 4]);
    assert!(!r.can_read());
    Ok(())
}

#[test]
fn test_negative_length_is_rejected() {
    let bytes = [0xFF, 0xFF, 0xFF, 0xFF];
    assert_eq!(Reader::new(&bytes).blob(), Err(Error::NegativeLength(-1)));
}
