/// Value codec tests
///
/// Tests for numeric decoding across wire types and string conversion
/// Run with: cargo test --test codec_tests

use wmi_xenstore::core::codec::{bounded_narrow, from_wide, to_wide, variant_to_u64, WideString};
use wmi_xenstore::core::{Instance, StoreError};
use wmi_xenstore::Variant;

#[test]
fn test_u64_identical_across_wire_forms() {
    let value = 4_294_967_296u64;
    assert_eq!(variant_to_u64(&Variant::UI8(value)), value);
    assert_eq!(variant_to_u64(&Variant::I8(value as i64)), value);
    assert_eq!(variant_to_u64(&Variant::text("4294967296")), value);
}

#[test]
fn test_small_widths_decode_to_same_value() {
    for n in [0u64, 1, 255, 32_767] {
        let expected = n;
        assert_eq!(variant_to_u64(&Variant::I2(n as i16)), expected);
        assert_eq!(variant_to_u64(&Variant::UI2(n as u16)), expected);
        assert_eq!(variant_to_u64(&Variant::I4(n as i32)), expected);
        assert_eq!(variant_to_u64(&Variant::UI4(n as u32)), expected);
        assert_eq!(variant_to_u64(&Variant::text(&n.to_string())), expected);
    }
}

#[test]
fn test_unrecognized_types_decode_to_zero() {
    assert_eq!(variant_to_u64(&Variant::Empty), 0);
    assert_eq!(variant_to_u64(&Variant::Bool(true)), 0);
    assert_eq!(variant_to_u64(&Variant::object(Instance::new("X"))), 0);
    assert_eq!(variant_to_u64(&Variant::text("12 MB")), 0);
    assert_eq!(variant_to_u64(&Variant::text("")), 0);
}

#[test]
fn test_wide_conversion_keeps_length() {
    let bytes = "a\0b\u{20ac}".as_bytes();
    let wide = to_wide(bytes).unwrap();
    assert_eq!(wide.len(), 4);
    assert_eq!(from_wide(&wide), bytes);
}

#[test]
fn test_invalid_utf8_is_marshal_error() {
    assert!(matches!(to_wide(&[0x80]), Err(StoreError::Marshal(_))));
}

#[test]
fn test_bounded_narrow_respects_char_boundaries() {
    let wide = WideString::new("ab\u{20ac}");
    assert_eq!(bounded_narrow(&wide, 128), "ab\u{20ac}");
    assert_eq!(bounded_narrow(&wide, 4), "ab");
    assert_eq!(bounded_narrow(&wide, 0), "");
}
