// Copyright (c) 2026-present, the quartz-index authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Integer and string packing.
//!
//! Three encodings, used throughout the key and tag formats:
//!
//! * plain varints (LEB128) for sizes, counts and frequencies;
//! * a sort-preserving unsigned encoding for docids and slots inside keys
//!   (a length byte, then the value big-endian with leading zeros
//!   stripped — two encoded values compare lexicographically in the same
//!   order as the integers);
//! * a sort-preserving string encoding for terms inside keys (each zero
//!   byte is followed by an `0xff` escape and the whole string by a zero
//!   terminator, so a key may carry arbitrary bytes and still be
//!   unambiguously separable from a following docid suffix).

use super::DecodeError;

/// Appends `value` as a varint.
pub fn pack_uint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reads a varint, advancing `input` past it.
///
/// # Errors
///
/// Fails on truncated input or when the value needs more than 64 bits.
pub fn unpack_uint(input: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    loop {
        let Some((&byte, rest)) = input.split_first() else {
            return Err(DecodeError::Eof("varint"));
        };
        *input = rest;

        let payload = u64::from(byte & 0x7f);
        if shift >= 64 || (shift == 63 && payload > 1) {
            return Err(DecodeError::VarintOverflow("u64 varint"));
        }
        value |= payload << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Reads a varint that must fit in 32 bits.
///
/// # Errors
///
/// Fails on truncated input or 32-bit overflow.
pub fn unpack_uint32(input: &mut &[u8]) -> Result<u32, DecodeError> {
    u32::try_from(unpack_uint(input)?).map_err(|_| DecodeError::VarintOverflow("u32 varint"))
}

/// Appends `value` such that encoded values sort like the integers.
pub fn pack_uint_preserving_sort(out: &mut Vec<u8>, value: u64) {
    let be = value.to_be_bytes();
    let skip = ((value.leading_zeros() / 8) as usize).min(7);
    #[allow(clippy::indexing_slicing)]
    let payload = &be[skip..];
    debug_assert!(!payload.is_empty() && payload.len() <= 8);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
}

/// Reads a sort-preserving unsigned value, advancing `input` past it.
///
/// # Errors
///
/// Fails on truncated input or an invalid length byte.
pub fn unpack_uint_preserving_sort(input: &mut &[u8]) -> Result<u64, DecodeError> {
    let Some((&len, rest)) = input.split_first() else {
        return Err(DecodeError::Eof("sortable uint"));
    };
    let len = usize::from(len);
    if len == 0 || len > 8 {
        return Err(DecodeError::InvalidHeader("sortable uint"));
    }
    if rest.len() < len {
        return Err(DecodeError::Eof("sortable uint"));
    }

    let mut value: u64 = 0;
    #[allow(clippy::indexing_slicing)]
    for &byte in &rest[..len] {
        value = (value << 8) | u64::from(byte);
    }
    #[allow(clippy::indexing_slicing)]
    {
        *input = &rest[len..];
    }
    Ok(value)
}

/// Appends `value` such that encoded strings sort lexicographically, even
/// when another key component follows.
///
/// When `last` is true the terminator is omitted; use only when nothing
/// follows the string in the key.
pub fn pack_string_preserving_sort(out: &mut Vec<u8>, value: &[u8], last: bool) {
    for &byte in value {
        out.push(byte);
        if byte == 0 {
            out.push(0xff);
        }
    }
    if !last {
        out.push(0);
    }
}

/// Reads a terminated sort-preserving string, advancing `input` past the
/// terminator.
///
/// # Errors
///
/// Fails when no terminator is found.
pub fn unpack_string_preserving_sort(input: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut rest = *input;

    loop {
        match rest.split_first() {
            Some((&0, tail)) => match tail.split_first() {
                // Escaped zero byte.
                Some((&0xff, tail2)) => {
                    out.push(0);
                    rest = tail2;
                }
                _ => {
                    *input = tail;
                    return Ok(out);
                }
            },
            Some((&byte, tail)) => {
                out.push(byte);
                rest = tail;
            }
            None => return Err(DecodeError::Eof("sortable string")),
        }
    }
}

/// Reads an unterminated sort-preserving string spanning the rest of `input`.
///
/// # Errors
///
/// Fails on a dangling zero escape.
pub fn unpack_string_preserving_sort_last(input: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut rest = *input;

    while let Some((&byte, tail)) = rest.split_first() {
        if byte == 0 {
            match tail.split_first() {
                Some((&0xff, tail2)) => {
                    out.push(0);
                    rest = tail2;
                }
                _ => return Err(DecodeError::InvalidHeader("sortable string escape")),
            }
        } else {
            out.push(byte);
            rest = tail;
        }
    }

    *input = rest;
    Ok(out)
}

/// Appends a length-prefixed string.
pub fn pack_string(out: &mut Vec<u8>, value: &[u8]) {
    pack_uint(out, value.len() as u64);
    out.extend_from_slice(value);
}

/// Reads a length-prefixed string, advancing `input` past it.
///
/// # Errors
///
/// Fails on truncated input.
pub fn unpack_string(input: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let len = unpack_uint(input)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::VarintOverflow("string length"))?;
    if input.len() < len {
        return Err(DecodeError::Eof("string payload"));
    }
    #[allow(clippy::indexing_slicing)]
    let (payload, rest) = input.split_at(len);
    *input = rest;
    Ok(payload.to_vec())
}

/// Appends a boolean as a single byte.
pub fn pack_bool(out: &mut Vec<u8>, value: bool) {
    out.push(u8::from(value));
}

/// Reads a single-byte boolean, advancing `input` past it.
///
/// # Errors
///
/// Fails on truncated input or a byte other than 0/1.
pub fn unpack_bool(input: &mut &[u8]) -> Result<bool, DecodeError> {
    let Some((&byte, rest)) = input.split_first() else {
        return Err(DecodeError::Eof("bool"));
    };
    *input = rest;
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(DecodeError::InvalidTag(("bool", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn roundtrip_uint(value: u64) {
        let mut buf = Vec::new();
        pack_uint(&mut buf, value);
        let mut input = buf.as_slice();
        assert_eq!(value, unpack_uint(&mut input).unwrap());
        assert!(input.is_empty());
    }

    #[test]
    fn uint_roundtrip() {
        for value in [0, 1, 127, 128, 129, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            roundtrip_uint(value);
        }
    }

    #[test]
    fn uint_roundtrip_random() {
        use rand::Rng;

        let mut rng = rand::rng();
        for _ in 0..10_000 {
            roundtrip_uint(rng.random::<u64>());
        }
    }

    #[test]
    fn uint_overflow_detected() {
        // 10 continuation bytes push past 64 bits.
        let buf = [0xffu8; 11];
        let mut input = buf.as_slice();
        assert!(matches!(
            unpack_uint(&mut input),
            Err(DecodeError::VarintOverflow(_))
        ));
    }

    #[test]
    fn uint_truncated() {
        let buf = [0x80u8];
        let mut input = buf.as_slice();
        assert!(matches!(unpack_uint(&mut input), Err(DecodeError::Eof(_))));
    }

    fn encode_sortable(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        pack_uint_preserving_sort(&mut buf, value);
        buf
    }

    #[test]
    fn sortable_uint_roundtrip() {
        for value in [0, 1, 255, 256, 65_535, 65_536, u64::from(u32::MAX), u64::MAX] {
            let buf = encode_sortable(value);
            let mut input = buf.as_slice();
            assert_eq!(value, unpack_uint_preserving_sort(&mut input).unwrap());
            assert!(input.is_empty());
        }
    }

    #[test]
    fn sortable_uint_order_matches_integer_order() {
        use rand::Rng;

        let mut rng = rand::rng();
        for _ in 0..10_000 {
            let a = rng.random::<u64>() >> (rng.random::<u32>() % 64);
            let b = rng.random::<u64>() >> (rng.random::<u32>() % 64);
            assert_eq!(
                a.cmp(&b),
                encode_sortable(a).cmp(&encode_sortable(b)),
                "{a} vs {b}",
            );
        }
    }

    #[test]
    fn sortable_string_roundtrip_with_suffix() {
        let cases: &[&[u8]] = &[b"", b"fox", b"a\0b", b"\0", b"\0\xff", b"abc\0\0def"];

        for case in cases {
            let mut buf = Vec::new();
            pack_string_preserving_sort(&mut buf, case, false);
            // Something docid-like after the terminator.
            pack_uint_preserving_sort(&mut buf, 42);

            let mut input = buf.as_slice();
            assert_eq!(case.to_vec(), unpack_string_preserving_sort(&mut input).unwrap());
            assert_eq!(42, unpack_uint_preserving_sort(&mut input).unwrap());
            assert!(input.is_empty());
        }
    }

    #[test]
    fn sortable_string_order_preserved_under_concatenation() {
        let words: &[&[u8]] = &[b"", b"a", b"a\0", b"a\0b", b"ab", b"b", b"ba"];

        let encode = |word: &[u8]| {
            let mut buf = b"common-prefix".to_vec();
            pack_string_preserving_sort(&mut buf, word, false);
            buf
        };

        for pair in words.windows(2) {
            assert!(
                encode(pair[0]) < encode(pair[1]),
                "{:?} !< {:?}",
                pair[0],
                pair[1],
            );
        }
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = Vec::new();
        pack_string(&mut buf, b"hello");
        pack_string(&mut buf, b"");

        let mut input = buf.as_slice();
        assert_eq!(b"hello".to_vec(), unpack_string(&mut input).unwrap());
        assert_eq!(Vec::<u8>::new(), unpack_string(&mut input).unwrap());
        assert!(input.is_empty());
    }
}
