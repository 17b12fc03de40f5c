// EBML primitive encoding helpers

use std::io::Write;

use crate::error::{MuxError, Result};

/// Largest value an 8-byte size field can carry; all-ones is reserved for "unknown size".
pub const MAX_VINT_VALUE: u64 = (1 << 56) - 2;

/// Payload bits of the 8-byte "unknown size" sentinel.
pub const UNKNOWN_SIZE: u64 = (1 << 56) - 1;

/// Byte length of a size field reserved for a container whose size is patched later.
pub const RESERVED_SIZE_LEN: u64 = 8;

pub fn write_bytes<W: Write>(w: &mut W, buf: &[u8]) -> Result<()> {
    w.write_all(buf)?;
    Ok(())
}

/// Write the low `width` bytes of `value`, most significant byte first.
///
/// Only widths 1, 2, 4 and 8 are supported; anything else is a caller bug.
pub fn write_be<W: Write>(w: &mut W, value: u64, width: usize) -> Result<()> {
    assert!(
        matches!(width, 1 | 2 | 4 | 8),
        "unsupported integer width {width}"
    );
    let bytes = value.to_be_bytes();
    write_bytes(w, &bytes[8 - width..])
}

/// Number of bytes `write_vint` uses for `value`.
pub fn vint_len(value: u64) -> Result<usize> {
    // Smallest n with value < 2^(7n) - 1; the all-ones pattern of each width is reserved.
    (1..=8)
        .find(|&n| value < (1u64 << (7 * n)) - 1)
        .ok_or(MuxError::SizeTooLarge(value))
}

/// Write a self-describing variable-length size field.
///
/// The first byte carries `n - 1` leading zero bits followed by a marker bit,
/// the remaining bits hold `value` big-endian.
pub fn write_vint<W: Write>(w: &mut W, value: u64) -> Result<()> {
    let len = vint_len(value)?;
    let marked = value | (1u64 << (7 * len));
    let bytes = marked.to_be_bytes();
    write_bytes(w, &bytes[8 - len..])
}

/// Write `value` as an 8-byte size field regardless of its magnitude.
///
/// Used to fill the space reserved by an open container so the layout never shifts.
pub fn write_vint_fixed8<W: Write>(w: &mut W, value: u64) -> Result<()> {
    if value > MAX_VINT_VALUE {
        return Err(MuxError::SizeTooLarge(value));
    }
    write_be(w, value | (1u64 << 56), 8)
}

/// Write the "unknown size" sentinel (0x01 followed by seven 0xFF bytes).
pub fn write_unknown_size<W: Write>(w: &mut W) -> Result<()> {
    write_be(w, UNKNOWN_SIZE | (1u64 << 56), 8)
}

/// Write a length-prefixed string, no terminator.
pub fn write_text<W: Write>(w: &mut W, text: &str) -> Result<()> {
    write_vint(w, text.len() as u64)?;
    write_bytes(w, text.as_bytes())
}

/// Number of bytes an element ID occupies; IDs already include their marker bits.
pub fn id_len(id: u32) -> usize {
    if id < 0x100 {
        1
    } else if id < 0x1_0000 {
        2
    } else if id < 0x100_0000 {
        3
    } else {
        4
    }
}

/// Minimal number of bytes holding `value` (at least one).
pub fn uint_len(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        ((64 - value.leading_zeros() as usize) + 7) / 8
    }
}
