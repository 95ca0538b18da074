//! Fixed-offset little-endian reads over byte slices.
//!
//! Two layers:
//! - **Option layer** (`read_*`): returns `None` when the range is out of bounds.
//! - **Result layer** (`*_r`): maps `None` to `DeserializationError::OutOfBounds`.
//!
//! Offsets are `usize` and relative to the slice passed in. Header parsers do one up-front
//! [`slice_r`] for the whole structure and then read fields by fixed offset.

use byteorder::{ByteOrder, LittleEndian};

use crate::err::DeserializationError;

/// Read `N` raw bytes at `offset`.
pub(crate) fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    buf.get(offset..end)?.try_into().ok()
}

pub(crate) fn read_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    Some(LittleEndian::read_u16(&read_array::<2>(buf, offset)?))
}

pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    Some(LittleEndian::read_u32(&read_array::<4>(buf, offset)?))
}

pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    Some(LittleEndian::read_u64(&read_array::<8>(buf, offset)?))
}

#[inline]
pub(crate) fn out_of_bounds(
    what: &'static str,
    offset: usize,
    need: usize,
    len: usize,
) -> DeserializationError {
    DeserializationError::OutOfBounds {
        what,
        offset: offset as u64,
        need,
        have: len.saturating_sub(offset),
    }
}

pub(crate) fn slice_r<'a>(
    buf: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], DeserializationError> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| out_of_bounds(what, offset, len, buf.len()))?;
    buf.get(offset..end)
        .ok_or_else(|| out_of_bounds(what, offset, len, buf.len()))
}

pub(crate) fn read_array_r<const N: usize>(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<[u8; N], DeserializationError> {
    read_array::<N>(buf, offset).ok_or_else(|| out_of_bounds(what, offset, N, buf.len()))
}

pub(crate) fn read_u16_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<u16, DeserializationError> {
    read_u16_le(buf, offset).ok_or_else(|| out_of_bounds(what, offset, 2, buf.len()))
}

pub(crate) fn read_u32_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<u32, DeserializationError> {
    read_u32_le(buf, offset).ok_or_else(|| out_of_bounds(what, offset, 4, buf.len()))
}

pub(crate) fn read_u64_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<u64, DeserializationError> {
    read_u64_le(buf, offset).ok_or_else(|| out_of_bounds(what, offset, 8, buf.len()))
}

/// Read a `count`-element `u32` table at `offset` with a single bounds check.
pub(crate) fn read_u32_vec_le_r(
    buf: &[u8],
    offset: usize,
    count: usize,
    what: &'static str,
) -> Result<Vec<u32>, DeserializationError> {
    let len = count
        .checked_mul(4)
        .ok_or_else(|| out_of_bounds(what, offset, usize::MAX, buf.len()))?;
    let table = slice_r(buf, offset, len, what)?;

    Ok(table.chunks_exact(4).map(LittleEndian::read_u32).collect())
}
