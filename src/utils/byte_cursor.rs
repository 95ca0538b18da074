use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::bytes;
use crate::utils::utf16::decode_utf16le_lossy;

/// A bounds-checked cursor over an immutable byte slice.
///
/// Offsets are absolute within the backing buffer (for BXML this is the chunk), so every
/// position reported in an error can be used directly for triage. The cursor can only see
/// bytes before its bound; a sub-range view narrows the bound but keeps absolute offsets.
///
/// Invariant: `pos <= bound <= backing buffer length`.
///
/// All reads are little-endian and advance the cursor on success. A failed read leaves the
/// position untouched.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ByteCursor<'a> {
    /// The backing buffer, already cut at the bound.
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    #[inline]
    pub(crate) fn with_pos(buf: &'a [u8], pos: usize) -> DeserializationResult<Self> {
        // Allow pos == len (EOF), reject pos > len.
        let _ = bytes::slice_r(buf, pos, 0, "cursor.position")?;
        Ok(Self { buf, pos })
    }

    /// A view over `[start, start + len)` of this cursor's visible bytes.
    pub(crate) fn sub_range(
        &self,
        start: usize,
        len: usize,
        what: &'static str,
    ) -> DeserializationResult<ByteCursor<'a>> {
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| bytes::out_of_bounds(what, start, len, self.buf.len()))?;

        ByteCursor::with_pos(&self.buf[..end], start)
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn position(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    pub(crate) fn bound(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Absolute seek. Seeking past the bound fails.
    #[inline]
    pub(crate) fn set_pos(&mut self, pos: usize, what: &'static str) -> DeserializationResult<()> {
        let _ = bytes::slice_r(self.buf, pos, 0, what)?;
        self.pos = pos;
        Ok(())
    }

    #[inline]
    pub(crate) fn advance(&mut self, n: usize, what: &'static str) -> DeserializationResult<()> {
        let _ = self.take_bytes(n, what)?;
        Ok(())
    }

    #[inline]
    pub(crate) fn peek_u8(&self, what: &'static str) -> DeserializationResult<u8> {
        bytes::read_u8(self.buf, self.pos)
            .ok_or_else(|| bytes::out_of_bounds(what, self.pos, 1, self.buf.len()))
    }

    #[inline]
    pub(crate) fn take_bytes(
        &mut self,
        len: usize,
        what: &'static str,
    ) -> DeserializationResult<&'a [u8]> {
        let out = bytes::slice_r(self.buf, self.pos, len, what)?;
        self.pos += len;
        Ok(out)
    }

    #[inline]
    pub(crate) fn array<const N: usize>(
        &mut self,
        what: &'static str,
    ) -> DeserializationResult<[u8; N]> {
        let v = bytes::read_array_r::<N>(self.buf, self.pos, what)?;
        self.pos += N;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u8_named(&mut self, what: &'static str) -> DeserializationResult<u8> {
        let b = self.peek_u8(what)?;
        self.pos += 1;
        Ok(b)
    }

    #[inline]
    pub(crate) fn u16_named(&mut self, what: &'static str) -> DeserializationResult<u16> {
        let v = bytes::read_u16_le_r(self.buf, self.pos, what)?;
        self.pos += 2;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u32_named(&mut self, what: &'static str) -> DeserializationResult<u32> {
        let v = bytes::read_u32_le_r(self.buf, self.pos, what)?;
        self.pos += 4;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u64_named(&mut self, what: &'static str) -> DeserializationResult<u64> {
        let v = bytes::read_u64_le_r(self.buf, self.pos, what)?;
        self.pos += 8;
        Ok(v)
    }

    #[inline]
    pub(crate) fn i8_named(&mut self, what: &'static str) -> DeserializationResult<i8> {
        Ok(i8::from_le_bytes(self.array::<1>(what)?))
    }

    #[inline]
    pub(crate) fn i16_named(&mut self, what: &'static str) -> DeserializationResult<i16> {
        Ok(i16::from_le_bytes(self.array::<2>(what)?))
    }

    #[inline]
    pub(crate) fn i32_named(&mut self, what: &'static str) -> DeserializationResult<i32> {
        Ok(i32::from_le_bytes(self.array::<4>(what)?))
    }

    #[inline]
    pub(crate) fn i64_named(&mut self, what: &'static str) -> DeserializationResult<i64> {
        Ok(i64::from_le_bytes(self.array::<8>(what)?))
    }

    /// Read a sized array encoded as `size_bytes` bytes of consecutive fixed-width elements.
    ///
    /// The parse closure receives the absolute offset of the element, for error reporting.
    pub(crate) fn read_sized_vec_aligned<const ELEM_BYTES: usize, T>(
        &mut self,
        size_bytes: u16,
        what: &'static str,
        mut parse_one: impl FnMut(u64, &[u8; ELEM_BYTES]) -> DeserializationResult<T>,
    ) -> DeserializationResult<Vec<T>> {
        let size_usize = usize::from(size_bytes);
        if size_usize % ELEM_BYTES != 0 {
            return Err(DeserializationError::mismatch(
                what,
                self.position(),
                format!("array of {size_usize} bytes is not a multiple of {ELEM_BYTES}"),
            ));
        }

        let start_pos = self.pos;
        let raw = self.take_bytes(size_usize, what)?;
        raw.chunks_exact(ELEM_BYTES)
            .enumerate()
            .map(|(i, chunk)| {
                let mut elem = [0_u8; ELEM_BYTES];
                elem.copy_from_slice(chunk);
                parse_one((start_pos + i * ELEM_BYTES) as u64, &elem)
            })
            .collect()
    }

    /// Read `char_count` UTF-16 code units and decode them, stopping at a NUL if present.
    pub(crate) fn utf16_by_char_count(
        &mut self,
        char_count: usize,
        what: &'static str,
    ) -> DeserializationResult<String> {
        let byte_len = char_count
            .checked_mul(2)
            .ok_or_else(|| bytes::out_of_bounds(what, self.pos, usize::MAX, self.buf.len()))?;

        let raw = self.take_bytes(byte_len, what)?;
        Ok(decode_utf16le_lossy(raw))
    }

    /// Read a `u16` character count, then that many UTF-16 code units.
    /// Optionally reads and discards a trailing NUL code unit.
    pub(crate) fn len_prefixed_utf16_string(
        &mut self,
        is_null_terminated: bool,
        what: &'static str,
    ) -> DeserializationResult<String> {
        let start = self.pos;
        let char_count = self.u16_named(what)? as usize;
        let value = self.utf16_by_char_count(char_count, what).inspect_err(|_| {
            self.pos = start;
        })?;

        if is_null_terminated {
            if let Err(e) = self.u16_named(what) {
                self.pos = start;
                return Err(e);
            }
        }
        Ok(value)
    }
}
