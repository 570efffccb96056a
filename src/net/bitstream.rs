//! Bit-granular byte buffer cursor for the update wire format
//!
//! Bits are packed LSB-first inside each byte and multi-bit integers are
//! written least-significant bit first, so a byte-aligned `u16` lands on the
//! wire as two little-endian bytes. Every optional packet section and every
//! cached entity record ends with `align_to_byte` so records can be copied
//! into a packet with a plain memcpy.
//!
//! Writes never fail: out-of-range floats clamp, over-long strings and arrays
//! truncate. Reads are bounds-checked and return [`BitError`] instead of
//! panicking on malformed input.

use tracing::debug;

/// Result type for bitstream reads
pub type BitResult<T> = Result<T, BitError>;

/// Largest integer width handled by a single `write_uint`/`read_uint`
pub const MAX_UINT_BITS: u32 = 32;

/// Errors that can occur while reading a bitstream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitError {
    #[error("attempted to read {requested} bits but only {available} bits available")]
    UnexpectedEof { requested: usize, available: usize },
    #[error("invalid bit count {bits}, maximum allowed is {max_bits}")]
    InvalidBitCount { bits: u32, max_bits: u32 },
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Byte offset of a reserved 16-bit slot, see [`BitWriter::reserve_u16`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder(usize);

// ============================================================================
// Writer
// ============================================================================

/// Bit-level writer over an owned, reusable byte buffer
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    /// Always holds exactly `ceil(bit_pos / 8)` bytes
    bytes: Vec<u8>,
    bit_pos: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
            bit_pos: 0,
        }
    }

    /// Reuse an existing allocation. The vector is cleared, its capacity kept.
    pub fn from_vec(mut bytes: Vec<u8>) -> Self {
        bytes.clear();
        Self { bytes, bit_pos: 0 }
    }

    /// Returns the written bytes (the last byte is zero padded)
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.bit_pos = 0;
    }

    #[inline]
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        self.bit_pos % 8 == 0
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        let bit = self.bit_pos & 7;
        if bit == 0 {
            self.bytes.push(0);
        }
        if value {
            // bytes is non-empty: a byte was pushed on the first bit of it
            if let Some(last) = self.bytes.last_mut() {
                *last |= 1 << bit;
            }
        }
        self.bit_pos += 1;
    }

    /// Write the low `bits` bits of `value` (higher bits are ignored)
    pub fn write_uint(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= MAX_UINT_BITS, "write_uint: {} bits", bits);
        for i in 0..bits.min(MAX_UINT_BITS) {
            self.write_bool((value >> i) & 1 == 1);
        }
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        if self.is_aligned() {
            self.bytes.push(value);
            self.bit_pos += 8;
        } else {
            self.write_uint(u32::from(value), 8);
        }
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        if self.is_aligned() {
            self.bytes.extend_from_slice(&value.to_le_bytes());
            self.bit_pos += 16;
        } else {
            self.write_uint(u32::from(value), 16);
        }
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.write_uint(value, 32);
    }

    /// Raw IEEE-754 bits, no quantization
    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    /// Linear quantization of `value` over `[min, max]` into `bits` bits.
    ///
    /// Out-of-range values clamp to the nearest boundary and NaN encodes as
    /// `min`, so a bad value degrades instead of corrupting the stream.
    pub fn write_quantized(&mut self, value: f32, min: f32, max: f32, bits: u32) {
        self.write_uint(quantize(value, min, max, bits), bits);
    }

    /// Exactly `len` 7-bit characters: non-ASCII becomes `?`, short strings
    /// are zero padded and long ones truncated.
    pub fn write_ascii_fixed(&mut self, value: &str, len: usize) {
        let bytes = value.as_bytes();
        for i in 0..len {
            let c = match bytes.get(i) {
                Some(&b) if b.is_ascii() => b,
                Some(_) => b'?',
                None => 0,
            };
            self.write_uint(u32::from(c), 7);
        }
    }

    /// `u16` byte length followed by UTF-8 bytes, truncated to `max_bytes`
    /// on a char boundary.
    pub fn write_string(&mut self, value: &str, max_bytes: usize) {
        let mut end = value.len().min(max_bytes).min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_u16(end as u16);
        self.write_bytes_aligned(&value.as_bytes()[..end]);
    }

    /// `u16` element count followed by each element, truncated to `max_count`
    pub fn write_array<T>(
        &mut self,
        items: &[T],
        max_count: usize,
        mut encode: impl FnMut(&mut Self, &T),
    ) {
        let count = items.len().min(max_count).min(u16::MAX as usize);
        self.write_u16(count as u16);
        for item in &items[..count] {
            encode(self, item);
        }
    }

    /// Append raw bytes; a plain memcpy when the cursor is byte aligned
    pub fn write_bytes_aligned(&mut self, data: &[u8]) {
        if self.is_aligned() {
            self.bytes.extend_from_slice(data);
            self.bit_pos += data.len() * 8;
        } else {
            for &b in data {
                self.write_uint(u32::from(b), 8);
            }
        }
    }

    /// Pad with zero bits up to the next byte boundary
    #[inline]
    pub fn align_to_byte(&mut self) {
        // the partial byte is already in `bytes`
        self.bit_pos = self.bytes.len() * 8;
    }

    /// Align, then write a zeroed 16-bit slot to be patched later
    pub fn reserve_u16(&mut self) -> Placeholder {
        self.align_to_byte();
        let offset = self.bytes.len();
        self.write_u16(0);
        Placeholder(offset)
    }

    /// Overwrite a slot returned by [`reserve_u16`](Self::reserve_u16)
    pub fn patch_u16(&mut self, placeholder: Placeholder, value: u16) {
        let Placeholder(offset) = placeholder;
        if let Some(slot) = self.bytes.get_mut(offset..offset + 2) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Map `value` onto `0..=2^bits-1` over `[min, max]`, clamping first
pub fn quantize(value: f32, min: f32, max: f32, bits: u32) -> u32 {
    let bits = bits.min(MAX_UINT_BITS);
    if bits == 0 || max <= min {
        return 0;
    }
    let steps = ((1u64 << bits) - 1) as f64;
    let t = if value.is_nan() {
        0.0
    } else {
        ((f64::from(value) - f64::from(min)) / (f64::from(max) - f64::from(min))).clamp(0.0, 1.0)
    };
    (t * steps).round() as u32
}

/// Inverse of [`quantize`]
pub fn dequantize(raw: u32, min: f32, max: f32, bits: u32) -> f32 {
    let bits = bits.min(MAX_UINT_BITS);
    if bits == 0 || max <= min {
        return min;
    }
    let steps = ((1u64 << bits) - 1) as f64;
    let t = (f64::from(raw) / steps).min(1.0);
    (f64::from(min) + t * (f64::from(max) - f64::from(min))) as f32
}

// ============================================================================
// Reader
// ============================================================================

/// Bit-level reader over a borrowed message
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    #[inline]
    pub fn bits_remaining(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.bit_pos)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits_remaining() == 0
    }

    #[inline]
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    fn ensure_bits(&self, bits: usize) -> BitResult<()> {
        let available = self.bits_remaining();
        if bits > available {
            return Err(BitError::UnexpectedEof {
                requested: bits,
                available,
            });
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> BitResult<bool> {
        self.ensure_bits(1)?;
        let byte = self.data[self.bit_pos >> 3];
        let bit = (byte >> (self.bit_pos & 7)) & 1;
        self.bit_pos += 1;
        Ok(bit == 1)
    }

    pub fn read_uint(&mut self, bits: u32) -> BitResult<u32> {
        if bits > MAX_UINT_BITS {
            return Err(BitError::InvalidBitCount {
                bits,
                max_bits: MAX_UINT_BITS,
            });
        }
        self.ensure_bits(bits as usize)?;
        let mut value = 0u32;
        for i in 0..bits {
            if self.read_bool()? {
                value |= 1 << i;
            }
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> BitResult<u8> {
        Ok(self.read_uint(8)? as u8)
    }

    pub fn read_u16(&mut self) -> BitResult<u16> {
        Ok(self.read_uint(16)? as u16)
    }

    pub fn read_u32(&mut self) -> BitResult<u32> {
        self.read_uint(32)
    }

    pub fn read_f32(&mut self) -> BitResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_quantized(&mut self, min: f32, max: f32, bits: u32) -> BitResult<f32> {
        let raw = self.read_uint(bits)?;
        Ok(dequantize(raw, min, max, bits))
    }

    /// Reads `len` 7-bit characters, dropping the zero padding
    pub fn read_ascii_fixed(&mut self, len: usize) -> BitResult<String> {
        self.ensure_bits(len * 7)?;
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            let c = self.read_uint(7)? as u8;
            if c != 0 {
                out.push(char::from(c));
            }
        }
        Ok(out)
    }

    /// Reads a length-prefixed UTF-8 string. At most `max_bytes` are kept;
    /// any declared excess is skipped without being allocated.
    pub fn read_string(&mut self, max_bytes: usize) -> BitResult<String> {
        let declared = self.read_u16()? as usize;
        let keep = declared.min(max_bytes);
        let bytes = self.read_bytes(keep)?;
        if declared > keep {
            debug!("string length {} exceeds cap {}, skipping excess", declared, max_bytes);
            self.skip_bits((declared - keep) * 8)?;
        }
        // a truncated tail may split a char; keep the valid prefix
        match String::from_utf8(bytes) {
            Ok(s) => Ok(s),
            Err(e) if declared > keep => {
                let valid = e.utf8_error().valid_up_to();
                let mut bytes = e.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).map_err(|_| BitError::InvalidUtf8)
            }
            Err(_) => Err(BitError::InvalidUtf8),
        }
    }

    /// Reads a `u16`-counted array. Elements past `max_count` are not read.
    pub fn read_array<T>(
        &mut self,
        max_count: usize,
        mut decode: impl FnMut(&mut Self) -> BitResult<T>,
    ) -> BitResult<Vec<T>> {
        let declared = self.read_u16()? as usize;
        let count = declared.min(max_count);
        if declared > count {
            debug!("array count {} exceeds cap {}, reading {}", declared, max_count, count);
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(decode(self)?);
        }
        Ok(items)
    }

    pub fn read_bytes(&mut self, len: usize) -> BitResult<Vec<u8>> {
        self.ensure_bits(len * 8)?;
        if self.bit_pos % 8 == 0 {
            let start = self.bit_pos / 8;
            self.bit_pos += len * 8;
            return Ok(self.data[start..start + len].to_vec());
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_u8()?);
        }
        Ok(out)
    }

    fn skip_bits(&mut self, bits: usize) -> BitResult<()> {
        self.ensure_bits(bits)?;
        self.bit_pos += bits;
        Ok(())
    }

    /// Skip the padding up to the next byte boundary
    pub fn align_to_byte(&mut self) {
        let rem = self.bit_pos % 8;
        if rem != 0 {
            // padding bits live inside a byte that exists
            self.bit_pos += 8 - rem;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_writer() {
        let writer = BitWriter::new();
        assert_eq!(writer.bit_position(), 0);
        assert!(writer.into_inner().is_empty());
    }

    #[test]
    fn test_lsb_first_packing() {
        let mut writer = BitWriter::new();
        writer.write_bool(true);
        writer.write_bool(false);
        writer.write_bool(true);
        assert_eq!(writer.as_bytes(), &[0b0000_0101]);
    }

    #[test]
    fn test_aligned_u16_is_little_endian() {
        let mut writer = BitWriter::new();
        writer.write_u16(0xABCD);
        assert_eq!(writer.as_bytes(), &[0xCD, 0xAB]);

        let mut unaligned = BitWriter::new();
        unaligned.write_bool(false);
        unaligned.write_u16(0xABCD);
        let mut reader = BitReader::new(unaligned.as_bytes());
        assert!(!reader.read_bool().unwrap());
        assert_eq!(reader.read_u16().unwrap(), 0xABCD);
    }

    #[test]
    fn test_uint_across_byte_boundary() {
        let mut writer = BitWriter::new();
        writer.write_uint(0b101, 3);
        writer.write_uint(0x3FF, 10);
        writer.write_uint(1, 1);
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 2);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_uint(3).unwrap(), 0b101);
        assert_eq!(reader.read_uint(10).unwrap(), 0x3FF);
        assert_eq!(reader.read_uint(1).unwrap(), 1);
    }

    #[test]
    fn test_align_pads_with_zeroes() {
        let mut writer = BitWriter::new();
        writer.write_uint(0b11, 2);
        writer.align_to_byte();
        writer.write_u8(0x7F);
        assert_eq!(writer.as_bytes(), &[0b0000_0011, 0x7F]);

        let mut reader = BitReader::new(writer.as_bytes());
        reader.read_uint(2).unwrap();
        reader.align_to_byte();
        assert_eq!(reader.read_u8().unwrap(), 0x7F);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_align_when_aligned_is_noop() {
        let mut writer = BitWriter::new();
        writer.write_u8(1);
        writer.align_to_byte();
        assert_eq!(writer.byte_len(), 1);
        assert_eq!(writer.bit_position(), 8);
    }

    #[test]
    fn test_quantized_clamps_out_of_range() {
        let mut writer = BitWriter::new();
        writer.write_quantized(-10.0, 0.0, 1.0, 8);
        writer.write_quantized(10.0, 0.0, 1.0, 8);
        writer.write_quantized(f32::NAN, 0.0, 1.0, 8);
        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_quantized(0.0, 1.0, 8).unwrap(), 0.0);
        assert_eq!(reader.read_quantized(0.0, 1.0, 8).unwrap(), 1.0);
        assert_eq!(reader.read_quantized(0.0, 1.0, 8).unwrap(), 0.0);
    }

    #[test]
    fn test_quantize_formula() {
        // round((0.5 - 0) / 1 * 255) = 128
        assert_eq!(quantize(0.5, 0.0, 1.0, 8), 128);
        assert_eq!(quantize(1.0, 0.0, 1.0, 16), 65535);
    }

    #[test]
    fn test_string_truncates_on_char_boundary() {
        let mut writer = BitWriter::new();
        // 'é' is two bytes; a 4-byte cap would split it
        writer.write_string("abcé", 4);
        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_string(64).unwrap(), "abc");
    }

    #[test]
    fn test_read_string_respects_cap_and_skips_excess() {
        let mut writer = BitWriter::new();
        writer.write_string("overlong-name", 64);
        writer.write_u8(0x42);
        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_string(4).unwrap(), "over");
        assert_eq!(reader.read_u8().unwrap(), 0x42);
    }

    #[test]
    fn test_ascii_fixed() {
        let mut writer = BitWriter::new();
        writer.write_ascii_fixed("Ab", 4);
        writer.write_ascii_fixed("toolong", 3);
        writer.write_ascii_fixed("é", 1);
        assert_eq!(writer.bit_position(), 8 * 7);

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_ascii_fixed(4).unwrap(), "Ab");
        assert_eq!(reader.read_ascii_fixed(3).unwrap(), "too");
        assert_eq!(reader.read_ascii_fixed(1).unwrap(), "?");
    }

    #[test]
    fn test_array_truncates_on_write() {
        let mut writer = BitWriter::new();
        writer.write_array(&[1u8, 2, 3, 4, 5], 3, |w, v| w.write_u8(*v));
        let mut reader = BitReader::new(writer.as_bytes());
        let items = reader.read_array(16, |r| r.read_u8()).unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn test_array_cap_on_read() {
        let mut writer = BitWriter::new();
        writer.write_array(&[9u8; 10], 100, |w, v| w.write_u8(*v));
        let mut reader = BitReader::new(writer.as_bytes());
        let items = reader.read_array(2, |r| r.read_u8()).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_reserve_and_patch() {
        let mut writer = BitWriter::new();
        writer.write_bool(true);
        let slot = writer.reserve_u16();
        writer.write_u8(0xEE);
        writer.patch_u16(slot, 0x0102);
        assert_eq!(writer.as_bytes(), &[0x01, 0x02, 0x01, 0xEE]);
    }

    #[test]
    fn test_from_vec_keeps_capacity() {
        let buffer = Vec::with_capacity(64);
        let mut writer = BitWriter::from_vec(buffer);
        writer.write_u32(7);
        let bytes = writer.into_inner();
        assert!(bytes.capacity() >= 64);
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut reader = BitReader::new(&[0xFF]);
        reader.read_uint(6).unwrap();
        let err = reader.read_uint(4).unwrap_err();
        assert_eq!(
            err,
            BitError::UnexpectedEof {
                requested: 4,
                available: 2
            }
        );
    }

    #[test]
    fn test_invalid_bit_count() {
        let mut reader = BitReader::new(&[0; 8]);
        assert!(matches!(
            reader.read_uint(33),
            Err(BitError::InvalidBitCount { bits: 33, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut writer = BitWriter::new();
        writer.write_u16(2);
        writer.write_bytes_aligned(&[0xFF, 0xFE]);
        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_string(8), Err(BitError::InvalidUtf8));
    }

    proptest! {
        #[test]
        fn prop_quantized_unit_range_16_bits(v in 0.0f32..=1.0) {
            let mut writer = BitWriter::new();
            writer.write_quantized(v, 0.0, 1.0, 16);
            let mut reader = BitReader::new(writer.as_bytes());
            let decoded = reader.read_quantized(0.0, 1.0, 16).unwrap();
            prop_assert!((decoded - v).abs() <= 1.0 / 65535.0);
        }

        #[test]
        fn prop_quantized_any_range(v in -5000.0f32..5000.0, bits in 4u32..=24) {
            let (min, max) = (-1000.0f32, 1000.0f32);
            let mut writer = BitWriter::new();
            writer.write_quantized(v, min, max, bits);
            let mut reader = BitReader::new(writer.as_bytes());
            let decoded = reader.read_quantized(min, max, bits).unwrap();
            let step = (max - min) / ((1u64 << bits) - 1) as f32;
            prop_assert!((decoded - v.clamp(min, max)).abs() <= step * 0.5 + 1e-3);
        }

        #[test]
        fn prop_mixed_fields_roundtrip(
            flag in any::<bool>(),
            small in 0u32..128,
            word in any::<u16>(),
            text in "[a-zA-Z0-9 ]{0,20}",
        ) {
            let mut writer = BitWriter::new();
            writer.write_bool(flag);
            writer.write_uint(small, 7);
            writer.write_u16(word);
            writer.write_string(&text, 32);
            writer.align_to_byte();

            let mut reader = BitReader::new(writer.as_bytes());
            prop_assert_eq!(reader.read_bool().unwrap(), flag);
            prop_assert_eq!(reader.read_uint(7).unwrap(), small);
            prop_assert_eq!(reader.read_u16().unwrap(), word);
            prop_assert_eq!(reader.read_string(32).unwrap(), text);
            reader.align_to_byte();
            prop_assert!(reader.is_empty());
        }
    }
}
