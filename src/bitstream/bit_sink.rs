// src/bitstream/bit_sink.rs

//! Append-only byte buffer with sub-byte bit packing.
//!
//! The arithmetic coder emits whole bytes through [`BitSink::append_byte`]
//! while its carry buffer is live, and finishes a substream with a short,
//! possibly unaligned run of bits through [`BitSink::put`]. Substream
//! termination then writes a single `1` bit and zero-pads to a byte boundary.

use byteorder::{BigEndian, ByteOrder};

/// An append-only bitstream buffer.
///
/// Bits are packed MSB first. Everything ever written stays in the buffer;
/// the only mutation besides appending is [`BitSink::clear`], used when a
/// count-only simulation pass is discarded.
#[derive(Debug, Default, Clone)]
pub struct BitSink {
    data: Vec<u8>,
    /// Bits collected for the current partial byte (always < 8 of them).
    cur: u8,
    cur_bits: u8,
}

impl BitSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one whole byte. The sink must be byte aligned.
    #[inline]
    pub fn append_byte(&mut self, byte: u8) {
        debug_assert_eq!(self.cur_bits, 0, "append_byte on unaligned sink");
        self.data.push(byte);
    }

    /// Writes the `bits` low bits of `value`, MSB first. `bits` may be 0..=32.
    pub fn put(&mut self, value: u32, bits: u8) {
        debug_assert!(bits <= 32);
        for i in (0..bits).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.cur = (self.cur << 1) | bit;
            self.cur_bits += 1;
            if self.cur_bits == 8 {
                self.data.push(self.cur);
                self.cur = 0;
                self.cur_bits = 0;
            }
        }
    }

    /// Pads the current partial byte with zero bits.
    pub fn align_zero(&mut self) {
        if self.cur_bits > 0 {
            self.data.push(self.cur << (8 - self.cur_bits));
            self.cur = 0;
            self.cur_bits = 0;
        }
    }

    /// Aligned big-endian word writes, used by the raw payload writer.
    pub fn put_u16_be(&mut self, value: u16) {
        debug_assert_eq!(self.cur_bits, 0);
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.data.extend_from_slice(&buf);
    }

    pub fn put_u32_be(&mut self, value: u32) {
        debug_assert_eq!(self.cur_bits, 0);
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.data.extend_from_slice(&buf);
    }

    /// Absolute position in bits.
    #[inline]
    pub fn tell(&self) -> u64 {
        self.data.len() as u64 * 8 + self.cur_bits as u64
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        self.cur_bits == 0
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        debug_assert_eq!(self.cur_bits, 0, "reading an unaligned sink");
        &self.data
    }

    /// Takes the finished bytes out of the sink, leaving it empty.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        debug_assert_eq!(self.cur_bits, 0, "taking an unaligned sink");
        std::mem::take(&mut self.data)
    }

    /// Discards everything, including a partial byte. Used when a simulated
    /// emission pass is thrown away.
    pub fn clear(&mut self) {
        self.data.clear();
        self.cur = 0;
        self.cur_bits = 0;
    }
}
