// src/cabac/coder.rs

//! Binary arithmetic coder.
//!
//! A 32-bit low/range engine with a 23-bit initial bit budget. Output leaves
//! the engine one byte at a time through a carry buffer: a pending run of
//! `0xFF` lead bytes is withheld until a non-`0xFF` byte resolves whether a
//! carry ripples into the run. The emitted byte sequence is therefore a pure
//! function of the coded bin sequence, independent of when flushes happen.
//!
//! The coder has two orthogonal switches. `only_count` turns every flush into
//! a byte counter so a simulation pass can measure cost without emitting.
//! `update` gates context adaptation so a pass can reuse probabilities
//! without disturbing them.
//!
//! Call-order violations (finishing twice, coding after `finish` without
//! `start`) are caller bugs and are checked with `debug_assert!` only.

use crate::bitstream::bit_sink::BitSink;
use crate::cabac::context::ContextModel;
use crate::cabac::tables::{MAX_LOG2_TR_DYNAMIC_RANGE, RENORM_TABLE, TB_MAX};

#[cfg(feature = "cabac-trace")]
use log::trace;

/// Context-adaptive binary arithmetic coder writing into an owned [`BitSink`].
#[derive(Debug, Clone)]
pub struct Cabac {
    low: u32,
    range: u32,
    bits_left: i32,
    buffered_byte: u32,
    num_buffered_bytes: u32,
    only_count: bool,
    update: bool,
    sink: BitSink,
}

impl Default for Cabac {
    fn default() -> Self {
        Self::new()
    }
}

impl Cabac {
    pub fn new() -> Self {
        let mut cabac = Cabac {
            low: 0,
            range: 510,
            bits_left: 23,
            buffered_byte: 0xFF,
            num_buffered_bytes: 0,
            only_count: false,
            update: true,
            sink: BitSink::new(),
        };
        cabac.start();
        cabac
    }

    /// Resets the arithmetic state for a new substream. The sink and the
    /// `update` switch are left alone.
    pub fn start(&mut self) {
        self.low = 0;
        self.range = 510;
        self.bits_left = 23;
        self.buffered_byte = 0xFF;
        self.num_buffered_bytes = 0;
        self.only_count = false;
    }

    /// Switches between real emission and byte counting. Counting mode must
    /// be entered while nothing is buffered; re-arming an already counting
    /// coder is allowed.
    pub fn set_only_count(&mut self, only_count: bool) {
        debug_assert!(!only_count || self.only_count || self.num_buffered_bytes == 0);
        self.only_count = only_count;
    }

    #[inline]
    pub fn only_count(&self) -> bool {
        self.only_count
    }

    /// Gates context adaptation in [`Cabac::encode_bin`] and the
    /// context-coded binarizations.
    pub fn set_update(&mut self, update: bool) {
        self.update = update;
    }

    #[inline]
    pub fn sink(&self) -> &BitSink {
        &self.sink
    }

    #[inline]
    pub fn sink_mut(&mut self) -> &mut BitSink {
        &mut self.sink
    }

    /// Bits consumed since `start`, valid in counting mode where flushed
    /// bytes accumulate instead of being emitted.
    pub fn bits_spent(&self) -> u32 {
        debug_assert!(self.only_count);
        self.num_buffered_bytes * 8 + (23 - self.bits_left) as u32
    }

    /// Codes one regular (context-modeled) bin.
    pub fn encode_bin(&mut self, ctx: &mut ContextModel, bin: bool) {
        #[cfg(feature = "cabac-trace")]
        trace!(
            "bin={} state={} mps={} range={}",
            bin as u32,
            ctx.state(),
            ctx.mps() as u32,
            self.range
        );

        let lps = ctx.lps_range(self.range);
        self.range -= lps;

        if bin != ctx.mps() {
            let shift = RENORM_TABLE[(lps >> 3) as usize] as i32;
            self.low = (self.low + self.range) << shift;
            self.range = lps << shift;
            self.bits_left -= shift;
            if self.bits_left < 12 {
                self.write_out();
            }
        } else if self.range < 256 {
            self.low <<= 1;
            self.range <<= 1;
            self.bits_left -= 1;
            if self.bits_left < 12 {
                self.write_out();
            }
        }

        if self.update {
            ctx.update(bin);
        }
    }

    /// Codes one bypass (equiprobable) bin.
    pub fn encode_bin_ep(&mut self, bin: bool) {
        #[cfg(feature = "cabac-trace")]
        trace!("ep bin={} range={}", bin as u32, self.range);

        self.low <<= 1;
        if bin {
            self.low += self.range;
        }
        self.bits_left -= 1;
        if self.bits_left < 12 {
            self.write_out();
        }
    }

    /// Codes the low `num_bins` bits of `bin_values` as bypass bins, MSB
    /// first, in groups of up to eight. Produces the same bytes as coding
    /// each bin through [`Cabac::encode_bin_ep`].
    pub fn encode_bins_ep(&mut self, mut bin_values: u32, mut num_bins: u32) {
        debug_assert!(num_bins <= 32);
        debug_assert!(num_bins == 32 || bin_values < (1u64 << num_bins) as u32);

        if self.range == 256 {
            self.encode_aligned_bins_ep(bin_values, num_bins);
            return;
        }

        while num_bins > 8 {
            num_bins -= 8;
            let pattern = bin_values >> num_bins;
            self.low = (self.low << 8) + self.range * pattern;
            bin_values -= pattern << num_bins;
            self.bits_left -= 8;
            if self.bits_left < 12 {
                self.write_out();
            }
        }

        self.low = (self.low << num_bins) + self.range * bin_values;
        self.bits_left -= num_bins as i32;
        if self.bits_left < 12 {
            self.write_out();
        }
    }

    /// Bypass batch for the byte-aligned case. With `range == 256` the
    /// per-bin recurrence `low = (low << 1) + bin * range` collapses to a
    /// plain shift-and-or of the whole group.
    fn encode_aligned_bins_ep(&mut self, bin_values: u32, num_bins: u32) {
        debug_assert_eq!(self.range, 256);
        let mut rem_bins = num_bins;
        while rem_bins > 0 {
            let bins_to_code = rem_bins.min(8);
            let bin_mask = (1u32 << bins_to_code) - 1;
            let new_bins = (bin_values >> (rem_bins - bins_to_code)) & bin_mask;
            self.low = (self.low << bins_to_code) + (new_bins << 8);
            rem_bins -= bins_to_code;
            self.bits_left -= bins_to_code as i32;
            if self.bits_left < 12 {
                self.write_out();
            }
        }
    }

    /// Codes the terminating bin. A `true` bin commits seven low bits and
    /// pins the range to 256 so the stream can be finished.
    pub fn encode_bin_trm(&mut self, bin: bool) {
        self.range -= 2;
        if bin {
            self.low += self.range;
            self.low <<= 7;
            self.range = 2 << 7;
            self.bits_left -= 7;
        } else if self.range >= 256 {
            return;
        } else {
            self.low <<= 1;
            self.range <<= 1;
            self.bits_left -= 1;
        }

        if self.bits_left < 12 {
            self.write_out();
        }
    }

    /// Moves the finished lead byte of `low` into the carry buffer, emitting
    /// any pending run whose carry is now resolved.
    fn write_out(&mut self) {
        let lead_byte = self.low >> (24 - self.bits_left);
        self.bits_left += 8;
        self.low &= 0xFFFF_FFFFu32 >> self.bits_left;

        if self.only_count {
            self.num_buffered_bytes += 1;
            return;
        }

        if lead_byte == 0xFF {
            self.num_buffered_bytes += 1;
        } else if self.num_buffered_bytes > 0 {
            let carry = lead_byte >> 8;
            self.sink.append_byte((self.buffered_byte + carry) as u8);
            self.buffered_byte = lead_byte & 0xFF;

            let run_byte = ((0xFF + carry) & 0xFF) as u8;
            while self.num_buffered_bytes > 1 {
                self.sink.append_byte(run_byte);
                self.num_buffered_bytes -= 1;
            }
        } else {
            self.num_buffered_bytes = 1;
            self.buffered_byte = lead_byte;
        }
    }

    /// Drains the carry buffer and the live window of `low` into the sink.
    /// The stream is complete only after the caller appends the final `1`
    /// bit and aligns.
    pub fn finish(&mut self) {
        debug_assert!(self.bits_left <= 32);

        if self.low >> (32 - self.bits_left) != 0 {
            self.sink.append_byte((self.buffered_byte + 1) as u8);
            while self.num_buffered_bytes > 1 {
                self.sink.append_byte(0x00);
                self.num_buffered_bytes -= 1;
            }
            self.low -= 1 << (32 - self.bits_left);
        } else {
            if self.num_buffered_bytes > 0 {
                self.sink.append_byte(self.buffered_byte as u8);
            }
            while self.num_buffered_bytes > 1 {
                self.sink.append_byte(0xFF);
                self.num_buffered_bytes -= 1;
            }
        }

        let bits = (24 - self.bits_left) as u8;
        self.sink.put(self.low >> 8, bits);
    }

    /// Truncated binary code for `symbol` in `0..max_value`.
    pub fn encode_trunc_bin(&mut self, symbol: u32, max_value: u32) {
        debug_assert!(symbol < max_value);

        let thresh = if max_value > 256 {
            let mut thresh = 8u32;
            let mut thresh_val = 1u32 << 8;
            while thresh_val <= max_value {
                thresh += 1;
                thresh_val <<= 1;
            }
            thresh - 1
        } else {
            TB_MAX[max_value as usize] as u32
        };

        let val = 1u32 << thresh;
        let b = max_value - val;
        if symbol < val - b {
            self.encode_bins_ep(symbol, thresh);
        } else {
            self.encode_bins_ep(symbol + (val - b), thresh + 1);
        }
    }

    /// Coefficient-remainder code: truncated Rice below `cutoff << rice_param`,
    /// an exp-Golomb escape above it, all bypass bins.
    pub fn write_coeff_remain(&mut self, remainder: u32, rice_param: u32, cutoff: u32) {
        let threshold = cutoff << rice_param;
        let bins = remainder;

        if bins < threshold {
            let length = (bins >> rice_param) + 1;
            self.encode_bins_ep((1 << length) - 2, length);
            self.encode_bins_ep(bins & ((1 << rice_param) - 1), rice_param);
        } else {
            let max_prefix_length = 32 - cutoff - MAX_LOG2_TR_DYNAMIC_RANGE;
            let code_value = (bins >> rice_param) - cutoff;
            let mut prefix_length = 0u32;
            let suffix_length;
            if code_value >= (1 << max_prefix_length) - 1 {
                prefix_length = max_prefix_length;
                suffix_length = MAX_LOG2_TR_DYNAMIC_RANGE;
            } else {
                while code_value > (2 << prefix_length) - 2 {
                    prefix_length += 1;
                }
                suffix_length = prefix_length + rice_param + 1;
            }
            let total_prefix_length = prefix_length + cutoff;
            let bit_mask = (1u32 << rice_param) - 1;
            let prefix = (1u32 << total_prefix_length) - 1;
            let suffix = ((code_value - ((1 << prefix_length) - 1)) << rice_param) | (bins & bit_mask);
            self.encode_bins_ep(prefix, total_prefix_length);
            self.encode_bins_ep(suffix, suffix_length);
        }
    }

    /// Context-coded truncated unary code. Every bin adapts the same context.
    pub fn write_unary_max_symbol(
        &mut self,
        ctx: &mut ContextModel,
        symbol: u32,
        max_symbol: u32,
    ) {
        debug_assert!(symbol <= max_symbol);
        let code_last = max_symbol > symbol;

        if max_symbol == 0 {
            return;
        }

        self.encode_bin(ctx, symbol != 0);
        if symbol == 0 {
            return;
        }

        for _ in 1..symbol {
            self.encode_bin(ctx, true);
        }
        if code_last {
            self.encode_bin(ctx, false);
        }
    }

    /// Truncated unary code in bypass bins (Rice with parameter zero).
    pub fn write_unary_max_symbol_ep(&mut self, symbol: u32, max_symbol: u32) {
        debug_assert!(symbol <= max_symbol);
        let code_last = max_symbol > symbol;

        self.encode_bin_ep(symbol != 0);
        if symbol == 0 {
            return;
        }

        for _ in 1..symbol {
            self.encode_bin_ep(true);
        }
        if code_last {
            self.encode_bin_ep(false);
        }
    }

    /// Exp-Golomb code of the given order in bypass bins.
    pub fn write_ep_ex_golomb(&mut self, mut symbol: u32, mut count: u32) {
        let mut bins = 0u32;
        let mut num_bins = 0u32;

        while symbol >= 1 << count {
            bins = 2 * bins + 1;
            num_bins += 1;
            symbol -= 1 << count;
            count += 1;
        }
        bins *= 2;
        num_bins += 1;

        bins = (bins << count) | symbol;
        num_bins += count;

        self.encode_bins_ep(bins, num_bins);
    }
}
