//! Shared test helpers: a conformant arithmetic decoder, the inverse of the
//! demo block syntax, and seeded frame sources.

#![allow(dead_code)]

use hevc_encoder::cabac::context::{ContextModel, ContextSet};
use hevc_encoder::cabac::tables::MAX_LOG2_TR_DYNAMIC_RANGE;
use hevc_encoder::codec::{FilterOffsets, SourceFrame};
use hevc_encoder::config::SliceType;
use hevc_encoder::{Encoder, EncoderConfig, FrameOutput};

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub fn noise_frame(width: u32, height: u32, seed: u64) -> SourceFrame {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let pixels = (0..(width * height) as usize).map(|_| rng.r#gen()).collect();
    SourceFrame::new(width, height, pixels).unwrap()
}

/// Runs a full sequence through the encoder with the given pool size and
/// pipelining window, draining at the end.
pub fn encode_sequence(
    mut cfg: EncoderConfig,
    threads: usize,
    owf: u32,
    frames: &[SourceFrame],
) -> Vec<FrameOutput> {
    cfg.threads = threads;
    cfg.owf = owf;
    let mut enc = Encoder::with_demo_codec(cfg).unwrap();
    let mut outputs = Vec::new();
    for frame in frames {
        if let Some(output) = enc.encode_frame(frame.clone()).unwrap() {
            outputs.push(output);
        }
    }
    outputs.extend(enc.finish().unwrap());
    outputs
}

pub fn assert_same_outputs(a: &[FrameOutput], b: &[FrameOutput]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.index, y.index);
        assert_eq!(x.slice_type, y.slice_type);
        assert_eq!(x.substreams, y.substreams, "frame {}", x.index);
        assert_eq!(x.bits_coded, y.bits_coded, "frame {}", x.index);
        assert_eq!(x.skipped_blocks, y.skipped_blocks, "frame {}", x.index);
    }
}

/// Arithmetic decoding engine following the standard decoding process;
/// consumes the byte stream the encoder's `Cabac` produces.
pub struct CabacDecoder<'a> {
    data: &'a [u8],
    bit_pos: usize,
    range: u32,
    offset: u32,
}

impl<'a> CabacDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let mut dec = CabacDecoder {
            data,
            bit_pos: 0,
            range: 510,
            offset: 0,
        };
        for _ in 0..9 {
            dec.offset = (dec.offset << 1) | dec.read_bit();
        }
        dec
    }

    fn read_bit(&mut self) -> u32 {
        let bit = if self.bit_pos / 8 < self.data.len() {
            (self.data[self.bit_pos / 8] >> (7 - self.bit_pos % 8)) as u32 & 1
        } else {
            0
        };
        self.bit_pos += 1;
        bit
    }

    fn renorm(&mut self) {
        while self.range < 256 {
            self.range <<= 1;
            self.offset = (self.offset << 1) | self.read_bit();
        }
    }

    pub fn decode_bin(&mut self, ctx: &mut ContextModel) -> bool {
        let lps = ctx.lps_range(self.range);
        self.range -= lps;
        let bin = if self.offset >= self.range {
            self.offset -= self.range;
            self.range = lps;
            !ctx.mps()
        } else {
            ctx.mps()
        };
        ctx.update(bin);
        self.renorm();
        bin
    }

    pub fn decode_bin_ep(&mut self) -> bool {
        self.offset = (self.offset << 1) | self.read_bit();
        if self.offset >= self.range {
            self.offset -= self.range;
            true
        } else {
            false
        }
    }

    pub fn decode_bins_ep(&mut self, num_bins: u32) -> u32 {
        let mut value = 0;
        for _ in 0..num_bins {
            value = (value << 1) | self.decode_bin_ep() as u32;
        }
        value
    }

    pub fn decode_bin_trm(&mut self) -> bool {
        self.range -= 2;
        if self.offset >= self.range {
            true
        } else {
            self.renorm();
            false
        }
    }

    pub fn decode_trunc_bin(&mut self, max_value: u32) -> u32 {
        let mut thresh = 0;
        while (1u32 << (thresh + 1)) <= max_value {
            thresh += 1;
        }
        let val = 1u32 << thresh;
        let b = max_value - val;
        let t = self.decode_bins_ep(thresh);
        if t < val - b {
            t
        } else {
            ((t << 1) | self.decode_bin_ep() as u32) - (val - b)
        }
    }

    pub fn decode_coeff_remain(&mut self, rice_param: u32, cutoff: u32) -> u32 {
        let max_prefix_length = 32 - cutoff - MAX_LOG2_TR_DYNAMIC_RANGE;
        let mut ones = 0;
        while ones < cutoff + max_prefix_length && self.decode_bin_ep() {
            ones += 1;
        }
        if ones < cutoff {
            // Rice region: the zero that stopped the count terminated the
            // quotient.
            (ones << rice_param) | self.decode_bins_ep(rice_param)
        } else if ones < cutoff + max_prefix_length {
            // Escape: the stopping zero was the top bit of the suffix.
            let prefix_length = ones - cutoff;
            let suffix = self.decode_bins_ep(prefix_length + rice_param);
            let code_value = (1 << prefix_length) - 1 + (suffix >> rice_param);
            ((code_value + cutoff) << rice_param) | (suffix & ((1 << rice_param) - 1))
        } else {
            let suffix = self.decode_bins_ep(MAX_LOG2_TR_DYNAMIC_RANGE);
            let code_value = (1 << max_prefix_length) - 1 + (suffix >> rice_param);
            ((code_value + cutoff) << rice_param) | (suffix & ((1 << rice_param) - 1))
        }
    }

    pub fn decode_unary_max(&mut self, ctx: &mut ContextModel, max_symbol: u32) -> u32 {
        if max_symbol == 0 || !self.decode_bin(ctx) {
            return 0;
        }
        let mut symbol = 1;
        while symbol < max_symbol && self.decode_bin(ctx) {
            symbol += 1;
        }
        symbol
    }

    pub fn decode_unary_max_ep(&mut self, max_symbol: u32) -> u32 {
        if !self.decode_bin_ep() {
            return 0;
        }
        let mut symbol = 1;
        while symbol < max_symbol && self.decode_bin_ep() {
            symbol += 1;
        }
        symbol
    }

    pub fn decode_ep_ex_golomb(&mut self, mut count: u32) -> u32 {
        let mut value = 0;
        while self.decode_bin_ep() {
            value += 1 << count;
            count += 1;
        }
        value + self.decode_bins_ep(count)
    }
}

/// Everything the demo block syntax carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub filter: Option<FilterOffsets>,
    pub split: bool,
    pub skipped: bool,
    pub mode: u32,
    pub mvd: (i32, i32),
    pub coeffs: Vec<i32>,
}

/// Inverse of `DemoCodec::emit` for one block.
pub fn decode_demo_block(
    dec: &mut CabacDecoder,
    ctxs: &mut ContextSet,
    slice_type: SliceType,
    filter_enabled: bool,
) -> DecodedBlock {
    let filter = if filter_enabled {
        let merge = dec.decode_bin(&mut ctxs.filter_merge);
        let offset = if merge { 0 } else { dec.decode_unary_max_ep(7) };
        Some(FilterOffsets { merge, offset })
    } else {
        None
    };

    let split = dec.decode_bin(&mut ctxs.split_flag[0]);

    let mut block = DecodedBlock {
        filter,
        split,
        skipped: false,
        mode: 0,
        mvd: (0, 0),
        coeffs: vec![0; 16],
    };

    if !slice_type.is_intra() {
        block.skipped = dec.decode_bin(&mut ctxs.skip_flag[0]);
        if block.skipped {
            return block;
        }
        let mut mvd = [0i32; 2];
        for d in &mut mvd {
            let abs = dec.decode_ep_ex_golomb(1) as i32;
            *d = if abs > 0 && dec.decode_bin_ep() { -abs } else { abs };
        }
        block.mvd = (mvd[0], mvd[1]);
    } else {
        block.mode = dec.decode_trunc_bin(35);
    }

    if !dec.decode_bin(&mut ctxs.cbf[0]) {
        return block;
    }

    let last = dec.decode_unary_max(&mut ctxs.last_pos[0], 15) as usize;
    let mut sig = [false; 16];
    for (i, s) in sig.iter_mut().enumerate().take(last) {
        *s = dec.decode_bin(&mut ctxs.sig_coeff[i & 3]);
    }
    sig[last] = true;

    let mut levels = Vec::new();
    for (i, &s) in sig.iter().enumerate().take(last + 1) {
        if !s {
            continue;
        }
        let gt1 = dec.decode_bin(&mut ctxs.greater_one[i & 1]);
        let level = if gt1 {
            2 + dec.decode_coeff_remain(0, 3)
        } else {
            1
        };
        levels.push((i, level));
    }
    let signs = dec.decode_bins_ep(levels.len() as u32);
    for (j, &(i, level)) in levels.iter().enumerate() {
        let negative = (signs >> (levels.len() - 1 - j)) & 1 == 1;
        block.coeffs[i] = if negative { -(level as i32) } else { level as i32 };
    }
    block
}

/// Checks a decoded block against the search result it was emitted from.
pub fn assert_block_matches(
    decoded: &DecodedBlock,
    result: &hevc_encoder::codec::BlockResult,
    slice_type: SliceType,
) {
    assert_eq!(decoded.split, result.split);
    assert_eq!(decoded.skipped, result.skipped);
    if result.skipped {
        return;
    }
    if slice_type.is_intra() {
        assert_eq!(decoded.mode, result.mode);
    } else {
        assert_eq!(decoded.mvd, result.mvd);
    }
    assert_eq!(decoded.coeffs, result.coeffs);
}

/// Decodes a whole single-segment substream of `num_blocks` blocks and
/// checks its termination.
pub fn decode_demo_substream(
    data: &[u8],
    num_blocks: usize,
    slice_type: SliceType,
    qp: u8,
    filter_enabled: bool,
) -> Vec<DecodedBlock> {
    let mut contexts = ContextSet::new(slice_type, qp);
    decode_demo_substream_seeded(data, num_blocks, slice_type, filter_enabled, &mut contexts)
}

/// Same, but starting from caller-provided contexts (wavefront hand-off).
pub fn decode_demo_substream_seeded(
    data: &[u8],
    num_blocks: usize,
    slice_type: SliceType,
    filter_enabled: bool,
    contexts: &mut ContextSet,
) -> Vec<DecodedBlock> {
    let mut dec = CabacDecoder::new(data);
    let blocks = (0..num_blocks)
        .map(|_| decode_demo_block(&mut dec, contexts, slice_type, filter_enabled))
        .collect();
    assert!(dec.decode_bin_trm(), "substream missing its terminating bin");
    blocks
}
