// src/codec.rs

//! Block codec seam between the scheduler and the signal-processing side.
//!
//! The scheduler only knows two operations: `search` produces a block's
//! reconstruction and coefficients from the source and already-reconstructed
//! neighbors, and `emit` walks the block syntax into a substream. `emit` must
//! be a pure function of its arguments so a counting pass and the real pass
//! produce the same bin sequence.
//!
//! [`DemoCodec`] is a deliberately small intra-DC / zero-motion codec that
//! exercises every binarization; it exists so the pipeline runs end to end
//! without prediction or transform machinery.

use crate::config::SliceType;
use crate::state::node::BlockInfo;
use crate::state::substream::Substream;
use crate::utils::error::{EncoderError, Result};

/// One luma frame handed to the encoder.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major, stride == width.
    pub pixels: Vec<u8>,
}

impl SourceFrame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if pixels.len() != (width as usize) * (height as usize) {
            return Err(EncoderError::InvalidArg(format!(
                "expected {} pixels for {}x{}, got {}",
                width as usize * height as usize,
                width,
                height,
                pixels.len()
            )));
        }
        Ok(SourceFrame { width, height, pixels })
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.pixels[(y * self.width + x) as usize]
    }
}

/// Output of a block search: everything `emit` and later frames need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    /// Reconstructed pixels of the block, row-major, stride == block width.
    pub recon: Vec<u8>,
    /// 4x4 quantized coefficients in raster scan.
    pub coeffs: Vec<i32>,
    /// Intra mode, 0..35.
    pub mode: u32,
    /// Motion vector difference for inter blocks.
    pub mvd: (i32, i32),
    pub split: bool,
    pub skipped: bool,
}

impl BlockResult {
    #[inline]
    pub fn cbf(&self) -> bool {
        self.coeffs.iter().any(|&c| c != 0)
    }
}

/// Reconstructed neighbors available to a block search. `colocated` is the
/// same block position in the reference frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborRecon<'a> {
    pub left: Option<&'a BlockResult>,
    pub above: Option<&'a BlockResult>,
    pub colocated: Option<&'a BlockResult>,
}

/// In-loop filter parameters derived once per frame, signaled per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOffsets {
    pub merge: bool,
    pub offset: u32,
}

pub trait BlockCodec: Send + Sync {
    /// Reconstructs one block. Must be deterministic in its arguments.
    fn search(
        &self,
        frame: &SourceFrame,
        block: &BlockInfo,
        neighbors: NeighborRecon<'_>,
        slice_type: SliceType,
        qp: u8,
    ) -> BlockResult;

    /// Emits the block syntax into the substream. Pure in everything except
    /// the substream itself.
    fn emit(
        &self,
        block: &BlockInfo,
        result: &BlockResult,
        filter: Option<FilterOffsets>,
        slice_type: SliceType,
        substream: &mut Substream,
    );
}

pub trait FilterParams: Send + Sync {
    /// Derives filter parameters from the fully reconstructed frame.
    fn derive(&self, width: u32, height: u32, recon: &[u8]) -> FilterOffsets;
}

/// DC-predict, sample-and-shift-quantize block codec.
#[derive(Debug, Default, Clone)]
pub struct DemoCodec;

impl DemoCodec {
    fn quant_shift(qp: u8) -> u32 {
        1 + (qp as u32) / 6
    }

    /// DC value from the right column of the left neighbor and the bottom
    /// row of the above neighbor, 128 when the block has neither.
    fn intra_dc(block: &BlockInfo, neighbors: &NeighborRecon<'_>) -> u8 {
        let mut sum = 0u64;
        let mut count = 0u64;
        if let Some(left) = neighbors.left {
            let w = left.recon.len() as u32 / block.height;
            for y in 0..block.height {
                sum += left.recon[(y * w + w - 1) as usize] as u64;
                count += 1;
            }
        }
        if let Some(above) = neighbors.above {
            let h = above.recon.len() as u32 / block.width;
            for x in 0..block.width {
                sum += above.recon[((h - 1) * block.width + x) as usize] as u64;
                count += 1;
            }
        }
        if count == 0 {
            128
        } else {
            (sum / count) as u8
        }
    }
}

impl BlockCodec for DemoCodec {
    fn search(
        &self,
        frame: &SourceFrame,
        block: &BlockInfo,
        neighbors: NeighborRecon<'_>,
        slice_type: SliceType,
        qp: u8,
    ) -> BlockResult {
        let w = block.width;
        let h = block.height;
        let inter = !slice_type.is_intra() && neighbors.colocated.is_some();

        let pred: Vec<u8> = if inter {
            neighbors.colocated.unwrap().recon.clone()
        } else {
            vec![Self::intra_dc(block, &neighbors); (w * h) as usize]
        };

        // One coefficient per 4x4 grid cell, sampled at the cell origin.
        let shift = Self::quant_shift(qp);
        let mut coeffs = vec![0i32; 16];
        for qy in 0..4u32 {
            for qx in 0..4u32 {
                let sx = qx * w / 4;
                let sy = qy * h / 4;
                let residual = frame.pixel(block.px_x + sx, block.px_y + sy) as i32
                    - pred[(sy * w + sx) as usize] as i32;
                coeffs[(qy * 4 + qx) as usize] = residual / (1 << shift);
            }
        }

        let mut recon = pred.clone();
        for qy in 0..4u32 {
            for qx in 0..4u32 {
                let delta = coeffs[(qy * 4 + qx) as usize] << shift;
                for y in qy * h / 4..(qy + 1) * h / 4 {
                    for x in qx * w / 4..(qx + 1) * w / 4 {
                        let i = (y * w + x) as usize;
                        recon[i] = (pred[i] as i32 + delta).clamp(0, 255) as u8;
                    }
                }
            }
        }

        let cbf = coeffs.iter().any(|&c| c != 0);
        let mode = if inter {
            0
        } else {
            let sum: u64 = (0..h)
                .flat_map(|y| (0..w).map(move |x| (x, y)))
                .map(|(x, y)| frame.pixel(block.px_x + x, block.px_y + y) as u64)
                .sum();
            (sum % 35) as u32
        };
        let mvd = if inter {
            (coeffs[0].clamp(-6, 6), coeffs[5].clamp(-6, 6))
        } else {
            (0, 0)
        };
        let skipped = inter && !cbf;
        let split = coeffs.iter().filter(|&&c| c != 0).count() > 8;

        BlockResult {
            recon: if skipped { pred } else { recon },
            coeffs,
            mode,
            mvd,
            split,
            skipped,
        }
    }

    fn emit(
        &self,
        _block: &BlockInfo,
        result: &BlockResult,
        filter: Option<FilterOffsets>,
        slice_type: SliceType,
        substream: &mut Substream,
    ) {
        let Substream { cabac, contexts } = substream;

        if let Some(f) = filter {
            cabac.encode_bin(&mut contexts.filter_merge, f.merge);
            if !f.merge {
                cabac.write_unary_max_symbol_ep(f.offset, 7);
            }
        }

        cabac.encode_bin(&mut contexts.split_flag[0], result.split);

        if !slice_type.is_intra() {
            cabac.encode_bin(&mut contexts.skip_flag[0], result.skipped);
            if result.skipped {
                return;
            }
            for d in [result.mvd.0, result.mvd.1] {
                cabac.write_ep_ex_golomb(d.unsigned_abs(), 1);
                if d != 0 {
                    cabac.encode_bin_ep(d < 0);
                }
            }
        } else {
            cabac.encode_trunc_bin(result.mode, 35);
        }

        let cbf = result.cbf();
        cabac.encode_bin(&mut contexts.cbf[0], cbf);
        if !cbf {
            return;
        }

        let last = result.coeffs.iter().rposition(|&c| c != 0).unwrap();
        cabac.write_unary_max_symbol(&mut contexts.last_pos[0], last as u32, 15);

        // Significance for everything before the last, which is implied.
        for i in 0..last {
            cabac.encode_bin(&mut contexts.sig_coeff[i & 3], result.coeffs[i] != 0);
        }

        let mut signs = 0u32;
        let mut num_signs = 0u32;
        for i in 0..=last {
            let level = result.coeffs[i].unsigned_abs();
            if level == 0 {
                continue;
            }
            cabac.encode_bin(&mut contexts.greater_one[i & 1], level > 1);
            if level > 1 {
                cabac.write_coeff_remain(level - 2, 0, 3);
            }
            signs = (signs << 1) | (result.coeffs[i] < 0) as u32;
            num_signs += 1;
        }
        cabac.encode_bins_ep(signs, num_signs);
    }
}

/// Frame-mean filter parameter derivation.
#[derive(Debug, Default, Clone)]
pub struct DemoFilter;

impl FilterParams for DemoFilter {
    fn derive(&self, width: u32, height: u32, recon: &[u8]) -> FilterOffsets {
        debug_assert_eq!(recon.len(), (width * height) as usize);
        let sum: u64 = recon.iter().map(|&p| p as u64).sum();
        let mean = (sum / recon.len() as u64) as u32;
        let offset = mean >> 5;
        FilterOffsets {
            merge: offset == 0,
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use crate::state::node::StateTree;

    fn frame_and_tree() -> (SourceFrame, StateTree) {
        let cfg = EncoderConfig {
            width: 128,
            height: 64,
            ..EncoderConfig::default()
        };
        let pixels: Vec<u8> = (0..128 * 64).map(|i| (i * 31 % 251) as u8).collect();
        (SourceFrame::new(128, 64, pixels).unwrap(), StateTree::build(&cfg))
    }

    #[test]
    fn test_source_frame_size_checked() {
        assert!(SourceFrame::new(16, 16, vec![0; 255]).is_err());
        assert!(SourceFrame::new(16, 16, vec![0; 256]).is_ok());
    }

    #[test]
    fn test_search_is_deterministic() {
        let (frame, tree) = frame_and_tree();
        let codec = DemoCodec;
        let block = tree.block(crate::state::node::BlockId(0));
        let a = codec.search(&frame, block, NeighborRecon::default(), SliceType::I, 27);
        let b = codec.search(&frame, block, NeighborRecon::default(), SliceType::I, 27);
        assert_eq!(a, b);
        assert_eq!(a.recon.len(), (block.width * block.height) as usize);
        assert!(a.mode < 35);
    }

    #[test]
    fn test_zero_residual_inter_block_skips() {
        let (frame, tree) = frame_and_tree();
        let codec = DemoCodec;
        let block = tree.block(crate::state::node::BlockId(0));
        let intra = codec.search(&frame, block, NeighborRecon::default(), SliceType::I, 27);

        // Reference the source itself: residuals against a perfect
        // reconstruction quantize to zero.
        let perfect = BlockResult {
            recon: (0..block.height)
                .flat_map(|y| (0..block.width).map(move |x| (x, y)))
                .map(|(x, y)| frame.pixel(x, y))
                .collect(),
            ..intra
        };
        let neighbors = NeighborRecon {
            colocated: Some(&perfect),
            ..NeighborRecon::default()
        };
        let inter = codec.search(&frame, block, neighbors, SliceType::P, 27);
        assert!(inter.skipped);
        assert_eq!(inter.mvd, (0, 0));
        assert_eq!(inter.recon, perfect.recon);
    }

    #[test]
    fn test_emit_syntax_terminates_cleanly() {
        let (frame, tree) = frame_and_tree();
        let codec = DemoCodec;
        let mut sub = Substream::new(SliceType::I, 27);
        let mut prev: Option<BlockResult> = None;
        for &id in &tree.nodes[tree.leaves[0].0].blocks {
            let block = tree.block(id);
            let neighbors = NeighborRecon {
                left: block.left.and(prev.as_ref()),
                ..NeighborRecon::default()
            };
            let result = codec.search(&frame, block, neighbors, SliceType::I, 27);
            codec.emit(block, &result, None, SliceType::I, &mut sub);
            prev = Some(result);
        }
        sub.terminate();
        assert!(sub.cabac.sink().is_aligned());
        assert!(sub.cabac.sink().len_bytes() > 2);
    }

    #[test]
    fn test_filter_offset_in_signal_range() {
        let f = DemoFilter;
        let dark = f.derive(8, 8, &[0u8; 64]);
        assert!(dark.merge);
        let bright = f.derive(8, 8, &[255u8; 64]);
        assert!(!bright.merge);
        assert!(bright.offset <= 7);
    }
}
