// src/config.rs

//! Encoder configuration and its construction-time validation.
//!
//! Every configuration that cannot produce a valid job graph or bitstream is
//! rejected here, before any frame is accepted. Nothing downstream checks the
//! configuration again.

use crate::utils::error::{EncoderError, Result};

/// Coding block (CTU) width and height in pixels.
pub const CTU_WIDTH: u32 = 64;

/// Slice coding type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    I,
    P,
    B,
}

impl SliceType {
    /// Column into the per-slice-type context init tables.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            SliceType::I => 0,
            SliceType::P => 1,
            SliceType::B => 2,
        }
    }

    #[inline]
    pub fn is_intra(self) -> bool {
        matches!(self, SliceType::I)
    }
}

/// Top-level encoder configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Base quantization parameter, 0..=51.
    pub qp: u8,
    /// Worker threads. 0 selects the fully serial encode path.
    pub threads: usize,
    /// Frames allowed in flight beyond the newest one (pipelining window).
    pub owf: u32,
    /// How many frames back the reference frame is. Must stay inside the
    /// pipelining window when one exists.
    pub ref_distance: u32,
    /// Intra frame every `intra_period` frames; 0 means only the first frame.
    pub intra_period: u32,
    /// One substream per block row, with row-to-row context hand-off.
    pub wavefront: bool,
    /// Uniform tile grid. Wavefront requires a 1x1 grid.
    pub tiles_w: u32,
    pub tiles_h: u32,
    /// Derive in-loop filter parameters over the reconstructed frame before
    /// any real bitstream is emitted.
    pub filter: bool,
    /// Cross-frame reference reach in blocks, measured down and right from a
    /// block's own position.
    pub ref_margin_down: u32,
    pub ref_margin_right: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            width: 0,
            height: 0,
            qp: 27,
            threads: 0,
            owf: 0,
            ref_distance: 1,
            intra_period: 0,
            wavefront: false,
            tiles_w: 1,
            tiles_h: 1,
            filter: false,
            ref_margin_down: 1,
            ref_margin_right: 0,
        }
    }
}

impl EncoderConfig {
    pub fn width_in_blocks(&self) -> u32 {
        self.width.div_ceil(CTU_WIDTH)
    }

    pub fn height_in_blocks(&self) -> u32 {
        self.height.div_ceil(CTU_WIDTH)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EncoderError::Config(format!(
                "frame size {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.qp > 51 {
            return Err(EncoderError::Config(format!("qp {} out of 0..=51", self.qp)));
        }
        if self.tiles_w == 0 || self.tiles_h == 0 {
            return Err(EncoderError::Config("tile grid has a zero dimension".into()));
        }
        if self.tiles_w > self.width_in_blocks() || self.tiles_h > self.height_in_blocks() {
            return Err(EncoderError::Config(format!(
                "tile grid {}x{} exceeds the {}x{} block grid",
                self.tiles_w,
                self.tiles_h,
                self.width_in_blocks(),
                self.height_in_blocks()
            )));
        }
        if self.wavefront && (self.tiles_w > 1 || self.tiles_h > 1) {
            return Err(EncoderError::Config(
                "wavefront rows and a tile grid cannot be combined".into(),
            ));
        }
        if self.ref_distance == 0 {
            return Err(EncoderError::Config("ref_distance must be at least 1".into()));
        }
        if self.owf > 0 && self.ref_distance > self.owf {
            return Err(EncoderError::Config(format!(
                "reference {} frames back falls outside the {}-frame pipelining window",
                self.ref_distance, self.owf
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EncoderConfig {
        EncoderConfig {
            width: 256,
            height: 128,
            ..EncoderConfig::default()
        }
    }

    #[test]
    fn test_default_dimensions_rejected() {
        assert!(EncoderConfig::default().validate().is_err());
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_reference_outside_window_rejected() {
        let mut cfg = base();
        cfg.owf = 1;
        cfg.ref_distance = 2;
        assert!(cfg.validate().is_err());
        cfg.owf = 2;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_wavefront_excludes_tiles() {
        let mut cfg = base();
        cfg.wavefront = true;
        assert!(cfg.validate().is_ok());
        cfg.tiles_w = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tile_grid_bounded_by_block_grid() {
        let mut cfg = base();
        cfg.tiles_w = 4; // 256 px = 4 blocks
        cfg.tiles_h = 2;
        assert!(cfg.validate().is_ok());
        cfg.tiles_w = 5;
        assert!(cfg.validate().is_err());
    }
}
