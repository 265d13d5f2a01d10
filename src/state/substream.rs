// src/state/substream.rs

//! One independently decodable bitstream segment.
//!
//! A leaf of the state tree owns exactly one substream: the arithmetic coder
//! (with its sink) plus the adaptive contexts it drives. The lifecycle per
//! frame is reseed, emit blocks, terminate at the region edge. A terminated
//! coder restarts immediately so a wavefront row can hold several terminated
//! segments in one sink.

use crate::cabac::coder::Cabac;
use crate::cabac::context::ContextSet;
use crate::config::SliceType;

#[derive(Debug, Clone)]
pub struct Substream {
    pub cabac: Cabac,
    pub contexts: ContextSet,
}

impl Substream {
    pub fn new(slice_type: SliceType, qp: u8) -> Self {
        Substream {
            cabac: Cabac::new(),
            contexts: ContextSet::new(slice_type, qp),
        }
    }

    /// Restarts the coder and reseeds every context. The sink keeps whatever
    /// has been emitted so far.
    pub fn reseed(&mut self, slice_type: SliceType, qp: u8) {
        self.cabac.start();
        self.contexts = ContextSet::new(slice_type, qp);
    }

    /// Discards all emitted bytes on top of a reseed. Used when a simulated
    /// emission pass is thrown away before the real one.
    pub fn reset_after_simulation(&mut self, slice_type: SliceType, qp: u8) {
        self.cabac.sink_mut().clear();
        self.reseed(slice_type, qp);
    }

    /// Ends the current segment: terminating bin, coder drain, stop bit,
    /// zero padding, coder restart.
    pub fn terminate(&mut self) {
        self.cabac.encode_bin_trm(true);
        self.cabac.finish();
        self.cabac.sink_mut().put(1, 1);
        self.cabac.sink_mut().align_zero();
        self.cabac.start();
    }

    /// Takes the finished bytes, leaving the substream ready for reuse.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        self.cabac.sink_mut().take_bytes()
    }
}
