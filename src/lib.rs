//! # HEVC-style Entropy Coding Core
//!
//! A threaded encoder core built around two guarantees: the arithmetic coder
//! emits byte-exact standard CABAC output, and the job scheduler produces the
//! same bitstream for any worker count, including none.
//!
//! The library is organized into several modules:
//! - `utils`: Error handling and the graph-serialized access cell
//! - `bitstream`: Bit-level output buffer
//! - `cabac`: Arithmetic coder, adaptive contexts, and the published tables
//! - `state`: Per-frame state tree, block geometry, and substreams
//! - `scheduler`: Dependency jobs, the worker pool, and frame graphs
//! - `codec`: The block codec seam and the built-in demo codec
//! - `encoder`: Frame pipeline and payload output

// Re-export commonly used types at the crate root
pub use config::{EncoderConfig, SliceType};
pub use encoder::{Encoder, FrameOutput};
pub use utils::error::{EncoderError, Result};

pub mod utils {
    pub mod error;
    pub mod exclusive;
}

pub mod bitstream {
    pub mod bit_sink;
}

pub mod cabac {
    pub mod coder;
    pub mod context;
    pub mod tables;
}

pub mod state {
    pub mod node;
    pub mod substream;
}

pub mod scheduler {
    pub mod frame;
    pub mod job;
    pub mod queue;
}

pub mod codec;
pub mod config;
pub mod encoder;
