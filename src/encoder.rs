// src/encoder.rs

//! Top-level encoder: accepts frames, keeps the pipelining ring, returns
//! finished frames in order.
//!
//! With `owf` frames allowed in flight, `encode_frame` submits the new
//! frame's graph and only then harvests the oldest one, so up to `owf + 1`
//! frames encode concurrently. Outputs always come back in input order
//! regardless of thread count.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use log::info;

use crate::bitstream::bit_sink::BitSink;
use crate::codec::{BlockCodec, DemoCodec, DemoFilter, FilterParams, SourceFrame};
use crate::config::{EncoderConfig, SliceType};
use crate::scheduler::frame::{build_frame_graph, encode_frame_serial, FrameJobs, FrameState};
use crate::scheduler::queue::JobQueue;
use crate::utils::error::{EncoderError, Result};

/// One finished frame: its substreams in leaf order plus rate statistics.
#[derive(Debug)]
pub struct FrameOutput {
    pub index: u64,
    pub slice_type: SliceType,
    pub substreams: Vec<Vec<u8>>,
    pub bits_coded: u64,
    pub skipped_blocks: u32,
}

impl FrameOutput {
    /// Writes the frame as a length-prefixed payload: a big-endian u32 body
    /// length, u32 frame index, one slice-type byte, u16 substream count,
    /// then each substream as u32 length + bytes.
    pub fn write_payload<W: Write>(&self, writer: &mut W) -> Result<()> {
        let body_len = 4 + 1 + 2 + self.substreams.iter().map(|s| 4 + s.len()).sum::<usize>();

        let mut header = BitSink::new();
        header.put_u32_be(body_len as u32);
        header.put_u32_be(self.index as u32);
        header.append_byte(match self.slice_type {
            SliceType::I => b'I',
            SliceType::P => b'P',
            SliceType::B => b'B',
        });
        header.put_u16_be(self.substreams.len() as u16);
        writer.write_all(header.as_bytes())?;

        for substream in &self.substreams {
            let mut len = BitSink::new();
            len.put_u32_be(substream.len() as u32);
            writer.write_all(len.as_bytes())?;
            writer.write_all(substream)?;
        }
        Ok(())
    }
}

struct PipelineSlot {
    state: Arc<FrameState>,
    jobs: Option<FrameJobs>,
    harvested: bool,
}

pub struct Encoder {
    cfg: EncoderConfig,
    codec: Arc<dyn BlockCodec>,
    filter: Option<Arc<dyn FilterParams>>,
    queue: Option<JobQueue>,
    ring: VecDeque<PipelineSlot>,
    next_index: u64,
    finished: bool,
}

impl Encoder {
    pub fn new(
        cfg: EncoderConfig,
        codec: Arc<dyn BlockCodec>,
        filter: Option<Arc<dyn FilterParams>>,
    ) -> Result<Encoder> {
        cfg.validate()?;
        if cfg.filter && filter.is_none() {
            return Err(EncoderError::Config(
                "filter derivation enabled but no FilterParams given".into(),
            ));
        }
        let filter = if cfg.filter { filter } else { None };
        let queue = if cfg.threads > 0 {
            Some(JobQueue::new(cfg.threads))
        } else {
            None
        };
        info!(
            "encoder: {}x{}, qp {}, {} threads, owf {}",
            cfg.width, cfg.height, cfg.qp, cfg.threads, cfg.owf
        );
        Ok(Encoder {
            cfg,
            codec,
            filter,
            queue,
            ring: VecDeque::new(),
            next_index: 0,
            finished: false,
        })
    }

    /// Encoder over the built-in demo codec and filter.
    pub fn with_demo_codec(mut cfg: EncoderConfig) -> Result<Encoder> {
        let filter: Option<Arc<dyn FilterParams>> = if cfg.filter {
            Some(Arc::new(DemoFilter))
        } else {
            None
        };
        // Normalize so new() sees a consistent pair.
        if filter.is_none() {
            cfg.filter = false;
        }
        Encoder::new(cfg, Arc::new(DemoCodec), filter)
    }

    fn slice_type_for(&self, index: u64) -> SliceType {
        let intra = if self.cfg.intra_period == 0 {
            index == 0
        } else {
            index % self.cfg.intra_period as u64 == 0
        };
        if intra { SliceType::I } else { SliceType::P }
    }

    /// Accepts one frame. Returns the oldest finished frame once the
    /// pipelining window is full, `None` while it is filling.
    pub fn encode_frame(&mut self, source: SourceFrame) -> Result<Option<FrameOutput>> {
        if self.finished {
            return Err(EncoderError::InvalidOperation(
                "encode_frame after finish".into(),
            ));
        }
        if source.width != self.cfg.width || source.height != self.cfg.height {
            return Err(EncoderError::InvalidArg(format!(
                "frame is {}x{}, encoder is {}x{}",
                source.width, source.height, self.cfg.width, self.cfg.height
            )));
        }

        let index = self.next_index;
        self.next_index += 1;
        let slice_type = self.slice_type_for(index);
        let state = Arc::new(FrameState::new(&self.cfg, index, slice_type, source));

        let ref_index = index.checked_sub(self.cfg.ref_distance as u64);
        let ref_slot = ref_index.and_then(|ri| self.ring.iter().find(|s| s.state.index == ri));

        if let Some(queue) = &self.queue {
            let jobs = build_frame_graph(
                queue,
                &state,
                ref_slot.map(|s| &s.state),
                ref_slot.and_then(|s| s.jobs.as_ref()),
                &self.codec,
                self.filter.as_ref(),
            );
            self.ring.push_back(PipelineSlot {
                state,
                jobs: Some(jobs),
                harvested: false,
            });
        } else {
            encode_frame_serial(
                &state,
                ref_slot.map(|s| s.state.as_ref()),
                self.codec.as_ref(),
                self.filter.as_deref(),
            );
            self.ring.push_back(PipelineSlot {
                state,
                jobs: None,
                harvested: false,
            });
        }

        let in_flight = self.ring.iter().filter(|s| !s.harvested).count();
        let output = if in_flight > self.cfg.owf as usize || self.queue.is_none() {
            Some(self.harvest_oldest())
        } else {
            None
        };
        self.trim_ring();
        Ok(output)
    }

    /// Drains every in-flight frame, in order. The encoder only accepts a
    /// new sequence after being rebuilt.
    pub fn finish(&mut self) -> Result<Vec<FrameOutput>> {
        if self.finished {
            return Err(EncoderError::InvalidOperation("finish called twice".into()));
        }
        self.finished = true;
        let mut outputs = Vec::new();
        while self.ring.iter().any(|s| !s.harvested) {
            outputs.push(self.harvest_oldest());
        }
        self.ring.clear();
        Ok(outputs)
    }

    fn harvest_oldest(&mut self) -> FrameOutput {
        let slot = self
            .ring
            .iter_mut()
            .find(|s| !s.harvested)
            .expect("harvest_oldest on an empty pipeline");
        if let (Some(queue), Some(jobs)) = (&self.queue, &slot.jobs) {
            queue.wait_for(&jobs.bitstream_written);
        }
        slot.harvested = true;

        let state = &slot.state;
        let substreams = state.harvest_substreams();
        let stats = state.stats.lock().unwrap();
        let output = FrameOutput {
            index: state.index,
            slice_type: state.slice_type,
            substreams,
            bits_coded: stats.bits_coded,
            skipped_blocks: stats.skipped_blocks,
        };
        info!(
            "frame {} ({:?}): {} substreams, {} bits, {} skipped",
            output.index,
            output.slice_type,
            output.substreams.len(),
            output.bits_coded,
            output.skipped_blocks
        );
        output
    }

    /// Drops ring entries that are harvested and can no longer serve as a
    /// reference for any frame still to come.
    fn trim_ring(&mut self) {
        let keep_from = self.next_index.saturating_sub(self.cfg.ref_distance as u64);
        while let Some(front) = self.ring.front() {
            if front.harvested && front.state.index < keep_from {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EncoderConfig {
        EncoderConfig {
            width: 128,
            height: 64,
            ..EncoderConfig::default()
        }
    }

    fn noise(cfg: &EncoderConfig, seed: u32) -> SourceFrame {
        let n = (cfg.width * cfg.height) as usize;
        let pixels = (0..n).map(|i| ((i as u32).wrapping_mul(2654435761) ^ seed) as u8).collect();
        SourceFrame::new(cfg.width, cfg.height, pixels).unwrap()
    }

    #[test]
    fn test_serial_two_frames() {
        let cfg = cfg();
        let mut enc = Encoder::with_demo_codec(cfg.clone()).unwrap();
        let first = enc.encode_frame(noise(&cfg, 1)).unwrap().unwrap();
        let second = enc.encode_frame(noise(&cfg, 2)).unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.slice_type, SliceType::I);
        assert_eq!(second.slice_type, SliceType::P);
        assert!(first.bits_coded > 0);
        assert!(enc.finish().unwrap().is_empty());
    }

    #[test]
    fn test_encode_after_finish_rejected() {
        let cfg = cfg();
        let mut enc = Encoder::with_demo_codec(cfg.clone()).unwrap();
        enc.finish().unwrap();
        assert!(matches!(
            enc.encode_frame(noise(&cfg, 1)),
            Err(EncoderError::InvalidOperation(_))
        ));
        assert!(enc.finish().is_err());
    }

    #[test]
    fn test_wrong_frame_size_rejected() {
        let mut enc = Encoder::with_demo_codec(cfg()).unwrap();
        let small = SourceFrame::new(64, 64, vec![0; 64 * 64]).unwrap();
        assert!(matches!(
            enc.encode_frame(small),
            Err(EncoderError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_payload_layout() {
        let output = FrameOutput {
            index: 3,
            slice_type: SliceType::P,
            substreams: vec![vec![0xAA, 0xBB], vec![0xCC]],
            bits_coded: 24,
            skipped_blocks: 0,
        };
        let mut buf = Vec::new();
        output.write_payload(&mut buf).unwrap();

        let body_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, buf.len() - 4);
        assert_eq!(&buf[4..8], &[0, 0, 0, 3]);
        assert_eq!(buf[8], b'P');
        assert_eq!(&buf[9..11], &[0, 2]);
        assert_eq!(u32::from_be_bytes(buf[11..15].try_into().unwrap()), 2);
        assert_eq!(&buf[15..17], &[0xAA, 0xBB]);
    }
}
