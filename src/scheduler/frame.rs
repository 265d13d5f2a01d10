// src/scheduler/frame.rs

//! Per-frame encoding state and job-graph construction.
//!
//! Each frame gets two jobs per block under wavefront (reconstruction, then
//! bitstream emission) or per-tile jobs otherwise, wired so that the emitted
//! byte order is fixed by the graph alone: emission within a substream is
//! chained left-to-right, rows hand their adapted contexts downward, and
//! cross-frame edges keep a block's search behind the reference blocks it
//! can read. When filter derivation is on, the reconstruction pass also runs
//! a counting emission to warm the contexts, a frame-wide filter job derives
//! the parameters and resets every substream, and only then does the real
//! emission run.
//!
//! The same worker functions back the fully serial path, so a zero-thread
//! encode is byte-identical to any pool size.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::codec::{BlockCodec, BlockResult, FilterOffsets, FilterParams, NeighborRecon, SourceFrame};
use crate::config::{EncoderConfig, SliceType};
use crate::scheduler::job::{add_dependency, Job, JobHandle};
use crate::scheduler::queue::JobQueue;
use crate::state::node::{BlockId, BlockInfo, StateTree};
use crate::state::substream::Substream;
use crate::utils::exclusive::ExclusiveCell;

/// Rate bookkeeping, the only shared mutable state outside the job queue.
#[derive(Debug)]
pub struct FrameStats {
    pub bits_coded: u64,
    pub skipped_blocks: u32,
    pub block_bits: Vec<u32>,
}

impl FrameStats {
    fn new(blocks: usize) -> Self {
        FrameStats {
            bits_coded: 0,
            skipped_blocks: 0,
            block_bits: vec![0; blocks],
        }
    }
}

/// Everything the jobs of one frame read and write. Shared as an `Arc`; all
/// interior mutability is serialized by the graph (cells) or a mutex (stats).
pub struct FrameState {
    pub index: u64,
    pub slice_type: SliceType,
    pub qp: u8,
    pub cfg: EncoderConfig,
    pub tree: StateTree,
    pub source: SourceFrame,
    pub block_results: Vec<ExclusiveCell<Option<BlockResult>>>,
    /// One per leaf, in leaf order.
    pub substreams: Vec<ExclusiveCell<Substream>>,
    pub filter: ExclusiveCell<Option<FilterOffsets>>,
    pub stats: Mutex<FrameStats>,
}

impl FrameState {
    pub fn new(cfg: &EncoderConfig, index: u64, slice_type: SliceType, source: SourceFrame) -> FrameState {
        let tree = StateTree::build(cfg);
        let block_results = (0..tree.blocks.len()).map(|_| ExclusiveCell::new(None)).collect();
        let substreams = (0..tree.leaves.len())
            .map(|_| ExclusiveCell::new(Substream::new(slice_type, cfg.qp)))
            .collect();
        let blocks = tree.blocks.len();
        FrameState {
            index,
            slice_type,
            qp: cfg.qp,
            cfg: cfg.clone(),
            tree,
            source,
            block_results,
            substreams,
            filter: ExclusiveCell::new(None),
            stats: Mutex::new(FrameStats::new(blocks)),
        }
    }

    /// Gathers the per-block reconstructions into one frame buffer. Only
    /// valid once every block's search has completed.
    pub fn assemble_recon(&self) -> Vec<u8> {
        let w = self.source.width as usize;
        let mut out = vec![0u8; w * self.source.height as usize];
        for block in &self.tree.blocks {
            if let Some(result) = self.block_results[block.id.0].peek().as_ref() {
                let bw = block.width as usize;
                for y in 0..block.height as usize {
                    let dst = (block.px_y as usize + y) * w + block.px_x as usize;
                    out[dst..dst + bw].copy_from_slice(&result.recon[y * bw..y * bw + bw]);
                }
            }
        }
        out
    }

    /// Takes the finished substream bytes in leaf order.
    pub fn harvest_substreams(&self) -> Vec<Vec<u8>> {
        self.substreams.iter().map(|cell| cell.with(|sub| sub.take_bytes())).collect()
    }
}

/// Handles to one frame's jobs, kept for cross-frame edges and for waiting on
/// the frame. Dropping this releases the graph's references.
pub struct FrameJobs {
    /// Per-block handles under wavefront, empty under tile jobs.
    pub recon_jobs: Vec<Option<JobHandle>>,
    pub bitstream_jobs: Vec<Option<JobHandle>>,
    /// Proxy for each leaf's completed emission (the last bitstream job).
    pub row_done: Vec<JobHandle>,
    /// All reconstruction finished; cross-frame anchor for tile jobs.
    pub recon_done: Option<JobHandle>,
    /// Every substream of the frame fully emitted.
    pub bitstream_written: JobHandle,
}

fn worker_search_block(
    state: &FrameState,
    ref_state: Option<&FrameState>,
    codec: &dyn BlockCodec,
    id: BlockId,
    simulate: bool,
) {
    let block = state.tree.block(id);
    let left = block.left.and_then(|b| state.block_results[b.0].peek().as_ref());
    let above = block.above.and_then(|b| state.block_results[b.0].peek().as_ref());
    let colocated = if state.slice_type.is_intra() {
        None
    } else {
        ref_state.and_then(|r| r.block_results[id.0].peek().as_ref())
    };
    let neighbors = NeighborRecon { left, above, colocated };
    let result = codec.search(&state.source, block, neighbors, state.slice_type, state.qp);
    state.block_results[id.0].with(|slot| *slot = Some(result));

    if simulate {
        // Counting emission warms the contexts for the blocks after this
        // one; the filter job discards the counted stream.
        state.substreams[block.leaf_ordinal].with(|sub| sub.cabac.set_only_count(true));
        worker_emit_block(state, codec, id);
    }
}

fn worker_emit_block(state: &FrameState, codec: &dyn BlockCodec, id: BlockId) {
    let block = state.tree.block(id);
    let result = state.block_results[id.0]
        .peek()
        .as_ref()
        .expect("bitstream job ran before the block search");
    let filter = *state.filter.peek();

    let next_row = if block.index_in_leaf == 0 {
        state.tree.row_below(block.leaf)
    } else {
        None
    };

    let (bits, handoff) = state.substreams[block.leaf_ordinal].with(|sub| {
        sub.cabac.set_update(true);
        let before = sub.cabac.sink().tell();

        codec.emit(block, result, filter, state.slice_type, sub);

        let end_of_tile = block.last_column && block.last_row;
        let end_of_row = state.cfg.wavefront && block.last_column;
        if end_of_tile || end_of_row {
            sub.terminate();
        }
        sub.cabac.set_update(false);

        let handoff = next_row.map(|_| sub.contexts.clone());
        (sub.cabac.sink().tell() - before, handoff)
    });

    // The first block of a wavefront row seeds the row below with its
    // adapted contexts. The row below cannot have coded a bin yet: its
    // first bitstream job waits on this one through the above-edge.
    if let (Some(row), Some(contexts)) = (next_row, handoff) {
        let ordinal = state.tree.node(row).leaf_ordinal.unwrap_or(0);
        state.substreams[ordinal].with(|sub| sub.contexts = contexts);
    }

    let mut stats = state.stats.lock().unwrap();
    stats.bits_coded += bits;
    stats.block_bits[id.0] = bits as u32;
    if result.skipped {
        stats.skipped_blocks += 1;
    }
}

fn worker_filter_frame(state: &FrameState, filter: &dyn FilterParams) {
    let recon = state.assemble_recon();
    let params = filter.derive(state.source.width, state.source.height, &recon);
    state.filter.with(|slot| *slot = Some(params));

    // The counting pass is over; every substream restarts clean so the real
    // emission is a pure function of the final parameters.
    for cell in &state.substreams {
        cell.with(|sub| sub.reset_after_simulation(state.slice_type, state.qp));
    }
    *state.stats.lock().unwrap() = FrameStats::new(state.tree.blocks.len());

    debug!("frame {}: filter params {:?}", state.index, params);
}

/// Reference block whose reconstruction must exist before `block` may
/// search: `down` rows below, then `right + 1` columns over, clipped to the
/// region.
fn cross_frame_dep(tree: &StateTree, block: &BlockInfo, down: u32, right: u32) -> BlockId {
    let mut dep = block;
    for _ in 0..down {
        match dep.below {
            Some(b) => dep = tree.block(b),
            None => break,
        }
    }
    for _ in 0..right + 1 {
        match dep.right {
            Some(b) => dep = tree.block(b),
            None => break,
        }
    }
    dep.id
}

/// Builds and submits the whole job graph of one frame.
pub fn build_frame_graph(
    queue: &JobQueue,
    state: &Arc<FrameState>,
    ref_state: Option<&Arc<FrameState>>,
    ref_jobs: Option<&FrameJobs>,
    codec: &Arc<dyn BlockCodec>,
    filter: Option<&Arc<dyn FilterParams>>,
) -> FrameJobs {
    if state.cfg.wavefront {
        build_wavefront_graph(queue, state, ref_state, ref_jobs, codec, filter)
    } else {
        build_tile_graph(queue, state, ref_state, ref_jobs, codec, filter)
    }
}

fn build_wavefront_graph(
    queue: &JobQueue,
    state: &Arc<FrameState>,
    ref_state: Option<&Arc<FrameState>>,
    ref_jobs: Option<&FrameJobs>,
    codec: &Arc<dyn BlockCodec>,
    filter: Option<&Arc<dyn FilterParams>>,
) -> FrameJobs {
    let blocks = state.tree.blocks.len();
    let mut recon_jobs: Vec<Option<JobHandle>> = vec![None; blocks];
    let mut bitstream_jobs: Vec<Option<JobHandle>> = vec![None; blocks];
    let mut row_done = Vec::with_capacity(state.tree.leaves.len());

    let filter_job = filter.map(|f| {
        let state = Arc::clone(state);
        let f = Arc::clone(f);
        Job::create(move || worker_filter_frame(&state, f.as_ref()))
    });
    let simulate = filter_job.is_some();

    for &leaf in &state.tree.leaves {
        let leaf_blocks = state.tree.node(leaf).blocks.clone();
        for (i, &id) in leaf_blocks.iter().enumerate() {
            let block = state.tree.block(id);

            let bitstream_job = {
                let state = Arc::clone(state);
                let codec = Arc::clone(codec);
                Job::create(move || worker_emit_block(&state, codec.as_ref(), id))
            };
            let recon_job = {
                let state = Arc::clone(state);
                let ref_state = ref_state.cloned();
                let codec = Arc::clone(codec);
                Job::create(move || {
                    worker_search_block(&state, ref_state.as_deref(), codec.as_ref(), id, simulate)
                })
            };

            // Reference pixels this block may read must be reconstructed.
            if !state.slice_type.is_intra() {
                if let Some(jobs) = ref_jobs {
                    let dep =
                        cross_frame_dep(&state.tree, block, state.cfg.ref_margin_down, state.cfg.ref_margin_right);
                    if let Some(pred) = jobs.recon_jobs.get(dep.0).and_then(|j| j.as_ref()) {
                        add_dependency(&recon_job, pred);
                    }
                }
            }

            if let Some(fj) = &filter_job {
                // Counting emission runs inside the search jobs, so they
                // chain like the bitstream jobs do.
                if let Some(left) = block.left {
                    add_dependency(&recon_job, recon_jobs[left.0].as_ref().unwrap());
                    add_dependency(&bitstream_job, bitstream_jobs[left.0].as_ref().unwrap());
                }
                if let Some(above) = block.above {
                    add_dependency(&recon_job, recon_jobs[above.0].as_ref().unwrap());
                    add_dependency(&bitstream_job, bitstream_jobs[above.0].as_ref().unwrap());
                }
                queue.submit(&recon_job);
                add_dependency(fj, &recon_job);
                add_dependency(&bitstream_job, fj);
            } else {
                if let Some(left) = block.left {
                    add_dependency(&recon_job, bitstream_jobs[left.0].as_ref().unwrap());
                }
                if let Some(above) = block.above {
                    add_dependency(&recon_job, bitstream_jobs[above.0].as_ref().unwrap());
                }
                queue.submit(&recon_job);
                add_dependency(&bitstream_job, &recon_job);
            }
            queue.submit(&bitstream_job);

            if i + 1 == leaf_blocks.len() {
                row_done.push(bitstream_job.copy_ref());
            }
            recon_jobs[id.0] = Some(recon_job);
            bitstream_jobs[id.0] = Some(bitstream_job);
        }
    }

    if let Some(fj) = &filter_job {
        queue.submit(fj);
    }

    let bitstream_written = Job::create(|| {});
    for job in &row_done {
        add_dependency(&bitstream_written, job);
    }
    queue.submit(&bitstream_written);

    debug!(
        "frame {}: wavefront graph, {} rows, {} blocks",
        state.index,
        state.tree.leaves.len(),
        blocks
    );

    FrameJobs {
        recon_jobs,
        bitstream_jobs,
        row_done,
        recon_done: None,
        bitstream_written,
    }
}

fn build_tile_graph(
    queue: &JobQueue,
    state: &Arc<FrameState>,
    ref_state: Option<&Arc<FrameState>>,
    ref_jobs: Option<&FrameJobs>,
    codec: &Arc<dyn BlockCodec>,
    filter: Option<&Arc<dyn FilterParams>>,
) -> FrameJobs {
    let mut row_done = Vec::with_capacity(state.tree.leaves.len());
    let mut leaf_recon_jobs = Vec::with_capacity(state.tree.leaves.len());

    let filter_job = filter.map(|f| {
        let state = Arc::clone(state);
        let f = Arc::clone(f);
        Job::create(move || worker_filter_frame(&state, f.as_ref()))
    });

    for &leaf in &state.tree.leaves {
        let leaf_blocks = state.tree.node(leaf).blocks.clone();

        if let Some(fj) = &filter_job {
            let recon_job = {
                let state = Arc::clone(state);
                let ref_state = ref_state.cloned();
                let codec = Arc::clone(codec);
                let ids = leaf_blocks.clone();
                Job::create(move || {
                    for &id in &ids {
                        worker_search_block(&state, ref_state.as_deref(), codec.as_ref(), id, true);
                    }
                })
            };
            let bitstream_job = {
                let state = Arc::clone(state);
                let codec = Arc::clone(codec);
                let ids = leaf_blocks;
                Job::create(move || {
                    for &id in &ids {
                        worker_emit_block(&state, codec.as_ref(), id);
                    }
                })
            };

            if !state.slice_type.is_intra() {
                if let Some(pred) = ref_jobs.and_then(|j| j.recon_done.as_ref()) {
                    add_dependency(&recon_job, pred);
                }
            }
            queue.submit(&recon_job);
            add_dependency(fj, &recon_job);
            add_dependency(&bitstream_job, fj);
            queue.submit(&bitstream_job);

            row_done.push(bitstream_job);
            leaf_recon_jobs.push(recon_job);
        } else {
            let combined_job = {
                let state = Arc::clone(state);
                let ref_state = ref_state.cloned();
                let codec = Arc::clone(codec);
                let ids = leaf_blocks;
                Job::create(move || {
                    for &id in &ids {
                        worker_search_block(&state, ref_state.as_deref(), codec.as_ref(), id, false);
                        worker_emit_block(&state, codec.as_ref(), id);
                    }
                })
            };
            if !state.slice_type.is_intra() {
                if let Some(pred) = ref_jobs.and_then(|j| j.recon_done.as_ref()) {
                    add_dependency(&combined_job, pred);
                }
            }
            queue.submit(&combined_job);
            leaf_recon_jobs.push(combined_job.copy_ref());
            row_done.push(combined_job);
        }
    }

    if let Some(fj) = &filter_job {
        queue.submit(fj);
    }

    let recon_done = Job::create(|| {});
    for job in &leaf_recon_jobs {
        add_dependency(&recon_done, job);
    }
    queue.submit(&recon_done);

    let bitstream_written = Job::create(|| {});
    for job in &row_done {
        add_dependency(&bitstream_written, job);
    }
    queue.submit(&bitstream_written);

    debug!(
        "frame {}: tile graph, {} leaves",
        state.index,
        state.tree.leaves.len()
    );

    FrameJobs {
        recon_jobs: Vec::new(),
        bitstream_jobs: Vec::new(),
        row_done,
        recon_done: Some(recon_done),
        bitstream_written,
    }
}

/// The zero-thread path: same workers, same order, no queue.
pub fn encode_frame_serial(
    state: &FrameState,
    ref_state: Option<&FrameState>,
    codec: &dyn BlockCodec,
    filter: Option<&dyn FilterParams>,
) {
    let simulate = filter.is_some();
    for &leaf in &state.tree.leaves {
        for &id in &state.tree.node(leaf).blocks {
            worker_search_block(state, ref_state, codec, id, simulate);
            if !simulate {
                worker_emit_block(state, codec, id);
            }
        }
    }
    if let Some(f) = filter {
        worker_filter_frame(state, f);
        for &leaf in &state.tree.leaves {
            for &id in &state.tree.node(leaf).blocks {
                worker_emit_block(state, codec, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DemoCodec, DemoFilter};

    fn source(cfg: &EncoderConfig, seed: u64) -> SourceFrame {
        let n = (cfg.width * cfg.height) as usize;
        let mut x = seed | 1;
        let pixels = (0..n)
            .map(|_| {
                // xorshift, good enough for pixel fill
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect();
        SourceFrame::new(cfg.width, cfg.height, pixels).unwrap()
    }

    #[test]
    fn test_serial_wavefront_emits_one_substream_per_row() {
        let cfg = EncoderConfig {
            width: 256,
            height: 192,
            wavefront: true,
            ..EncoderConfig::default()
        };
        let state = FrameState::new(&cfg, 0, SliceType::I, source(&cfg, 7));
        encode_frame_serial(&state, None, &DemoCodec, None);
        let streams = state.harvest_substreams();
        assert_eq!(streams.len(), 3);
        for s in &streams {
            assert!(!s.is_empty());
        }
        assert!(state.stats.lock().unwrap().bits_coded > 0);
    }

    #[test]
    fn test_counting_warmup_equals_clean_encode_with_final_params() {
        // The pass after the filter job must be indistinguishable from a
        // fresh encode that knew the filter parameters up front.
        let cfg = EncoderConfig {
            width: 192,
            height: 128,
            filter: true,
            ..EncoderConfig::default()
        };
        let src = source(&cfg, 99);

        let with_warmup = FrameState::new(&cfg, 0, SliceType::I, src.clone());
        encode_frame_serial(&with_warmup, None, &DemoCodec, Some(&DemoFilter));
        let params = (*with_warmup.filter.peek()).unwrap();

        let clean = FrameState::new(&cfg, 0, SliceType::I, src);
        for &leaf in &clean.tree.leaves {
            for &id in &clean.tree.node(leaf).blocks {
                worker_search_block(&clean, None, &DemoCodec, id, false);
            }
        }
        clean.filter.with(|slot| *slot = Some(params));
        for &leaf in &clean.tree.leaves {
            for &id in &clean.tree.node(leaf).blocks {
                worker_emit_block(&clean, &DemoCodec, id);
            }
        }

        assert_eq!(with_warmup.harvest_substreams(), clean.harvest_substreams());
    }

    #[test]
    fn test_cross_frame_dep_walk_clips_at_edges() {
        let cfg = EncoderConfig {
            width: 256,
            height: 128,
            ..EncoderConfig::default()
        };
        let tree = StateTree::build(&cfg);
        // Interior block: one down, one right.
        let dep = cross_frame_dep(&tree, tree.block(BlockId(0)), 1, 0);
        assert_eq!(dep, BlockId(5));
        // Bottom-right corner: nowhere to go.
        let corner = BlockId(tree.blocks.len() - 1);
        assert_eq!(cross_frame_dep(&tree, tree.block(corner), 1, 0), corner);
    }

    #[test]
    fn test_inter_frame_references_previous_recon() {
        let cfg = EncoderConfig {
            width: 128,
            height: 64,
            ..EncoderConfig::default()
        };
        let src = source(&cfg, 3);
        let first = FrameState::new(&cfg, 0, SliceType::I, src.clone());
        encode_frame_serial(&first, None, &DemoCodec, None);

        // Identical source against its own reconstruction: every block skips.
        let second = FrameState::new(&cfg, 1, SliceType::P, src);
        encode_frame_serial(&second, Some(&first), &DemoCodec, None);
        let stats = second.stats.lock().unwrap();
        assert_eq!(stats.skipped_blocks, 2);
        assert!(stats.bits_coded < first.stats.lock().unwrap().bits_coded);
    }
}
