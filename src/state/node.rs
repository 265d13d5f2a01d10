// src/state/node.rs

//! Per-frame encoder state tree and block geometry.
//!
//! The tree mirrors the region split of a frame: a MAIN root over either a
//! single SLICE, a grid of TILEs, or a SLICE fanning out into one
//! WAVEFRONT_ROW per block row. Nodes live in an arena and point at each
//! other by index, so the tree is plain data with no aliasing to reason
//! about. A node without children is a leaf and owns one substream; its
//! block list is the emission order of that substream.

use crate::config::{EncoderConfig, CTU_WIDTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Main,
    Slice,
    Tile,
    WavefrontRow,
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Blocks of this node's region in raster order. Non-empty for every
    /// node; a leaf's list is its substream emission order.
    pub blocks: Vec<BlockId>,
    /// Index into the substream table, set for leaves only.
    pub leaf_ordinal: Option<usize>,
    /// Block row covered by a WAVEFRONT_ROW node.
    pub row: Option<u32>,
}

impl Node {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Geometry of one coding block.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub id: BlockId,
    /// Position in blocks, frame coordinates.
    pub pos_x: u32,
    pub pos_y: u32,
    /// Position and clipped size in pixels.
    pub px_x: u32,
    pub px_y: u32,
    pub width: u32,
    pub height: u32,
    /// Owning leaf and this block's ordinal within it.
    pub leaf: NodeId,
    pub leaf_ordinal: usize,
    pub index_in_leaf: usize,
    /// Neighbors within the same tile region; wavefront rows share the
    /// whole-frame region, so `above` crosses rows there.
    pub left: Option<BlockId>,
    pub above: Option<BlockId>,
    pub right: Option<BlockId>,
    pub below: Option<BlockId>,
    /// Last block of its row / column within the tile region.
    pub last_column: bool,
    pub last_row: bool,
}

/// Arena tree plus the block table for one frame geometry.
#[derive(Debug)]
pub struct StateTree {
    pub nodes: Vec<Node>,
    pub blocks: Vec<BlockInfo>,
    /// Leaves in substream order (tile raster, or top-to-bottom rows).
    pub leaves: Vec<NodeId>,
}

impl StateTree {
    pub fn build(cfg: &EncoderConfig) -> StateTree {
        let wb = cfg.width_in_blocks();
        let hb = cfg.height_in_blocks();

        let mut tree = StateTree {
            nodes: Vec::new(),
            blocks: Vec::with_capacity((wb * hb) as usize),
            leaves: Vec::new(),
        };
        let main = tree.push_node(NodeKind::Main, None, None);

        // Tile boundaries in blocks; a 1x1 grid degenerates to the frame.
        let col_edge = |i: u32| i * wb / cfg.tiles_w;
        let row_edge = |i: u32| i * hb / cfg.tiles_h;

        // Block table first, in frame raster order so BlockId is y*wb+x and
        // the co-located block of another frame has the same id.
        for y in 0..hb {
            for x in 0..wb {
                let (tx, ty) = if cfg.wavefront {
                    (0, 0)
                } else {
                    (tile_index(x, wb, cfg.tiles_w), tile_index(y, hb, cfg.tiles_h))
                };
                let (x0, x1) = if cfg.wavefront {
                    (0, wb)
                } else {
                    (col_edge(tx), col_edge(tx + 1))
                };
                let (y0, y1) = if cfg.wavefront {
                    (0, hb)
                } else {
                    (row_edge(ty), row_edge(ty + 1))
                };

                let id = BlockId((y * wb + x) as usize);
                let neighbor = |nx: i64, ny: i64| -> Option<BlockId> {
                    if nx < x0 as i64 || nx >= x1 as i64 || ny < y0 as i64 || ny >= y1 as i64 {
                        None
                    } else {
                        Some(BlockId((ny as u32 * wb + nx as u32) as usize))
                    }
                };

                tree.blocks.push(BlockInfo {
                    id,
                    pos_x: x,
                    pos_y: y,
                    px_x: x * CTU_WIDTH,
                    px_y: y * CTU_WIDTH,
                    width: (cfg.width - x * CTU_WIDTH).min(CTU_WIDTH),
                    height: (cfg.height - y * CTU_WIDTH).min(CTU_WIDTH),
                    leaf: NodeId(0), // patched below
                    leaf_ordinal: 0,
                    index_in_leaf: 0,
                    left: neighbor(x as i64 - 1, y as i64),
                    above: neighbor(x as i64, y as i64 - 1),
                    right: neighbor(x as i64 + 1, y as i64),
                    below: neighbor(x as i64, y as i64 + 1),
                    last_column: x + 1 == x1,
                    last_row: y + 1 == y1,
                });
            }
        }

        if cfg.wavefront {
            let slice = tree.push_node(NodeKind::Slice, Some(main), None);
            for row in 0..hb {
                let leaf = tree.push_node(NodeKind::WavefrontRow, Some(slice), Some(row));
                let ids: Vec<BlockId> =
                    (0..wb).map(|x| BlockId((row * wb + x) as usize)).collect();
                tree.seal_leaf(leaf, ids);
            }
            tree.nodes[slice.0].blocks = tree.blocks.iter().map(|b| b.id).collect();
        } else if cfg.tiles_w > 1 || cfg.tiles_h > 1 {
            for ty in 0..cfg.tiles_h {
                for tx in 0..cfg.tiles_w {
                    let leaf = tree.push_node(NodeKind::Tile, Some(main), None);
                    let mut ids = Vec::new();
                    for y in row_edge(ty)..row_edge(ty + 1) {
                        for x in col_edge(tx)..col_edge(tx + 1) {
                            ids.push(BlockId((y * wb + x) as usize));
                        }
                    }
                    tree.seal_leaf(leaf, ids);
                }
            }
        } else {
            let leaf = tree.push_node(NodeKind::Slice, Some(main), None);
            let ids: Vec<BlockId> = tree.blocks.iter().map(|b| b.id).collect();
            tree.seal_leaf(leaf, ids);
        }

        tree.nodes[main.0].blocks = tree.blocks.iter().map(|b| b.id).collect();
        tree
    }

    fn push_node(&mut self, kind: NodeKind, parent: Option<NodeId>, row: Option<u32>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
            blocks: Vec::new(),
            leaf_ordinal: None,
            row,
        });
        if let Some(p) = parent {
            self.nodes[p.0].children.push(id);
        }
        id
    }

    /// Registers `leaf` as a substream owner and patches its blocks' back
    /// references.
    fn seal_leaf(&mut self, leaf: NodeId, blocks: Vec<BlockId>) {
        let ordinal = self.leaves.len();
        self.leaves.push(leaf);
        self.nodes[leaf.0].leaf_ordinal = Some(ordinal);
        for (i, &id) in blocks.iter().enumerate() {
            let block = &mut self.blocks[id.0];
            block.leaf = leaf;
            block.leaf_ordinal = ordinal;
            block.index_in_leaf = i;
        }
        self.nodes[leaf.0].blocks = blocks;
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &BlockInfo {
        &self.blocks[id.0]
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// The wavefront row leaf directly below the given one, if any.
    pub fn row_below(&self, leaf: NodeId) -> Option<NodeId> {
        let node = self.node(leaf);
        if node.kind != NodeKind::WavefrontRow {
            return None;
        }
        let row = node.row?;
        let parent = self.node(node.parent?);
        parent
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).row == Some(row + 1))
    }
}

fn tile_index(coord: u32, extent: u32, tiles: u32) -> u32 {
    // Inverse of the uniform edge split i*extent/tiles.
    let mut t = (coord * tiles) / extent;
    while (t + 1) * extent / tiles <= coord {
        t += 1;
    }
    while t * extent / tiles > coord {
        t -= 1;
    }
    t
}
