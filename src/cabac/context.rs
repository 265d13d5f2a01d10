// src/cabac/context.rs

//! Adaptive probability contexts for the arithmetic coder.
//!
//! Each context is a 64-state finite state machine plus a most-probable-symbol
//! bit. Regular-bin coding reads the LPS sub-range through the state and then
//! steps the machine through the published transition tables; bypass and
//! terminating bins never touch a context.

use crate::cabac::tables::{LPS_RANGE, NEXT_STATE_LPS, NEXT_STATE_MPS};
use crate::config::SliceType;

/// One adaptive binary probability model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextModel {
    state: u8,
    mps: bool,
}

impl ContextModel {
    /// Initializes the context from a packed slope/offset init value and the
    /// slice QP, using the standard derivation.
    pub fn init(init_value: u8, qp: u8) -> Self {
        let slope = (init_value >> 4) as i32 * 5 - 45;
        let offset = ((init_value & 15) as i32) << 3;
        let init_state = (((slope * qp.min(51) as i32) >> 4) + offset - 16).clamp(1, 126);

        if init_state >= 64 {
            ContextModel {
                state: (init_state - 64) as u8,
                mps: true,
            }
        } else {
            ContextModel {
                state: (63 - init_state) as u8,
                mps: false,
            }
        }
    }

    #[inline]
    pub fn mps(&self) -> bool {
        self.mps
    }

    #[inline]
    pub fn state(&self) -> u8 {
        self.state
    }

    /// LPS sub-range for the current `range`, which must be in [256, 510].
    #[inline]
    pub fn lps_range(&self, range: u32) -> u32 {
        debug_assert!((256..=510).contains(&range));
        LPS_RANGE[self.state as usize][((range >> 6) & 3) as usize] as u32
    }

    /// Steps the state machine after a coded bin.
    #[inline]
    pub fn update(&mut self, bin: bool) {
        if bin == self.mps {
            self.state = NEXT_STATE_MPS[self.state as usize];
        } else {
            if self.state == 0 {
                self.mps = !self.mps;
            }
            self.state = NEXT_STATE_LPS[self.state as usize];
        }
    }
}

// Init values per slice type (I, P, B), packed slope/offset form.
const INIT_SPLIT_FLAG: [[u8; 3]; 3] = [
    [139, 141, 157],
    [107, 139, 126],
    [107, 139, 126],
];
const INIT_SKIP_FLAG: [[u8; 3]; 3] = [
    [154, 154, 154],
    [197, 185, 201],
    [197, 185, 201],
];
const INIT_CBF: [[u8; 2]; 3] = [
    [141, 127],
    [153, 111],
    [153, 111],
];
const INIT_SIG_COEFF: [[u8; 4]; 3] = [
    [111, 111, 125, 110],
    [155, 154, 139, 153],
    [170, 154, 139, 153],
];
const INIT_GREATER_ONE: [[u8; 2]; 3] = [
    [140, 92],
    [121, 140],
    [121, 140],
];
const INIT_LAST_POS: [[u8; 2]; 3] = [
    [110, 110],
    [125, 110],
    [125, 110],
];
const INIT_FILTER_MERGE: [u8; 3] = [153, 153, 153];

/// The full per-substream context table.
///
/// One table is owned by each leaf substream, reseeded from the slice type
/// and QP before any bin is coded, and deep-copied whole for the wavefront
/// row-to-row hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSet {
    pub split_flag: [ContextModel; 3],
    pub skip_flag: [ContextModel; 3],
    pub cbf: [ContextModel; 2],
    pub sig_coeff: [ContextModel; 4],
    pub greater_one: [ContextModel; 2],
    pub last_pos: [ContextModel; 2],
    pub filter_merge: ContextModel,
}

fn init_array<const N: usize>(values: &[u8; N], qp: u8) -> [ContextModel; N] {
    std::array::from_fn(|i| ContextModel::init(values[i], qp))
}

impl ContextSet {
    pub fn new(slice_type: SliceType, qp: u8) -> Self {
        let s = slice_type.index();
        ContextSet {
            split_flag: init_array(&INIT_SPLIT_FLAG[s], qp),
            skip_flag: init_array(&INIT_SKIP_FLAG[s], qp),
            cbf: init_array(&INIT_CBF[s], qp),
            sig_coeff: init_array(&INIT_SIG_COEFF[s], qp),
            greater_one: init_array(&INIT_GREATER_ONE[s], qp),
            last_pos: init_array(&INIT_LAST_POS[s], qp),
            filter_merge: ContextModel::init(INIT_FILTER_MERGE[s], qp),
        }
    }
}
