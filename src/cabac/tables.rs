// src/cabac/tables.rs

//! Published tables for the context-adaptive binary arithmetic coder.
//!
//! These values are fixed by the standard and must be reproduced bit for bit;
//! there is no implementation freedom here.

/// LPS sub-range, indexed by probability state (0..=63) and the two range
/// bucket bits `(range >> 6) & 3`.
pub const LPS_RANGE: [[u8; 4]; 64] = [
    [128, 176, 208, 240], [128, 167, 197, 227], [128, 158, 187, 216], [123, 150, 178, 205],
    [116, 142, 169, 195], [111, 135, 160, 185], [105, 128, 152, 175], [100, 122, 144, 166],
    [95, 116, 137, 158], [90, 110, 130, 150], [85, 104, 123, 142], [81, 99, 117, 135],
    [77, 94, 111, 128], [73, 89, 105, 122], [69, 85, 100, 116], [66, 80, 95, 110],
    [62, 76, 90, 104], [59, 72, 86, 99], [56, 69, 81, 94], [53, 65, 77, 89],
    [51, 62, 73, 85], [48, 59, 69, 80], [46, 56, 66, 76], [43, 53, 63, 72],
    [41, 50, 59, 69], [39, 48, 56, 65], [37, 45, 54, 62], [35, 43, 51, 59],
    [33, 41, 48, 56], [32, 39, 46, 53], [30, 37, 43, 50], [29, 35, 41, 48],
    [27, 33, 39, 45], [26, 31, 37, 43], [24, 30, 35, 41], [23, 28, 33, 39],
    [22, 27, 32, 37], [21, 26, 30, 35], [20, 24, 29, 33], [19, 23, 27, 31],
    [18, 22, 26, 30], [17, 21, 25, 28], [16, 20, 23, 27], [15, 19, 22, 25],
    [14, 18, 21, 24], [14, 17, 20, 23], [13, 16, 19, 22], [12, 15, 18, 21],
    [12, 14, 17, 20], [11, 14, 16, 19], [11, 13, 15, 18], [10, 12, 15, 17],
    [10, 12, 14, 16], [9, 11, 13, 15], [9, 11, 12, 14], [8, 10, 12, 14],
    [8, 9, 11, 13], [7, 9, 11, 12], [7, 9, 10, 12], [7, 8, 10, 11],
    [6, 8, 9, 11], [6, 7, 9, 10], [6, 7, 8, 9], [2, 2, 2, 2],
];

/// Probability state transition when the coded bin matched the MPS.
pub const NEXT_STATE_MPS: [u8; 64] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16,
    17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32,
    33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 62, 63,
];

/// Probability state transition when the coded bin was the LPS. State 0
/// additionally flips the MPS.
pub const NEXT_STATE_LPS: [u8; 64] = [
    0, 0, 1, 2, 2, 4, 4, 5, 6, 7, 8, 9, 9, 11, 11, 12,
    13, 13, 15, 15, 16, 16, 18, 18, 19, 19, 21, 21, 22, 22, 23, 24,
    24, 25, 26, 26, 27, 27, 28, 29, 29, 30, 30, 30, 31, 32, 32, 33,
    33, 33, 34, 34, 35, 35, 35, 36, 36, 36, 37, 37, 37, 38, 38, 63,
];

/// Renormalization shift for an LPS sub-range, indexed by `lps >> 3`.
pub const RENORM_TABLE: [u8; 32] = [
    6, 5, 4, 4, 3, 3, 3, 3, 2, 2, 2, 2, 2, 2, 2, 2,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
];

/// Truncated-binary threshold (floor(log2(n))) for maximum values up to 256.
/// Larger maxima are handled with a loop in the coder.
pub const TB_MAX: [u8; 257] = [
    0, 0, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 8,
];

/// Largest transform dynamic range exponent; bounds the escape suffix of
/// coefficient remainder coding.
pub const MAX_LOG2_TR_DYNAMIC_RANGE: u32 = 15;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lps_range_shape() {
        // Rows shrink monotonically toward certainty, and the terminal state
        // is the constant 2.
        for state in 0..63 {
            for bucket in 0..4 {
                assert!(LPS_RANGE[state][bucket] >= LPS_RANGE[state + 1][bucket]);
            }
        }
        assert_eq!(LPS_RANGE[63], [2, 2, 2, 2]);
    }

    #[test]
    fn test_transitions_in_bounds() {
        for i in 0..64 {
            assert!(NEXT_STATE_MPS[i] <= 63);
            assert!(NEXT_STATE_LPS[i] <= 63);
            assert!(NEXT_STATE_LPS[i] as usize <= i, "LPS never raises confidence");
        }
        assert_eq!(NEXT_STATE_MPS[62], 62);
        assert_eq!(NEXT_STATE_MPS[63], 63);
    }

    #[test]
    fn test_renorm_matches_leading_zeros() {
        // The shift must renormalize any non-terminal LPS range back into
        // [256, 510].
        for state in 0..63 {
            for bucket in 0..4 {
                let lps = LPS_RANGE[state][bucket] as u32;
                let shift = RENORM_TABLE[(lps >> 3) as usize];
                let renormed = lps << shift;
                assert!((256..=510).contains(&renormed), "lps={lps} shift={shift}");
            }
        }
    }

    #[test]
    fn test_tb_max_is_floor_log2() {
        for n in 1..=256usize {
            assert_eq!(TB_MAX[n] as u32, (n as u32).ilog2(), "n={n}");
        }
    }
}
