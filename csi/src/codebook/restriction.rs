//! Codebook Subset Restriction
//!
//! Interpretation of the restriction bit vectors. Bit vectors are `Vec<bool>` indexed by
//! bit number, least significant first.
//! Based on 3GPP TS 38.214 Sections 5.2.2.2.1, 5.2.2.2.3 and 5.2.2.2.5

use super::beams::BeamGrid;
use crate::config::PanelDims;
use common::utils::n_choose_k;

/// Number of beam groups named by the Type II restriction
pub const RESTRICTED_GROUPS: usize = 4;

/// Maximum amplitudes selectable by the B2 bit pairs
pub const MAX_AMPLITUDES: [f64; 4] = [0.0, 0.5, std::f64::consts::FRAC_1_SQRT_2, 1.0];

/// Beam bitmap of the Type I codebooks
#[derive(Debug, Clone, Copy)]
pub struct BeamBitmap<'a> {
    grid: BeamGrid,
    bits: Option<&'a [bool]>,
}

impl<'a> BeamBitmap<'a> {
    pub fn new(grid: BeamGrid, bits: Option<&'a [bool]>) -> Self {
        Self { grid, bits }
    }

    /// Whether beam v(l, m) may be used
    pub fn allows(&self, l: usize, m: usize) -> bool {
        match self.bits {
            Some(bits) => bits
                .get(self.grid.bitmap_index(l, m))
                .copied()
                .unwrap_or(false),
            None => true,
        }
    }

    /// Whether every listed beam may be used
    pub fn allows_all(&self, beams: &[(usize, usize)]) -> bool {
        beams.iter().all(|&(l, m)| self.allows(l, m))
    }
}

/// Whether bit `idx` of an optional bitmap is set, unrestricted when absent
pub fn bit_enabled(bits: Option<&[bool]>, idx: usize) -> bool {
    bits.map(|b| b.get(idx).copied().unwrap_or(false)).unwrap_or(true)
}

/// Length of the Type II and enhanced Type II restriction vector
pub fn beam_group_restriction_len(panel: &PanelDims) -> usize {
    let b1 = if panel.n2 > 1 { 11 } else { 0 };
    b1 + RESTRICTED_GROUPS * 2 * panel.elements()
}

/// Combinatorial code of a sorted index set drawn from 0..n
///
/// Sum over i of C(n - 1 - s_i, k - i) for the sorted elements s_i.
pub fn encode_combinatorial(sorted: &[usize], n: usize) -> u64 {
    let k = sorted.len();
    sorted
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            if s + 1 > n {
                0
            } else {
                n_choose_k(n - 1 - s, k - i)
            }
        })
        .sum()
}

/// Inverse of [`encode_combinatorial`]
pub fn decode_combinatorial(mut value: u64, n: usize, k: usize) -> Vec<usize> {
    let mut result = Vec::with_capacity(k);
    let mut next = 0usize;
    for i in 0..k {
        for s in next..n {
            let c = n_choose_k(n - 1 - s, k - i);
            if c <= value {
                value -= c;
                result.push(s);
                next = s + 1;
                break;
            }
        }
    }
    result
}

/// Per-beam amplitude ceilings of the Type II families
#[derive(Debug, Clone)]
pub struct AmplitudeRestriction {
    grid: BeamGrid,
    /// Ceiling per beam, indexed by [`BeamGrid::bitmap_index`]
    caps: Vec<f64>,
}

impl AmplitudeRestriction {
    /// Decode B1 and the four B2 blocks
    ///
    /// Beam group G(r1, r2) holds v(N1 r1 + x1, N2 r2 + x2). Beams of groups that B1 does
    /// not name are unrestricted.
    pub fn new(panel: &PanelDims, bits: Option<&[bool]>) -> Self {
        let grid = BeamGrid::new(panel);
        let mut caps = vec![1.0; grid.beams1() * grid.beams2()];
        let bits = match bits {
            Some(bits) => bits,
            None => return Self { grid, caps },
        };

        let (groups, b2_offset): (Vec<(usize, usize)>, usize) = if grid.n2 > 1 {
            let beta1 = bits
                .iter()
                .take(11)
                .enumerate()
                .filter(|(_, &b)| b)
                .map(|(k, _)| 1u64 << k)
                .sum();
            let groups = decode_combinatorial(beta1, grid.o1 * grid.o2, RESTRICTED_GROUPS)
                .into_iter()
                .map(|s| (s % grid.o1, s / grid.o1))
                .collect();
            (groups, 11)
        } else {
            ((0..RESTRICTED_GROUPS).map(|r1| (r1, 0)).collect(), 0)
        };

        let block = 2 * grid.elements();
        for (k, &(r1, r2)) in groups.iter().enumerate() {
            for x2 in 0..grid.n2 {
                for x1 in 0..grid.n1 {
                    let x = grid.n1 * x2 + x1;
                    let base = b2_offset + k * block + 2 * x;
                    let low = bits.get(base).copied().unwrap_or(true) as usize;
                    let high = bits.get(base + 1).copied().unwrap_or(true) as usize;
                    let l = grid.n1 * r1 + x1;
                    let m = grid.n2 * r2 + x2;
                    caps[grid.bitmap_index(l, m)] = MAX_AMPLITUDES[2 * high + low];
                }
            }
        }
        Self { grid, caps }
    }

    /// Amplitude ceiling of beam v(m1, m2)
    pub fn max_amplitude(&self, m1: usize, m2: usize) -> f64 {
        self.caps[self.grid.bitmap_index(m1, m2)]
    }
}
