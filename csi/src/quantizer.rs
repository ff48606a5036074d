//! Coefficient Quantization
//!
//! Amplitude and phase quantizers of the Type II codebooks, plus the frequency-domain
//! compression and coefficient overhead reduction of the enhanced Type II codebook.
//! Based on 3GPP TS 38.214 Sections 5.2.2.2.3 and 5.2.2.2.5

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::trace;

/// Largest number of PMI subbands searched without a window
pub const MAX_UNWINDOWED_SUBBANDS: usize = 19;

/// Monotone amplitude ladder
#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeLadder {
    /// Ascending amplitude levels
    levels: Vec<f64>,
    /// Reported index of `levels[0]`
    first_index: u32,
}

impl AmplitudeLadder {
    /// Type II wideband amplitudes {0, sqrt(1/64), ..., sqrt(1/2), 1} (Table 5.2.2.2.3-2)
    pub fn type2_wideband() -> Self {
        let mut levels = vec![0.0];
        levels.extend((0..7).map(|k| 2f64.powf(-(6 - k) as f64 / 2.0)));
        Self { levels, first_index: 0 }
    }

    /// Type II subband amplitudes {sqrt(1/2), 1} (Table 5.2.2.2.3-3)
    pub fn type2_subband() -> Self {
        Self {
            levels: vec![std::f64::consts::FRAC_1_SQRT_2, 1.0],
            first_index: 0,
        }
    }

    /// Enhanced Type II reference amplitudes 2^(-(15 - k) / 8), k = 1..15 (Table 5.2.2.2.5-2)
    pub fn etype2_reference() -> Self {
        Self {
            levels: (1..=15).map(|k| 2f64.powf(-(15 - k) as f64 / 8.0)).collect(),
            first_index: 1,
        }
    }

    /// Enhanced Type II differential amplitudes 2^(-(7 - k) / 2), k = 0..7 (Table 5.2.2.2.5-3)
    pub fn etype2_differential() -> Self {
        Self {
            levels: (0..=7).map(|k| 2f64.powf(-(7 - k) as f64 / 2.0)).collect(),
            first_index: 0,
        }
    }

    pub fn max_index(&self) -> u32 {
        self.first_index + self.levels.len() as u32 - 1
    }

    /// Amplitude of a reported index
    pub fn level(&self, index: u32) -> f64 {
        let pos = index.saturating_sub(self.first_index) as usize;
        self.levels[pos.min(self.levels.len() - 1)]
    }

    /// Nearest level in linear amplitude
    pub fn quantize(&self, value: f64) -> u32 {
        self.quantize_capped(value, f64::INFINITY)
    }

    /// Nearest level not above `cap`, the lowest level when every level exceeds it
    pub fn quantize_capped(&self, value: f64, cap: f64) -> u32 {
        let mut best = 0usize;
        let mut best_dist = f64::INFINITY;
        for (pos, &level) in self.levels.iter().enumerate() {
            if level > cap + 1e-12 {
                break;
            }
            let dist = (level - value).abs();
            if dist < best_dist {
                best = pos;
                best_dist = dist;
            }
        }
        self.first_index + best as u32
    }

    /// Gap between the levels surrounding `value`, zero outside the ladder
    pub fn local_step(&self, value: f64) -> f64 {
        self.levels
            .windows(2)
            .find(|w| value >= w[0] && value <= w[1])
            .map(|w| w[1] - w[0])
            .unwrap_or(0.0)
    }
}

/// Nearest of `alphabet` equally spaced phases
pub fn quantize_phase(angle: f64, alphabet: u32) -> u32 {
    let step = 2.0 * PI / alphabet as f64;
    ((angle / step).round() as i64).rem_euclid(alphabet as i64) as u32
}

/// Unit-circle point of a phase index
pub fn phase_point(index: u32, alphabet: u32) -> Complex64 {
    Complex64::from_polar(1.0, 2.0 * PI * index as f64 / alphabet as f64)
}

/// DFT across PMI subbands
#[derive(Clone)]
pub struct FrequencyCompressor {
    n3: usize,
    fft: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for FrequencyCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrequencyCompressor").field("n3", &self.n3).finish()
    }
}

impl FrequencyCompressor {
    pub fn new(n3: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self { n3, fft: planner.plan_fft_forward(n3) }
    }

    pub fn n3(&self) -> usize {
        self.n3
    }

    /// Replace each row by X[f] = sum_t c[t] e^{-j 2 pi t f / N3}
    pub fn transform(&self, rows: &mut [Vec<Complex64>]) {
        for row in rows.iter_mut() {
            self.fft.process(row);
        }
    }

    /// Basis value y_t^(f) = e^{j 2 pi t f / N3}
    pub fn basis(&self, f: usize, t: usize) -> Complex64 {
        Complex64::from_polar(1.0, 2.0 * PI * ((t * f) % self.n3) as f64 / self.n3 as f64)
    }
}

/// Selected DFT bases
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencySelection {
    /// Window start M_initial, only for more than 19 PMI subbands
    pub window_start: Option<i32>,
    /// Sorted bins per layer, bin 0 always first
    pub bins: Vec<Vec<usize>>,
}

/// Bin 0 plus the `m - 1` strongest bins among `candidates`, sorted
fn strongest_bins(power: &[f64], candidates: &[usize], m: usize) -> (Vec<usize>, f64) {
    let mut others: Vec<usize> = candidates.iter().copied().filter(|&f| f != 0).collect();
    others.sort_by(|&a, &b| {
        power[b]
            .partial_cmp(&power[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    let mut bins = vec![0];
    bins.extend(others.into_iter().take(m.saturating_sub(1)));
    bins.sort_unstable();
    let captured = bins.iter().map(|&f| power[f]).sum();
    (bins, captured)
}

/// Select `m` DFT bases per layer from per-layer bin powers
///
/// Bin 0 holds the strongest coefficient and is always kept. Up to 19 subbands any bins
/// may be chosen. Beyond that all layers share a window of 2m bins starting at
/// M_initial in -2m+1..=0, picked for the largest captured power.
pub fn select_frequency_bases(power: &[Vec<f64>], n3: usize, m: usize) -> FrequencySelection {
    let m = m.clamp(1, n3.max(1));
    if n3 <= MAX_UNWINDOWED_SUBBANDS || 2 * m >= n3 {
        let all: Vec<usize> = (0..n3).collect();
        return FrequencySelection {
            window_start: None,
            bins: power.iter().map(|p| strongest_bins(p, &all, m).0).collect(),
        };
    }

    let mut best: Option<(i32, f64, Vec<Vec<usize>>)> = None;
    for start in (1 - 2 * m as i32)..=0 {
        let window: Vec<usize> = (0..2 * m as i32)
            .map(|i| (start + i).rem_euclid(n3 as i32) as usize)
            .collect();
        let picks: Vec<(Vec<usize>, f64)> = power.iter().map(|p| strongest_bins(p, &window, m)).collect();
        let total: f64 = picks.iter().map(|(_, c)| c).sum();
        if best.as_ref().map_or(true, |(_, t, _)| total > *t) {
            best = Some((start, total, picks.into_iter().map(|(b, _)| b).collect()));
        }
    }
    let (start, total, bins) = best.unwrap_or((0, 0.0, vec![vec![0]; power.len()]));
    trace!("Frequency window start {} captures power {:.4}", start, total);
    FrequencySelection { window_start: Some(start), bins }
}

/// Keep at most `k0` coefficients per layer and `2 k0` overall
///
/// Coefficients are kept strongest first. The strongest coefficient of each layer is
/// always kept and zero coefficients never are.
pub fn reduce_overhead(magnitudes: &[Vec<f64>], strongest: &[usize], k0: usize) -> Vec<Vec<bool>> {
    let mut masks: Vec<Vec<bool>> = magnitudes.iter().map(|m| vec![false; m.len()]).collect();
    let mut pool: Vec<(usize, usize, f64)> = Vec::new();

    for (layer, mags) in magnitudes.iter().enumerate() {
        let forced = strongest.get(layer).copied();
        if let Some(s) = forced {
            if s < mags.len() {
                masks[layer][s] = true;
            }
        }
        let mut order: Vec<usize> = (0..mags.len())
            .filter(|&i| Some(i) != forced && mags[i] > 0.0)
            .collect();
        order.sort_by(|&a, &b| {
            mags[b]
                .partial_cmp(&mags[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        pool.extend(
            order
                .into_iter()
                .take(k0.saturating_sub(1))
                .map(|i| (layer, i, mags[i])),
        );
    }

    let forced_total = masks.iter().flatten().filter(|&&b| b).count();
    pool.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then((a.0, a.1).cmp(&(b.0, b.1)))
    });
    for (layer, idx, _) in pool.into_iter().take((2 * k0).saturating_sub(forced_total)) {
        masks[layer][idx] = true;
    }
    masks
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ladders() {
        let wb = AmplitudeLadder::type2_wideband();
        assert_eq!(wb.max_index(), 7);
        assert_relative_eq!(wb.level(1), 0.125, epsilon = 1e-12);
        assert_relative_eq!(wb.level(6), std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-12);

        let reference = AmplitudeLadder::etype2_reference();
        assert_eq!(reference.max_index(), 15);
        assert_relative_eq!(reference.level(1), (1.0f64 / 128.0).powf(0.25), epsilon = 1e-12);
        assert_relative_eq!(reference.level(15), 1.0, epsilon = 1e-12);

        let diff = AmplitudeLadder::etype2_differential();
        assert_relative_eq!(diff.level(0), 1.0 / (8.0 * 2f64.sqrt()), epsilon = 1e-12);
    }

    #[test]
    fn test_amplitude_round_trip_within_half_step() {
        for ladder in [
            AmplitudeLadder::type2_wideband(),
            AmplitudeLadder::type2_subband(),
            AmplitudeLadder::etype2_reference(),
            AmplitudeLadder::etype2_differential(),
        ] {
            let low = ladder.level(ladder.first_index);
            for step in 0..=1000 {
                let value = low + (1.0 - low) * step as f64 / 1000.0;
                let error = (ladder.level(ladder.quantize(value)) - value).abs();
                assert!(error <= 0.5 * ladder.local_step(value) + 1e-12, "{} -> {}", value, error);
            }
        }
    }

    #[test]
    fn test_amplitude_cap() {
        let wb = AmplitudeLadder::type2_wideband();
        assert_eq!(wb.quantize(0.9), 7);
        assert_eq!(wb.quantize_capped(0.9, 0.5), 5);
        assert_eq!(wb.quantize_capped(0.9, 0.0), 0);
    }

    #[test]
    fn test_phase_quantizer() {
        assert_eq!(quantize_phase(0.0, 8), 0);
        assert_eq!(quantize_phase(PI / 2.0, 4), 1);
        assert_eq!(quantize_phase(-PI / 2.0, 4), 3);
        assert_eq!(quantize_phase(2.0 * PI - 0.01, 16), 0);
        assert_relative_eq!((phase_point(2, 8) - Complex64::new(0.0, 1.0)).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_matches_dft() {
        let compressor = FrequencyCompressor::new(4);
        let row: Vec<Complex64> = (0..4).map(|t| compressor.basis(1, t)).collect();
        let mut rows = vec![row];
        compressor.transform(&mut rows);
        // A pure basis vector y^(1) lands entirely in bin 1
        assert_relative_eq!(rows[0][1].norm(), 4.0, epsilon = 1e-9);
        assert_relative_eq!(rows[0][0].norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(rows[0][3].norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_unwindowed_selection() {
        let power = vec![vec![5.0, 0.1, 3.0, 0.2, 4.0]];
        let selection = select_frequency_bases(&power, 5, 3);
        assert_eq!(selection.window_start, None);
        assert_eq!(selection.bins, vec![vec![0, 2, 4]]);
    }

    #[test]
    fn test_windowed_selection() {
        let n3 = 24;
        let mut power = vec![0.0; n3];
        power[0] = 10.0;
        power[22] = 3.0;
        power[23] = 2.0;
        power[5] = 9.0;
        let selection = select_frequency_bases(&[power], n3, 2);
        // Window of 4 bins starting at -3..=0 cannot reach bin 5
        assert_eq!(selection.window_start, Some(-3));
        assert_eq!(selection.bins, vec![vec![0, 22]]);
    }

    #[test]
    fn test_overhead_reduction() {
        let mags = vec![vec![1.0, 0.9, 0.8, 0.0], vec![1.0, 0.95, 0.1, 0.05]];
        let masks = reduce_overhead(&mags, &[0, 0], 2);
        assert_eq!(masks[0], vec![true, true, false, false]);
        assert_eq!(masks[1], vec![true, true, false, false]);

        let masks = reduce_overhead(&mags, &[0, 0], 3);
        let kept: usize = masks.iter().flatten().filter(|&&b| b).count();
        assert!(kept <= 6);
        assert!(!masks[0][3]);
        assert!(masks[0].iter().filter(|&&b| b).count() <= 3);
    }
}
