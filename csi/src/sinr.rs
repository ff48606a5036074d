//! Precoded SINR
//!
//! Post-equalization SINR of a linear MMSE receiver per resource element, layer and
//! candidate precoder, and its aggregation over subbands.

use crate::channel::ReSample;
use crate::codebook::Precoder;
use crate::subband::SubbandInfo;
use common::utils::finite_mean;
use nalgebra::DMatrix;
use num_complex::Complex64;
use rayon::prelude::*;
use tracing::debug;

/// Per-layer SINR of precoder `w` on channel `h`
///
/// SINR_l = 1 / (nvar [(Heff^H Heff + nvar I)^-1]_ll) - 1 with Heff = H W.
pub fn layer_sinr(h: &DMatrix<Complex64>, w: &Precoder, noise_variance: f64) -> Vec<f64> {
    let layers = w.ncols();
    let heff = h * w;
    let gram = heff.adjoint() * &heff
        + DMatrix::<Complex64>::identity(layers, layers) * Complex64::new(noise_variance, 0.0);

    let inverse = match gram.clone().cholesky() {
        Some(chol) => Some(chol.inverse()),
        None => gram.try_inverse(),
    };

    match inverse {
        Some(inv) => (0..layers)
            .map(|l| {
                let d = inv[(l, l)].re * noise_variance;
                if d > 0.0 {
                    (1.0 / d - 1.0).max(0.0)
                } else {
                    f64::NAN
                }
            })
            .collect(),
        None => vec![f64::NAN; layers],
    }
}

/// Per-RE, per-layer SINR of every candidate, indexed [candidate][re][layer]
///
/// Parallelizes over candidates when there are at least as many candidates as REs,
/// otherwise over REs. Both orders give identical values.
pub fn evaluate_batch(
    samples: &[ReSample],
    precoders: &[&Precoder],
    noise_variance: f64,
) -> Vec<Vec<Vec<f64>>> {
    if precoders.len() >= samples.len() {
        debug!(
            "Evaluating {} candidates x {} REs, batched over candidates",
            precoders.len(),
            samples.len()
        );
        precoders
            .par_iter()
            .map(|w| {
                samples
                    .iter()
                    .map(|s| layer_sinr(&s.h, w, noise_variance))
                    .collect()
            })
            .collect()
    } else {
        debug!(
            "Evaluating {} candidates x {} REs, batched over REs",
            precoders.len(),
            samples.len()
        );
        precoders
            .iter()
            .map(|w| {
                samples
                    .par_iter()
                    .map(|s| layer_sinr(&s.h, w, noise_variance))
                    .collect()
            })
            .collect()
    }
}

/// Per-RE, per-layer SINR where each RE uses the precoder of its subband
pub fn evaluate_partitioned(
    samples: &[ReSample],
    partition: &SubbandInfo,
    precoders: &[Precoder],
    noise_variance: f64,
) -> Vec<Vec<f64>> {
    samples
        .par_iter()
        .map(|s| {
            let idx = partition.subband_of_rb(s.rb).unwrap_or(0).min(precoders.len().saturating_sub(1));
            layer_sinr(&s.h, &precoders[idx], noise_variance)
        })
        .collect()
}

/// Per-layer mean over a set of REs, ignoring non-finite values
///
/// `None` when the set is empty or a layer has no finite value.
pub fn mean_per_layer<'a, I>(re_sinr: I, layers: usize) -> Option<Vec<f64>>
where
    I: IntoIterator<Item = &'a Vec<f64>>,
{
    let rows: Vec<&Vec<f64>> = re_sinr.into_iter().collect();
    if rows.is_empty() {
        return None;
    }
    (0..layers)
        .map(|l| finite_mean(rows.iter().filter_map(|r| r.get(l).copied())))
        .collect()
}

/// SINR aggregated per region (wideband plus each subband) and candidate
///
/// Cells are `None` for restricted candidates and for regions without CSI-RS.
#[derive(Debug, Clone)]
pub struct SinrTable {
    num_candidates: usize,
    /// Region 0 is the whole BWP, region 1 + s is subband s
    cells: Vec<Vec<Option<Vec<f64>>>>,
}

impl SinrTable {
    /// Evaluate all candidates; `None` precoders are skipped
    pub fn evaluate(
        samples: &[ReSample],
        partition: &SubbandInfo,
        precoders: &[Option<&Precoder>],
        layers: usize,
        noise_variance: f64,
    ) -> Self {
        let allowed: Vec<(usize, &Precoder)> = precoders
            .iter()
            .enumerate()
            .filter_map(|(idx, w)| w.map(|w| (idx, w)))
            .collect();
        let batch: Vec<&Precoder> = allowed.iter().map(|&(_, w)| w).collect();
        let re_sinr = evaluate_batch(samples, &batch, noise_variance);

        let membership: Vec<Option<usize>> =
            samples.iter().map(|s| partition.subband_of_rb(s.rb)).collect();
        let num_regions = 1 + partition.num_subbands();
        let mut cells = vec![vec![None; precoders.len()]; num_regions];

        for (&(idx, _), sinr) in allowed.iter().zip(&re_sinr) {
            cells[0][idx] = mean_per_layer(sinr.iter(), layers);
            for sb in 0..partition.num_subbands() {
                let members = sinr
                    .iter()
                    .zip(&membership)
                    .filter(|(_, m)| **m == Some(sb))
                    .map(|(v, _)| v);
                cells[1 + sb][idx] = mean_per_layer(members, layers);
            }
        }

        Self { num_candidates: precoders.len(), cells }
    }

    pub fn num_candidates(&self) -> usize {
        self.num_candidates
    }

    pub fn num_subbands(&self) -> usize {
        self.cells.len() - 1
    }

    /// Mean per-layer SINR over the BWP
    pub fn wideband(&self, candidate: usize) -> Option<&[f64]> {
        self.cells[0][candidate].as_deref()
    }

    /// Mean per-layer SINR over one subband
    pub fn subband(&self, subband: usize, candidate: usize) -> Option<&[f64]> {
        self.cells[1 + subband][candidate].as_deref()
    }

    /// Sum over layers of the wideband SINR
    pub fn wideband_total(&self, candidate: usize) -> Option<f64> {
        self.wideband(candidate).map(|v| v.iter().sum())
    }

    /// Sum over layers of a subband SINR
    pub fn subband_total(&self, subband: usize, candidate: usize) -> Option<f64> {
        self.subband(subband, candidate).map(|v| v.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn random_samples(rng: &mut StdRng, count: usize, nr: usize, p: usize) -> Vec<ReSample> {
        (0..count)
            .map(|i| ReSample {
                subcarrier: i * 12,
                symbol: 5,
                rb: i,
                h: DMatrix::from_fn(nr, p, |_, _| c(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))),
            })
            .collect()
    }

    #[test]
    fn test_single_layer_sinr() {
        // One port, one antenna, unit gain: SINR = |h|^2 / nvar
        let h = DMatrix::from_element(1, 1, c(1.0, 0.0));
        let w = DMatrix::from_element(1, 1, c(1.0, 0.0));
        let sinr = layer_sinr(&h, &w, 0.01);
        assert_relative_eq!(sinr[0], 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_orthogonal_layers() {
        // Identity channel with identity precoder scaled to unit total power
        let h = DMatrix::<Complex64>::identity(2, 2);
        let w = DMatrix::<Complex64>::identity(2, 2) * c(std::f64::consts::FRAC_1_SQRT_2, 0.0);
        let sinr = layer_sinr(&h, &w, 0.1);
        assert_relative_eq!(sinr[0], 5.0, epsilon = 1e-9);
        assert_relative_eq!(sinr[1], 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_channel() {
        let h = DMatrix::<Complex64>::zeros(2, 2);
        let w = DMatrix::<Complex64>::identity(2, 1);
        let sinr = layer_sinr(&h, &w, 1e-10);
        assert_eq!(sinr.len(), 1);
        assert_relative_eq!(sinr[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_batch_axis_does_not_change_results() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples = random_samples(&mut rng, 6, 2, 2);
        let precoders: Vec<Precoder> = (0..3)
            .map(|_| DMatrix::from_fn(2, 1, |_, _| c(rng.gen_range(-1.0..1.0), 0.0)))
            .collect();
        let refs: Vec<&Precoder> = precoders.iter().collect();

        // 3 candidates < 6 REs batches over REs, 3 candidates >= 2 REs over candidates
        let by_re = evaluate_batch(&samples, &refs, 0.1);
        let by_candidate = evaluate_batch(&samples[..2], &refs, 0.1);
        for cand in 0..3 {
            assert_eq!(by_re[cand][..2], by_candidate[cand][..]);
        }
    }

    #[test]
    fn test_table_regions_and_restricted_candidates() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut samples = random_samples(&mut rng, 4, 1, 1);
        // Nothing lands in the last subband
        for (i, s) in samples.iter_mut().enumerate() {
            s.rb = i % 2;
        }
        let partition = SubbandInfo { sizes: vec![1, 1, 2] };
        let w = DMatrix::from_element(1, 1, c(1.0, 0.0));
        let table = SinrTable::evaluate(&samples, &partition, &[None, Some(&w)], 1, 0.1);

        assert_eq!(table.num_candidates(), 2);
        assert_eq!(table.num_subbands(), 3);
        assert!(table.wideband(0).is_none());
        assert!(table.subband(0, 1).is_some());
        assert!(table.subband(2, 1).is_none());

        let expected: f64 = samples.iter().map(|s| s.h[(0, 0)].norm_sqr() / 0.1).sum::<f64>() / 4.0;
        assert_relative_eq!(table.wideband_total(1).unwrap(), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_mean_per_layer_ignores_nan() {
        let rows = vec![vec![1.0, f64::NAN], vec![3.0, 2.0]];
        assert_eq!(mean_per_layer(rows.iter(), 2), Some(vec![2.0, 2.0]));
        let empty: Vec<Vec<f64>> = Vec::new();
        assert_eq!(mean_per_layer(empty.iter(), 2), None);
    }
}
