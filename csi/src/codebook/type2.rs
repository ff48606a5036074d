//! Type II Codebook
//!
//! Linear combination of L orthogonal DFT beams per polarization with quantized
//! wideband amplitudes and per-subband phases (and optionally amplitudes).
//! Based on 3GPP TS 38.214 Section 5.2.2.2.3
//!
//! The candidate space is too large to enumerate. For every rotation (q1, q2) the search
//! picks the L beams capturing the most channel power, projects the dominant eigenvectors
//! of each PMI subband onto them and quantizes the coefficients. The rotation with the
//! highest wideband SINR wins.

use super::beams::BeamGrid;
use super::restriction::{encode_combinatorial, AmplitudeRestriction};
use super::{BeamBasis, CodebookFamily, PmiIndices, Precoder, RealizedCodebook, SubbandI2, Type2I1, Type2I2};
use crate::channel::{covariance, dominant_eigenvectors, ReSample};
use crate::config::Type2Config;
use crate::pmi::{PmiSelection, SearchContext, SINR_COMPARISON_DECIMALS};
use crate::quantizer::{phase_point, quantize_phase, AmplitudeLadder};
use crate::sinr::{evaluate_partitioned, mean_per_layer};
use crate::subband::SubbandInfo;
use common::utils::{combinations, first_max_index, n_choose_k, round_to_decimals};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use rayon::prelude::*;
use tracing::{debug, trace};

/// Phase alphabet of the coefficients without subband amplitude refinement
const COARSE_PHASES: u32 = 4;

/// L orthogonal beams of one rotation
#[derive(Debug, Clone)]
pub struct BeamSelection {
    pub rotation: (usize, usize),
    /// Orthogonal beam indices n = N1 n2 + n1, ascending
    pub indices: Vec<usize>,
    pub vectors: Vec<DVector<Complex64>>,
    /// Amplitude ceiling of each beam
    pub caps: Vec<f64>,
}

impl BeamSelection {
    /// Combinatorial index i1,2
    pub fn combinatorial_index(&self, grid: &BeamGrid) -> u32 {
        encode_combinatorial(&self.indices, grid.elements()) as u32
    }

    pub fn num_beams(&self) -> usize {
        self.indices.len()
    }

    /// Coefficients of `e` on the beams, polarization A first (2L entries)
    pub fn project(&self, e: &DVector<Complex64>) -> Vec<Complex64> {
        let n = self.vectors.first().map(|v| v.len()).unwrap_or(0);
        (0..2)
            .flat_map(|pol| {
                self.vectors.iter().map(move |v| {
                    v.iter()
                        .zip(e.rows(pol * n, n).iter())
                        .map(|(a, b)| a.conj() * b)
                        .sum::<Complex64>()
                })
            })
            .collect()
    }

    /// Unit-norm column from 2L coefficients, `None` when all coefficients vanish
    pub fn combine(&self, coefficients: &[Complex64]) -> Option<DVector<Complex64>> {
        let n = self.vectors.first()?.len();
        let l = self.num_beams();
        let mut w = DVector::<Complex64>::zeros(2 * n);
        for pol in 0..2 {
            for (i, v) in self.vectors.iter().enumerate() {
                let coeff = coefficients[pol * l + i];
                for x in 0..n {
                    w[pol * n + x] += v[x] * coeff;
                }
            }
        }
        let norm = w.norm();
        (norm > 0.0).then(|| w.unscale(norm))
    }
}

/// Beam v(m1, m2) of orthogonal index n under rotation q
fn beam_position(grid: &BeamGrid, rotation: (usize, usize), n: usize) -> (usize, usize) {
    (
        grid.o1 * (n % grid.n1) + rotation.0,
        grid.o2 * (n / grid.n1) + rotation.1,
    )
}

/// Rotations (q1, q2) in search order
pub fn rotations(grid: &BeamGrid) -> Vec<(usize, usize)> {
    (0..grid.o1)
        .flat_map(|q1| (0..grid.o2).map(move |q2| (q1, q2)))
        .collect()
}

/// Power v^H R v summed over both polarizations
fn beam_power(cov: &DMatrix<Complex64>, v: &DVector<Complex64>) -> f64 {
    let n = v.len();
    (0..2)
        .map(|pol| {
            let block = cov.view((pol * n, pol * n), (n, n)).clone_owned();
            (v.adjoint() * &block * v)[(0, 0)].re
        })
        .sum()
}

/// Best combination of `num_beams` orthogonal beams for one rotation
///
/// Beams whose amplitude ceiling is zero are never selected. `None` when fewer than
/// `num_beams` beams remain.
pub fn select_beams(
    grid: &BeamGrid,
    restriction: &AmplitudeRestriction,
    cov: &DMatrix<Complex64>,
    rotation: (usize, usize),
    num_beams: usize,
) -> Option<BeamSelection> {
    let n = grid.elements();
    let power: Vec<Option<f64>> = (0..n)
        .map(|idx| {
            let (m1, m2) = beam_position(grid, rotation, idx);
            (restriction.max_amplitude(m1, m2) > 0.0).then(|| beam_power(cov, &grid.v(m1, m2)))
        })
        .collect();

    let combos = combinations(n, num_beams);
    let best = first_max_index(
        combos
            .iter()
            .map(|combo| combo.iter().map(|&i| power[i]).sum::<Option<f64>>()),
    )?;
    let indices = combos[best].clone();
    let (vectors, caps) = indices
        .iter()
        .map(|&idx| {
            let (m1, m2) = beam_position(grid, rotation, idx);
            (grid.v(m1, m2), restriction.max_amplitude(m1, m2))
        })
        .unzip();
    Some(BeamSelection { rotation, indices, vectors, caps })
}

/// Precoder from unit-norm layer columns
pub fn layers_to_precoder(columns: &[DVector<Complex64>]) -> Precoder {
    DMatrix::from_columns(columns).unscale((columns.len() as f64).sqrt())
}

/// Samples of each region of a partition
pub fn samples_by_region<'a>(samples: &'a [ReSample], partition: &SubbandInfo) -> Vec<Vec<&'a ReSample>> {
    let mut regions = vec![Vec::new(); partition.num_subbands()];
    for sample in samples {
        if let Some(region) = partition.subband_of_rb(sample.rb).and_then(|r| regions.get_mut(r)) {
            region.push(sample);
        }
    }
    regions
}

/// Sum over layers of the wideband mean SINR, rounded for comparison
pub fn wideband_metric(
    samples: &[ReSample],
    partition: &SubbandInfo,
    precoders: &[Precoder],
    layers: usize,
    noise_variance: f64,
) -> Option<f64> {
    let re_sinr = evaluate_partitioned(samples, partition, precoders, noise_variance);
    let means = mean_per_layer(re_sinr.iter(), layers)?;
    let total: f64 = means.iter().sum();
    total
        .is_finite()
        .then(|| round_to_decimals(total, SINR_COMPARISON_DECIMALS))
}

/// Number of strongest coefficients with subband amplitude and fine phase, K(2)
fn fine_coefficients(num_beams: usize) -> usize {
    if num_beams == 4 {
        6
    } else {
        4
    }
}

/// Type II codebook of one rank: beam grid plus amplitude restriction
#[derive(Debug, Clone)]
pub struct Type2Codebook {
    pub rank: u8,
    pub ports: usize,
    grid: BeamGrid,
    restriction: AmplitudeRestriction,
}

/// Best rotation of the wideband stage
#[derive(Debug, Clone)]
pub struct Type2Choice {
    i1: Type2I1,
    /// i2 per region, `None` without CSI-RS
    i2: Vec<Option<Type2I2>>,
    partition: SubbandInfo,
    precoders: Vec<Precoder>,
    total: f64,
}

/// Type II family
#[derive(Debug, Clone)]
pub struct Type2Family<'a> {
    cfg: &'a Type2Config,
}

/// Quantized coefficients of one layer in one region
struct LayerCoefficients {
    phases: Vec<u32>,
    amplitudes: Vec<u32>,
    values: Vec<Complex64>,
}

impl<'a> Type2Family<'a> {
    pub fn new(cfg: &'a Type2Config) -> Self {
        Self { cfg }
    }

    /// i2 is selected per PMI subband in subband mode or with subband amplitudes
    fn per_subband(&self, ctx: &SearchContext<'_>) -> bool {
        ctx.subband_pmi || self.cfg.subband_amplitude
    }

    /// Wideband amplitude indices and strongest coefficient of one layer
    fn wideband_amplitudes(&self, beams: &BeamSelection, projections: &[&Vec<Complex64>]) -> Option<(u32, Vec<u32>)> {
        let l = beams.num_beams();
        let count = projections.len().max(1) as f64;
        let amp: Vec<f64> = (0..2 * l)
            .map(|i| (projections.iter().map(|c| c[i].norm_sqr()).sum::<f64>() / count).sqrt())
            .collect();
        let cap = |i: usize| beams.caps[i % l];

        let unrestricted = (0..2 * l).any(|i| cap(i) >= 1.0);
        let strongest = first_max_index(
            (0..2 * l).map(|i| (!unrestricted || cap(i) >= 1.0).then_some(amp[i])),
        )?;
        let scale = amp[strongest];
        if scale <= 0.0 {
            return None;
        }

        let ladder = AmplitudeLadder::type2_wideband();
        let indices = (0..2 * l)
            .map(|i| {
                if i == strongest {
                    ladder.max_index()
                } else {
                    ladder.quantize_capped(amp[i] / scale, cap(i))
                }
            })
            .collect();
        Some((strongest as u32, indices))
    }

    /// Subband phases and amplitudes of one layer in one region
    fn subband_coefficients(&self, projection: &[Complex64], strongest: usize, wideband: &[u32]) -> LayerCoefficients {
        let wb_ladder = AmplitudeLadder::type2_wideband();
        let sb_ladder = AmplitudeLadder::type2_subband();
        let n_psk = self.cfg.phase_alphabet as u32;
        let reference = projection[strongest];

        // Coefficients refined with subband amplitude and N_PSK phases
        let mut order: Vec<usize> = (0..projection.len())
            .filter(|&i| i != strongest && wideband[i] > 0)
            .collect();
        order.sort_by(|&a, &b| wideband[b].cmp(&wideband[a]).then(a.cmp(&b)));
        let refined = if self.cfg.subband_amplitude {
            fine_coefficients(self.cfg.num_beams as usize) - 1
        } else {
            order.len()
        };
        let mut fine = vec![false; projection.len()];
        for &i in order.iter().take(refined) {
            fine[i] = true;
        }

        let mut phases = Vec::with_capacity(projection.len());
        let mut amplitudes = Vec::with_capacity(projection.len());
        let mut values = Vec::with_capacity(projection.len());
        for (i, &c) in projection.iter().enumerate() {
            let relative = if reference.norm() > 0.0 { c / reference } else { Complex64::new(0.0, 0.0) };
            let p_wb = wb_ladder.level(wideband[i]);
            let (phase, alphabet) = if i == strongest || wideband[i] == 0 {
                (0, n_psk)
            } else if fine[i] {
                (quantize_phase(relative.arg(), n_psk), n_psk)
            } else {
                (quantize_phase(relative.arg(), COARSE_PHASES), COARSE_PHASES)
            };
            let sb_index = if self.cfg.subband_amplitude && fine[i] && p_wb > 0.0 {
                sb_ladder.quantize(relative.norm() / p_wb)
            } else {
                sb_ladder.max_index()
            };
            phases.push(phase);
            amplitudes.push(sb_index);
            values.push(phase_point(phase, alphabet) * p_wb * sb_ladder.level(sb_index));
        }
        LayerCoefficients { phases, amplitudes, values }
    }

    /// Full selection for one rotation
    fn evaluate_rotation(
        &self,
        codebook: &Type2Codebook,
        ctx: &SearchContext<'_>,
        wideband_cov: &DMatrix<Complex64>,
        eigenvectors: &[Option<Vec<DVector<Complex64>>>],
        partition: &SubbandInfo,
        rotation: (usize, usize),
    ) -> Option<Type2Choice> {
        let rank = codebook.rank as usize;
        let beams = select_beams(
            &codebook.grid,
            &codebook.restriction,
            wideband_cov,
            rotation,
            self.cfg.num_beams as usize,
        )?;

        let projections: Vec<Option<Vec<Vec<Complex64>>>> = eigenvectors
            .iter()
            .map(|eig| eig.as_ref().map(|vs| vs.iter().map(|e| beams.project(e)).collect()))
            .collect();

        let mut i13 = Vec::with_capacity(rank);
        let mut i14 = Vec::with_capacity(rank);
        for layer in 0..rank {
            let layer_projections: Vec<&Vec<Complex64>> =
                projections.iter().flatten().filter_map(|p| p.get(layer)).collect();
            let (strongest, amplitudes) = self.wideband_amplitudes(&beams, &layer_projections)?;
            i13.push(strongest);
            i14.push(amplitudes);
        }

        let mut i2 = Vec::with_capacity(projections.len());
        let mut precoders: Vec<Option<Precoder>> = Vec::with_capacity(projections.len());
        for region in &projections {
            let Some(region) = region else {
                i2.push(None);
                precoders.push(None);
                continue;
            };
            let mut i21 = Vec::with_capacity(rank);
            let mut i22 = Vec::with_capacity(rank);
            let mut columns = Vec::with_capacity(rank);
            for layer in 0..rank {
                let coefficients =
                    self.subband_coefficients(region.get(layer)?, i13[layer] as usize, &i14[layer]);
                columns.push(beams.combine(&coefficients.values)?);
                i21.push(coefficients.phases);
                if self.cfg.subband_amplitude {
                    i22.push(coefficients.amplitudes);
                }
            }
            i2.push(Some(Type2I2 { i21, i22 }));
            precoders.push(Some(layers_to_precoder(&columns)));
        }

        let fallback = precoders.iter().flatten().next()?.clone();
        let precoders: Vec<Precoder> = precoders
            .into_iter()
            .map(|w| w.unwrap_or_else(|| fallback.clone()))
            .collect();
        let total = wideband_metric(ctx.samples, partition, &precoders, rank, ctx.noise_variance)?;
        trace!("Type II rotation {:?}: beams {:?}, total {}", rotation, beams.indices, total);

        Some(Type2Choice {
            i1: Type2I1 {
                i11: [rotation.0 as u32, rotation.1 as u32],
                i12: beams.combinatorial_index(&codebook.grid),
                i13,
                i14,
            },
            i2,
            partition: partition.clone(),
            precoders,
            total,
        })
    }
}

impl<'a> CodebookFamily for Type2Family<'a> {
    type Codebook = Type2Codebook;
    type Wideband = Type2Choice;

    fn build_codebook(&self, ports: usize, rank: u8) -> Type2Codebook {
        Type2Codebook {
            rank,
            ports,
            grid: BeamGrid::new(&self.cfg.panel),
            restriction: AmplitudeRestriction::new(&self.cfg.panel, self.cfg.subset_restriction.as_deref()),
        }
    }

    fn wideband_search(&self, codebook: &Type2Codebook, ctx: &SearchContext<'_>) -> Option<Type2Choice> {
        if ctx.samples.is_empty() || !(1..=2).contains(&codebook.rank) {
            return None;
        }
        let rank = codebook.rank as usize;
        let partition = if self.per_subband(ctx) {
            ctx.pmi_subbands.clone()
        } else {
            SubbandInfo::wideband(&ctx.bwp)
        };
        let wideband_cov = covariance(ctx.samples, codebook.ports)?;
        let eigenvectors: Vec<Option<Vec<DVector<Complex64>>>> = samples_by_region(ctx.samples, &partition)
            .into_iter()
            .map(|region| covariance(region, codebook.ports).map(|cov| dominant_eigenvectors(&cov, rank)))
            .collect();

        let choices: Vec<Option<Type2Choice>> = rotations(&codebook.grid)
            .into_par_iter()
            .map(|rotation| {
                self.evaluate_rotation(codebook, ctx, &wideband_cov, &eigenvectors, &partition, rotation)
            })
            .collect();
        let best = first_max_index(choices.iter().map(|c| c.as_ref().map(|c| c.total)))?;
        let choice = choices.into_iter().nth(best)??;
        debug!(
            "Type II rank {}: rotation {:?}, i1,2 {}, total {}",
            rank, choice.i1.i11, choice.i1.i12, choice.total
        );
        Some(choice)
    }

    fn subband_search(
        &self,
        _codebook: &Type2Codebook,
        wideband: Type2Choice,
        ctx: &SearchContext<'_>,
    ) -> Option<PmiSelection> {
        let i2 = if self.per_subband(ctx) {
            SubbandI2::Subband(wideband.i2)
        } else {
            SubbandI2::Wideband(wideband.i2.into_iter().next()??)
        };
        Some(PmiSelection {
            indices: PmiIndices::Type2 { i1: wideband.i1, i2 },
            partition: wideband.partition,
            precoders: wideband.precoders,
        })
    }

    fn realize(&self, codebook: Type2Codebook) -> RealizedCodebook {
        RealizedCodebook::BeamBasis(BeamBasis {
            panel: self.cfg.panel,
            oversampling: (codebook.grid.o1, codebook.grid.o2),
            num_beams: self.cfg.num_beams as usize,
            rotations: codebook.grid.o1 * codebook.grid.o2,
            combinations: n_choose_k(codebook.grid.elements(), self.cfg.num_beams as usize) as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::random_samples;
    use crate::config::PanelDims;
    use approx::assert_relative_eq;
    use common::BandwidthPart;

    fn config(n1: u8, n2: u8, num_beams: u8, subband_amplitude: bool) -> Type2Config {
        Type2Config {
            panel: PanelDims::new(n1, n2),
            num_beams,
            phase_alphabet: 8,
            subband_amplitude,
            subset_restriction: None,
        }
    }

    fn context<'a>(samples: &'a [ReSample], partition: &'a SubbandInfo, subband_pmi: bool) -> SearchContext<'a> {
        SearchContext {
            samples,
            noise_variance: 0.1,
            bwp: BandwidthPart::new(0, partition.total_rbs() as u16).unwrap(),
            pmi_subbands: partition,
            subband_pmi,
            prg: None,
        }
    }

    fn run(cfg: &Type2Config, ports: usize, rank: u8, ctx: &SearchContext<'_>) -> Option<PmiSelection> {
        let family = Type2Family::new(cfg);
        let cb = family.build_codebook(ports, rank);
        let wideband = family.wideband_search(&cb, ctx)?;
        family.subband_search(&cb, wideband, ctx)
    }

    #[test]
    fn test_beam_selection_follows_channel() {
        let grid = BeamGrid::new(&PanelDims::new(4, 1));
        let restriction = AmplitudeRestriction::new(&PanelDims::new(4, 1), None);
        // Channel matched to beam v(8, 0), orthogonal index 2 of rotation 0
        let v = grid.v(8, 0);
        let mut h = DMatrix::<Complex64>::zeros(1, 8);
        for x in 0..4 {
            h[(0, x)] = v[x].conj();
        }
        let cov = h.adjoint() * &h;
        let beams = select_beams(&grid, &restriction, &cov, (0, 0), 2).unwrap();
        assert!(beams.indices.contains(&2));

        let coefficients = beams.project(&h.adjoint().column(0).into_owned());
        let w = beams.combine(&coefficients).unwrap();
        assert_relative_eq!(w.norm(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_amplitude_beams_excluded() {
        let panel = PanelDims::new(4, 1);
        let grid = BeamGrid::new(&panel);
        // Group 0 fully restricted: beams 0..4 have ceiling 0
        let mut bits = vec![true; 32];
        bits[..8].iter_mut().for_each(|b| *b = false);
        let restriction = AmplitudeRestriction::new(&panel, Some(&bits));

        let v = grid.v(0, 0);
        let mut h = DMatrix::<Complex64>::zeros(1, 8);
        for x in 0..4 {
            h[(0, x)] = v[x].conj();
        }
        let cov = h.adjoint() * &h;
        let beams = select_beams(&grid, &restriction, &cov, (0, 0), 2).unwrap();
        assert!(!beams.indices.contains(&0));
        assert!(beams.caps.iter().all(|&c| c > 0.0));
    }

    #[test]
    fn test_unit_power_precoders() {
        let samples = random_samples(3, 8, 2, 8);
        let partition = SubbandInfo { sizes: vec![4, 4] };
        for (subband_pmi, subband_amplitude) in [(false, false), (true, false), (false, true), (true, true)] {
            let cfg = config(2, 2, 2, subband_amplitude);
            let ctx = context(&samples, &partition, subband_pmi);
            for rank in 1..=2u8 {
                let selection = run(&cfg, 8, rank, &ctx).unwrap();
                assert_eq!(selection.rank(), rank as usize);
                for w in &selection.precoders {
                    for col in w.column_iter() {
                        assert_relative_eq!(col.norm_squared(), 1.0 / rank as f64, epsilon = 1e-9);
                    }
                }
                match &selection.indices {
                    PmiIndices::Type2 { i1, i2 } => {
                        assert_eq!(i1.i13.len(), rank as usize);
                        assert!(i1.i14.iter().all(|a| a.len() == 4));
                        assert!(i1.i14.iter().zip(&i1.i13).all(|(a, &s)| a[s as usize] == 7));
                        match i2 {
                            SubbandI2::Subband(values) => assert_eq!(values.len(), 2),
                            SubbandI2::Wideband(value) => assert_eq!(value.i21.len(), rank as usize),
                            SubbandI2::NotReported => panic!("Type II always reports i2"),
                        }
                    }
                    other => panic!("Unexpected indices {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let samples = random_samples(5, 6, 2, 8);
        let partition = SubbandInfo { sizes: vec![6] };
        let cfg = config(4, 1, 3, true);
        let ctx = context(&samples, &partition, false);
        let first = run(&cfg, 8, 2, &ctx).unwrap();
        let second = run(&cfg, 8, 2, &ctx).unwrap();
        assert_eq!(first.indices, second.indices);
        assert_eq!(first.precoders, second.precoders);
    }

    #[test]
    fn test_no_samples_or_unsupported_rank() {
        let partition = SubbandInfo { sizes: vec![4] };
        let cfg = config(2, 2, 2, false);
        assert!(run(&cfg, 8, 1, &context(&[], &partition, false)).is_none());
        let samples = random_samples(1, 4, 4, 8);
        assert!(run(&cfg, 8, 3, &context(&samples, &partition, false)).is_none());
    }

    #[test]
    fn test_realized_basis() {
        let cfg = config(2, 2, 2, false);
        let family = Type2Family::new(&cfg);
        match family.realize(family.build_codebook(8, 1)) {
            RealizedCodebook::BeamBasis(basis) => {
                assert_eq!(basis.rotations, 16);
                assert_eq!(basis.combinations, 6);
            }
            _ => panic!("Type II realizes a beam basis"),
        }
    }
}
