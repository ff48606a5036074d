//! Enhanced Type II Codebook
//!
//! Type II beam combining with the per-subband coefficients compressed onto a few DFT
//! bases along frequency. Based on 3GPP TS 38.214 Section 5.2.2.2.5
//!
//! Per rotation and layer, the eigenvector projections of all PMI subbands are transformed
//! across subbands, the strongest bin is moved to zero and the Mv strongest bases are kept.
//! Overhead reduction then keeps at most K0 non-zero coefficients per layer and 2 K0 in
//! total before amplitude and phase quantization.

use super::beams::BeamGrid;
use super::restriction::{encode_combinatorial, AmplitudeRestriction};
use super::type2::{layers_to_precoder, rotations, samples_by_region, select_beams, wideband_metric, BeamSelection};
use super::{
    BeamBasis, CodebookFamily, EnhancedType2I1, EnhancedType2I2, PmiIndices, Precoder, RealizedCodebook, SubbandI2,
};
use crate::channel::{covariance, dominant_eigenvectors};
use crate::config::EnhancedType2Config;
use crate::pmi::{PmiSelection, SearchContext};
use crate::quantizer::{
    phase_point, quantize_phase, reduce_overhead, select_frequency_bases, AmplitudeLadder, FrequencyCompressor,
};
use crate::subband::SubbandInfo;
use common::utils::{first_max_index, n_choose_k};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use rayon::prelude::*;
use tracing::{debug, trace};

/// Phase alphabet of the combining coefficients
const PHASES: u32 = 16;

/// paramCombination-r16 (Table 5.2.2.2.5-1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamCombination {
    /// Beams combined per polarization L
    pub num_beams: u8,
    /// p_v for ranks 1 and 2
    pub p_low_rank: f64,
    /// p_v for ranks 3 and 4, `None` when those ranks are not supported
    pub p_high_rank: Option<f64>,
    pub beta: f64,
}

impl ParamCombination {
    pub fn from_index(index: u8) -> Option<Self> {
        let (num_beams, p_low_rank, p_high_rank, beta) = match index {
            1 => (2, 0.25, Some(0.125), 0.25),
            2 => (2, 0.25, Some(0.125), 0.5),
            3 => (4, 0.25, Some(0.125), 0.25),
            4 => (4, 0.25, Some(0.125), 0.5),
            5 => (4, 0.25, Some(0.25), 0.75),
            6 => (4, 0.5, Some(0.25), 0.5),
            7 => (6, 0.25, None, 0.5),
            8 => (6, 0.25, None, 0.75),
            _ => return None,
        };
        Some(Self { num_beams, p_low_rank, p_high_rank, beta })
    }

    pub fn max_rank(&self) -> u8 {
        if self.p_high_rank.is_some() {
            4
        } else {
            2
        }
    }

    /// Frequency bases Mv = ceil(p_v N3 / R)
    pub fn frequency_bases(&self, rank: u8, n3: usize, r: usize) -> Option<usize> {
        let p = if rank <= 2 { Some(self.p_low_rank) } else { self.p_high_rank }?;
        Some(((p * n3 as f64) / r.max(1) as f64).ceil().max(1.0) as usize)
    }

    /// Non-zero coefficient budget K0 = ceil(beta 2L M1)
    pub fn max_nonzero(&self, m1: usize) -> usize {
        (self.beta * 2.0 * self.num_beams as f64 * m1 as f64).ceil() as usize
    }
}

/// Enhanced Type II codebook of one rank
#[derive(Debug, Clone)]
pub struct EnhancedType2Codebook {
    pub rank: u8,
    pub ports: usize,
    params: Option<ParamCombination>,
    grid: BeamGrid,
    restriction: AmplitudeRestriction,
}

/// Best rotation of the wideband stage
#[derive(Debug, Clone)]
pub struct EnhancedType2Choice {
    i1: EnhancedType2I1,
    i2: EnhancedType2I2,
    partition: SubbandInfo,
    precoders: Vec<Precoder>,
    total: f64,
}

/// Compressed and quantized coefficients of one layer
#[derive(Debug, Clone)]
struct LayerReport {
    bins: Vec<usize>,
    strongest: usize,
    bitmap: Vec<bool>,
    reference: u32,
    amplitudes: Vec<u32>,
    phases: Vec<u32>,
    /// Quantized coefficient per (beam, basis), beam-major
    values: Vec<Complex64>,
}

/// Enhanced Type II family
#[derive(Debug, Clone)]
pub struct EnhancedType2Family<'a> {
    cfg: &'a EnhancedType2Config,
}

impl<'a> EnhancedType2Family<'a> {
    pub fn new(cfg: &'a EnhancedType2Config) -> Self {
        Self { cfg }
    }

    /// Phase-aligned coefficients of one layer, [beam][subband]
    fn layer_coefficients(
        beams: &BeamSelection,
        eigenvectors: &[Option<Vec<DVector<Complex64>>>],
        layer: usize,
    ) -> Vec<Vec<Complex64>> {
        let coefficients = 2 * beams.num_beams();
        let zero = Complex64::new(0.0, 0.0);
        let columns: Vec<Vec<Complex64>> = eigenvectors
            .iter()
            .map(|eig| {
                eig.as_ref()
                    .and_then(|vs| vs.get(layer))
                    .map(|e| beams.project(e))
                    .unwrap_or_else(|| vec![zero; coefficients])
            })
            .collect();

        let reference = first_max_index(
            (0..coefficients).map(|i| Some(columns.iter().map(|c| c[i].norm_sqr()).sum::<f64>())),
        )
        .unwrap_or(0);

        let mut rows = vec![vec![zero; columns.len()]; coefficients];
        for (t, column) in columns.iter().enumerate() {
            let anchor = column[reference];
            let rotate = if anchor.norm() > 0.0 { anchor.conj() / anchor.norm() } else { Complex64::new(1.0, 0.0) };
            for (i, &c) in column.iter().enumerate() {
                rows[i][t] = c * rotate;
            }
        }
        rows
    }

    /// Quantize the compressed coefficients of one layer
    fn quantize_layer(
        &self,
        beams: &BeamSelection,
        shifted: &[Vec<Complex64>],
        strongest: usize,
        bins: Vec<usize>,
        bitmap: Vec<bool>,
    ) -> Option<LayerReport> {
        let l = beams.num_beams();
        let m = bins.len();
        let anchor = shifted[strongest][0];
        if anchor.norm() <= 0.0 {
            return None;
        }
        let y = |i: usize, j: usize| shifted[i][bins[j]] / anchor;

        let reference_ladder = AmplitudeLadder::etype2_reference();
        let differential = AmplitudeLadder::etype2_differential();
        let strongest_pol = strongest / l;

        // Reference amplitude of the weaker polarization
        let weaker_peak = (0..l)
            .flat_map(|i| (0..m).map(move |j| ((1 - strongest_pol) * l + i, j)))
            .filter(|&(i, j)| bitmap[i * m + j])
            .map(|(i, j)| y(i, j).norm())
            .fold(0.0, f64::max);
        let reference = reference_ladder.quantize(weaker_peak);
        let p1 = |pol: usize| {
            if pol == strongest_pol {
                1.0
            } else {
                reference_ladder.level(reference)
            }
        };

        let mut amplitudes = vec![0u32; 2 * l * m];
        let mut phases = vec![0u32; 2 * l * m];
        let mut values = vec![Complex64::new(0.0, 0.0); 2 * l * m];
        for i in 0..2 * l {
            let pol = i / l;
            let cap = beams.caps[i % l];
            for j in 0..m {
                let k = i * m + j;
                if !bitmap[k] {
                    continue;
                }
                if i == strongest && bins[j] == 0 {
                    amplitudes[k] = differential.max_index();
                } else {
                    let c = y(i, j);
                    amplitudes[k] = differential.quantize_capped(c.norm() / p1(pol), cap / p1(pol));
                    phases[k] = quantize_phase(c.arg(), PHASES);
                }
                values[k] = phase_point(phases[k], PHASES) * p1(pol) * differential.level(amplitudes[k]);
            }
        }

        Some(LayerReport { bins, strongest, bitmap, reference, amplitudes, phases, values })
    }

    /// Precoder column of one layer in PMI subband t
    fn layer_column(
        beams: &BeamSelection,
        compressor: &FrequencyCompressor,
        report: &LayerReport,
        t: usize,
    ) -> Option<DVector<Complex64>> {
        let m = report.bins.len();
        let coefficients: Vec<Complex64> = (0..2 * beams.num_beams())
            .map(|i| {
                report
                    .bins
                    .iter()
                    .enumerate()
                    .map(|(j, &f)| report.values[i * m + j] * compressor.basis(f, t))
                    .sum()
            })
            .collect();
        beams.combine(&coefficients)
    }

    /// Full selection for one rotation
    #[allow(clippy::too_many_arguments)]
    fn evaluate_rotation(
        &self,
        codebook: &EnhancedType2Codebook,
        params: &ParamCombination,
        ctx: &SearchContext<'_>,
        wideband_cov: &DMatrix<Complex64>,
        eigenvectors: &[Option<Vec<DVector<Complex64>>>],
        partition: &SubbandInfo,
        rotation: (usize, usize),
    ) -> Option<EnhancedType2Choice> {
        let rank = codebook.rank as usize;
        let n3 = partition.num_subbands();
        let r = if ctx.subband_pmi { self.cfg.pmi_subbands_per_cqi_subband as usize } else { 1 };
        let mv = params.frequency_bases(codebook.rank, n3, r)?.min(n3);
        let k0 = params.max_nonzero(params.frequency_bases(1, n3, r)?.min(n3));
        let beams = select_beams(
            &codebook.grid,
            &codebook.restriction,
            wideband_cov,
            rotation,
            params.num_beams as usize,
        )?;
        let compressor = FrequencyCompressor::new(n3);

        // Transform each layer and move its strongest bin to zero
        let mut shifted_layers = Vec::with_capacity(rank);
        let mut strongest = Vec::with_capacity(rank);
        let mut powers = Vec::with_capacity(rank);
        for layer in 0..rank {
            let mut rows = Self::layer_coefficients(&beams, eigenvectors, layer);
            compressor.transform(&mut rows);
            let flat_best = first_max_index(rows.iter().flatten().map(|c| Some(c.norm_sqr())))?;
            let (i_star, f_star) = (flat_best / n3, flat_best % n3);
            let shifted: Vec<Vec<Complex64>> = rows
                .iter()
                .map(|row| (0..n3).map(|f| row[(f + f_star) % n3]).collect())
                .collect();
            powers.push(
                (0..n3)
                    .map(|f| shifted.iter().map(|row| row[f].norm_sqr()).sum())
                    .collect::<Vec<f64>>(),
            );
            strongest.push(i_star);
            shifted_layers.push(shifted);
        }

        let selection = select_frequency_bases(&powers, n3, mv);
        let magnitudes: Vec<Vec<f64>> = shifted_layers
            .iter()
            .zip(&selection.bins)
            .zip(&strongest)
            .map(|((shifted, bins), &s)| {
                let anchor = shifted[s][0].norm();
                shifted
                    .iter()
                    .flat_map(|row| bins.iter().map(move |&f| row[f].norm()))
                    .map(|v| if anchor > 0.0 { v / anchor } else { 0.0 })
                    .collect()
            })
            .collect();
        let forced: Vec<usize> = strongest.iter().map(|&s| s * mv).collect();
        let masks = reduce_overhead(&magnitudes, &forced, k0);

        let mut reports = Vec::with_capacity(rank);
        for (((shifted, bins), mask), &s) in shifted_layers
            .iter()
            .zip(selection.bins)
            .zip(masks)
            .zip(&strongest)
        {
            reports.push(self.quantize_layer(&beams, shifted, s, bins, mask)?);
        }

        let precoders: Vec<Precoder> = (0..n3)
            .map(|t| {
                let columns: Option<Vec<DVector<Complex64>>> = reports
                    .iter()
                    .map(|report| Self::layer_column(&beams, &compressor, report, t))
                    .collect();
                columns.map(|c| layers_to_precoder(&c))
            })
            .collect::<Option<_>>()?;
        let total = wideband_metric(ctx.samples, partition, &precoders, rank, ctx.noise_variance)?;
        trace!(
            "Enhanced Type II rotation {:?}: beams {:?}, Mv {}, K0 {}, total {}",
            rotation,
            beams.indices,
            mv,
            k0,
            total
        );

        let i16 = reports
            .iter()
            .map(|report| frequency_index(&report.bins, n3, mv, selection.window_start))
            .collect();
        Some(EnhancedType2Choice {
            i1: EnhancedType2I1 {
                i11: [rotation.0 as u32, rotation.1 as u32],
                i12: beams.combinatorial_index(&codebook.grid),
                i15: selection.window_start,
                i16,
                i17: reports.iter().map(|r| r.bitmap.clone()).collect(),
                i18: reports.iter().map(|r| r.strongest as u32).collect(),
            },
            i2: EnhancedType2I2 {
                i23: reports.iter().map(|r| r.reference).collect(),
                i24: reports.iter().map(|r| r.amplitudes.clone()).collect(),
                i25: reports.iter().map(|r| r.phases.clone()).collect(),
            },
            partition: partition.clone(),
            precoders,
            total,
        })
    }
}

/// Combinatorial index i1,6 of the non-zero frequency bases
///
/// Bin 0 is implicit. Without a window the remaining bins come from 1..N3, with a window
/// from the 2 Mv window positions other than bin 0.
fn frequency_index(bins: &[usize], n3: usize, mv: usize, window_start: Option<i32>) -> u32 {
    match window_start {
        None => {
            let others: Vec<usize> = bins.iter().filter(|&&f| f != 0).map(|&f| f - 1).collect();
            encode_combinatorial(&others, n3.saturating_sub(1)) as u32
        }
        Some(start) => {
            let zero_pos = (-start) as usize;
            let mut others: Vec<usize> = bins
                .iter()
                .filter(|&&f| f != 0)
                .map(|&f| (f as i32 - start).rem_euclid(n3 as i32) as usize)
                .map(|o| if o > zero_pos { o - 1 } else { o })
                .collect();
            others.sort_unstable();
            encode_combinatorial(&others, (2 * mv).saturating_sub(1)) as u32
        }
    }
}

impl<'a> CodebookFamily for EnhancedType2Family<'a> {
    type Codebook = EnhancedType2Codebook;
    type Wideband = EnhancedType2Choice;

    fn build_codebook(&self, ports: usize, rank: u8) -> EnhancedType2Codebook {
        EnhancedType2Codebook {
            rank,
            ports,
            params: ParamCombination::from_index(self.cfg.param_combination),
            grid: BeamGrid::new(&self.cfg.panel),
            restriction: AmplitudeRestriction::new(&self.cfg.panel, self.cfg.subset_restriction.as_deref()),
        }
    }

    fn wideband_search(
        &self,
        codebook: &EnhancedType2Codebook,
        ctx: &SearchContext<'_>,
    ) -> Option<EnhancedType2Choice> {
        let params = codebook.params?;
        if ctx.samples.is_empty() || codebook.rank == 0 || codebook.rank > params.max_rank() {
            return None;
        }
        let rank = codebook.rank as usize;
        let partition = if ctx.subband_pmi {
            ctx.pmi_subbands.clone()
        } else {
            SubbandInfo::wideband(&ctx.bwp)
        };
        let wideband_cov = covariance(ctx.samples, codebook.ports)?;
        let eigenvectors: Vec<Option<Vec<DVector<Complex64>>>> = samples_by_region(ctx.samples, &partition)
            .into_iter()
            .map(|region| covariance(region, codebook.ports).map(|cov| dominant_eigenvectors(&cov, rank)))
            .collect();

        let choices: Vec<Option<EnhancedType2Choice>> = rotations(&codebook.grid)
            .into_par_iter()
            .map(|rotation| {
                self.evaluate_rotation(codebook, &params, ctx, &wideband_cov, &eigenvectors, &partition, rotation)
            })
            .collect();
        let best = first_max_index(choices.iter().map(|c| c.as_ref().map(|c| c.total)))?;
        let choice = choices.into_iter().nth(best)??;
        debug!(
            "Enhanced Type II rank {}: rotation {:?}, {} PMI subbands, window {:?}, total {}",
            rank,
            choice.i1.i11,
            partition.num_subbands(),
            choice.i1.i15,
            choice.total
        );
        Some(choice)
    }

    fn subband_search(
        &self,
        _codebook: &EnhancedType2Codebook,
        wideband: EnhancedType2Choice,
        _ctx: &SearchContext<'_>,
    ) -> Option<PmiSelection> {
        // Frequency compression leaves nothing to choose per subband
        Some(PmiSelection {
            indices: PmiIndices::EnhancedType2 {
                i1: wideband.i1,
                i2: SubbandI2::Wideband(wideband.i2),
            },
            partition: wideband.partition,
            precoders: wideband.precoders,
        })
    }

    fn realize(&self, codebook: EnhancedType2Codebook) -> RealizedCodebook {
        let num_beams = codebook.params.map(|p| p.num_beams as usize).unwrap_or(0);
        RealizedCodebook::BeamBasis(BeamBasis {
            panel: self.cfg.panel,
            oversampling: (codebook.grid.o1, codebook.grid.o2),
            num_beams,
            rotations: codebook.grid.o1 * codebook.grid.o2,
            combinations: n_choose_k(codebook.grid.elements(), num_beams) as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{random_samples, ReSample};
    use crate::config::PanelDims;
    use approx::assert_relative_eq;
    use common::BandwidthPart;

    fn config(param_combination: u8, r: u8) -> EnhancedType2Config {
        EnhancedType2Config {
            panel: PanelDims::new(2, 2),
            param_combination,
            pmi_subbands_per_cqi_subband: r,
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

    fn run(cfg: &EnhancedType2Config, rank: u8, ctx: &SearchContext<'_>) -> Option<PmiSelection> {
        let family = EnhancedType2Family::new(cfg);
        let cb = family.build_codebook(8, rank);
        let wideband = family.wideband_search(&cb, ctx)?;
        family.subband_search(&cb, wideband, ctx)
    }

    #[test]
    fn test_param_combinations() {
        assert!(ParamCombination::from_index(0).is_none());
        assert!(ParamCombination::from_index(9).is_none());

        let pc = ParamCombination::from_index(1).unwrap();
        assert_eq!(pc.max_rank(), 4);
        assert_eq!(pc.frequency_bases(1, 8, 1), Some(2));
        assert_eq!(pc.frequency_bases(3, 8, 1), Some(1));
        assert_eq!(pc.frequency_bases(1, 8, 2), Some(1));
        assert_eq!(pc.max_nonzero(2), 2);

        let pc = ParamCombination::from_index(8).unwrap();
        assert_eq!(pc.num_beams, 6);
        assert_eq!(pc.max_rank(), 2);
        assert_eq!(pc.frequency_bases(3, 8, 1), None);
        assert_eq!(pc.max_nonzero(2), 18);
    }

    #[test]
    fn test_frequency_index() {
        // Bins {0, 2, 3} of N3 = 5: remaining {1, 2} of 0..4
        assert_eq!(
            frequency_index(&[0, 2, 3], 5, 3, None),
            encode_combinatorial(&[1, 2], 4) as u32
        );
        // Window start -2 over 24 bins, bin 0 at position 2, bin 22 at position 0
        assert_eq!(
            frequency_index(&[0, 22], 24, 2, Some(-2)),
            encode_combinatorial(&[0], 3) as u32
        );
    }

    #[test]
    fn test_compressed_selection() {
        let samples = random_samples(9, 16, 4, 8);
        let partition = SubbandInfo { sizes: vec![2; 8] };
        let cfg = config(4, 1);
        let pc = ParamCombination::from_index(4).unwrap();
        let ctx = context(&samples, &partition, true);
        for rank in 1..=4u8 {
            let selection = run(&cfg, rank, &ctx).unwrap();
            assert_eq!(selection.precoders.len(), 8);
            for w in &selection.precoders {
                assert_eq!(w.shape(), (8, rank as usize));
                for col in w.column_iter() {
                    assert_relative_eq!(col.norm_squared(), 1.0 / rank as f64, epsilon = 1e-9);
                }
            }

            let mv = pc.frequency_bases(rank, 8, 1).unwrap();
            let k0 = pc.max_nonzero(pc.frequency_bases(1, 8, 1).unwrap());
            match &selection.indices {
                PmiIndices::EnhancedType2 { i1, i2 } => {
                    assert_eq!(i1.i15, None);
                    let mut total = 0;
                    for (bitmap, &s) in i1.i17.iter().zip(&i1.i18) {
                        assert_eq!(bitmap.len(), 2 * 4 * mv);
                        assert!(bitmap[s as usize * mv]);
                        let kept = bitmap.iter().filter(|&&b| b).count();
                        assert!(kept <= k0);
                        total += kept;
                    }
                    assert!(total <= 2 * k0);
                    match i2 {
                        SubbandI2::Wideband(i2) => {
                            assert_eq!(i2.i24.len(), rank as usize);
                            assert!(i2.i23.iter().all(|&k| (1..=15).contains(&k)));
                        }
                        _ => panic!("Enhanced Type II reports i2 once"),
                    }
                }
                other => panic!("Unexpected indices {:?}", other),
            }
        }
    }

    #[test]
    fn test_windowed_bases() {
        let samples = random_samples(4, 24, 2, 8);
        let partition = SubbandInfo { sizes: vec![1; 24] };
        let cfg = config(1, 1);
        let selection = run(&cfg, 1, &context(&samples, &partition, true)).unwrap();
        match &selection.indices {
            PmiIndices::EnhancedType2 { i1, .. } => {
                // Mv = 6, window of 12 bins
                let start = i1.i15.unwrap();
                assert!((-11..=0).contains(&start));
                assert_eq!(i1.i17[0].len(), 2 * 2 * 6);
            }
            other => panic!("Unexpected indices {:?}", other),
        }
    }

    #[test]
    fn test_wideband_pmi_and_limits() {
        let samples = random_samples(2, 8, 2, 8);
        let partition = SubbandInfo { sizes: vec![4, 4] };
        let ctx = context(&samples, &partition, false);
        let first = run(&config(2, 1), 1, &ctx).unwrap();
        let second = run(&config(2, 1), 1, &ctx).unwrap();
        assert_eq!(first.indices, second.indices);
        assert_eq!(first.precoders.len(), 1);
        // Rank 3 is not defined for paramCombination 7
        assert!(run(&config(7, 1), 3, &ctx).is_none());
        assert!(run(&config(2, 1), 1, &context(&[], &partition, false)).is_none());
    }
}
