//! PMI Selection
//!
//! Two-stage precoder search for one rank: a wideband stage over the full candidate space
//! fixes i1, then a subband stage picks i2 per subband with i1 held.
//! Based on 3GPP TS 38.214 Section 5.2.2.2

use crate::channel::{ChannelEstimate, ReSample};
use crate::codebook::{CandidateGroup, CodebookStrategy, EnumeratedCodebook, Precoder, RealizedCodebook, SubbandI2};
use crate::config::CsiReportConfig;
use crate::report::Measurement;
use crate::rs::CsiRsGrid;
use crate::sinr::{evaluate_partitioned, mean_per_layer, SinrTable};
use crate::subband::SubbandInfo;
use crate::{CsiError, PmiIndices};
use common::utils::{first_max_index, round_to_decimals};
use common::BandwidthPart;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

/// Decimal places kept when comparing SINR totals
pub const SINR_COMPARISON_DECIMALS: i32 = 4;

/// Per-PRG random i2 draw of the cri-RI-i1-CQI report quantity
#[derive(Debug, Clone, Copy)]
pub struct PrgDraw<'a> {
    pub partition: &'a SubbandInfo,
    pub seed: u64,
}

/// Inputs shared by the search stages of one rank
#[derive(Debug, Clone, Copy)]
pub struct SearchContext<'a> {
    pub samples: &'a [ReSample],
    /// Floored noise variance
    pub noise_variance: f64,
    pub bwp: BandwidthPart,
    /// PMI subbands (PMI subbands of size N_sb / R for enhanced Type II)
    pub pmi_subbands: &'a SubbandInfo,
    /// Whether i2 is reported per subband
    pub subband_pmi: bool,
    pub prg: Option<PrgDraw<'a>>,
}

/// Selected indices and the precoders they realize
#[derive(Debug, Clone)]
pub struct PmiSelection {
    /// Zero-based index set
    pub indices: PmiIndices,
    /// Partition the precoders apply to
    pub partition: SubbandInfo,
    /// One precoder per entry of `partition`
    pub precoders: Vec<Precoder>,
}

impl PmiSelection {
    /// Precoder applied on a BWP-relative RB
    pub fn precoder_for_rb(&self, rb: usize) -> &Precoder {
        let idx = self
            .partition
            .subband_of_rb(rb)
            .unwrap_or(0)
            .min(self.precoders.len().saturating_sub(1));
        &self.precoders[idx]
    }

    pub fn rank(&self) -> usize {
        self.precoders.first().map(|w| w.ncols()).unwrap_or(0)
    }
}

/// PMI search result for one rank
#[derive(Debug, Clone)]
pub struct PmiOutcome {
    pub rank: u8,
    /// `None` when nothing could be selected
    pub selection: Option<PmiSelection>,
    pub codebook: RealizedCodebook,
    /// Per-RE, per-layer SINR of the selected precoders, empty without a selection
    pub re_sinr: Vec<Vec<f64>>,
}

impl PmiOutcome {
    /// Per-layer mean SINR over the BWP
    pub fn layer_means(&self) -> Option<Vec<f64>> {
        self.selection.as_ref()?;
        mean_per_layer(self.re_sinr.iter(), self.rank as usize)
    }

    /// Per-layer mean SINR of each subband of a partition, `None` without CSI-RS
    pub fn subband_sinr(&self, samples: &[ReSample], partition: &SubbandInfo) -> Vec<Option<Vec<f64>>> {
        (0..partition.num_subbands())
            .map(|sb| {
                if self.selection.is_none() {
                    return None;
                }
                let members = samples
                    .iter()
                    .zip(&self.re_sinr)
                    .filter(|(s, _)| partition.subband_of_rb(s.rb) == Some(sb))
                    .map(|(_, v)| v);
                mean_per_layer(members, self.rank as usize)
            })
            .collect()
    }
}

/// Run the search for one rank and evaluate the selected precoders
pub fn search_rank(
    strategy: &CodebookStrategy<'_>,
    ports: usize,
    rank: u8,
    ctx: &SearchContext<'_>,
) -> PmiOutcome {
    let outcome = strategy.select(ports, rank, ctx);
    let re_sinr = match &outcome.selection {
        Some(selection) => evaluate_partitioned(
            ctx.samples,
            &selection.partition,
            &selection.precoders,
            ctx.noise_variance,
        ),
        None => Vec::new(),
    };
    if let Some(selection) = &outcome.selection {
        debug!("Rank {} PMI {:?}", rank, selection.indices);
    }
    PmiOutcome {
        rank,
        selection: outcome.selection,
        codebook: outcome.codebook,
        re_sinr,
    }
}

/// PMI for an externally fixed rank
pub fn select_pmi(
    config: &CsiReportConfig,
    channel: &ChannelEstimate,
    csirs: &CsiRsGrid,
    rank: u8,
    noise_variance: f64,
) -> Result<PmiOutcome, CsiError> {
    let measurement = Measurement::prepare(config, channel, csirs, noise_variance)?;
    Ok(pmi_for_rank(config, &measurement, rank))
}

/// PMI for a fixed rank over an already prepared measurement
pub fn pmi_for_rank(config: &CsiReportConfig, measurement: &Measurement, rank: u8) -> PmiOutcome {
    let strategy = CodebookStrategy::from_config(&config.codebook);
    let ctx = measurement.search_context(config);
    let valid = config.valid_ranks(measurement.ports, measurement.rx_antennas);
    if measurement.samples.is_empty() || !valid.ranks().contains(&rank) {
        warn!("No PMI for rank {}: no CSI-RS samples or rank not allowed", rank);
        return PmiOutcome {
            rank,
            selection: None,
            codebook: strategy.select(measurement.ports, rank, &ctx).codebook,
            re_sinr: Vec::new(),
        };
    }
    search_rank(&strategy, measurement.ports, rank, &ctx)
}

/// Wideband stage result over an enumerated codebook
#[derive(Debug, Clone)]
pub struct EnumeratedWideband {
    pub group: usize,
    pub candidate: usize,
    pub table: SinrTable,
    /// Flat index of the first candidate of each group
    pub offsets: Vec<usize>,
}

/// Indices chosen from an enumerated codebook
#[derive(Debug, Clone)]
pub struct EnumeratedChoice<I1, I2> {
    pub i1: I1,
    pub i2: SubbandI2<I2>,
    pub partition: SubbandInfo,
    pub precoders: Vec<Precoder>,
}

fn rounded(total: Option<f64>) -> Option<f64> {
    total
        .filter(|t| t.is_finite())
        .map(|t| round_to_decimals(t, SINR_COMPARISON_DECIMALS))
}

/// Candidate with the highest wideband SINR summed over layers, first maximum wins
pub fn enumerated_wideband_search<I1, I2>(
    codebook: &EnumeratedCodebook<I1, I2>,
    ctx: &SearchContext<'_>,
) -> Option<EnumeratedWideband> {
    if ctx.samples.is_empty() || codebook.is_fully_restricted() {
        return None;
    }

    let precoders: Vec<Option<&Precoder>> = codebook
        .candidates()
        .map(|(_, _, c)| c.precoder.as_ref())
        .collect();
    let table = SinrTable::evaluate(
        ctx.samples,
        ctx.pmi_subbands,
        &precoders,
        codebook.rank as usize,
        ctx.noise_variance,
    );

    let best = first_max_index((0..precoders.len()).map(|idx| rounded(table.wideband_total(idx))))?;
    let (group, candidate, _) = codebook.candidates().nth(best)?;
    let offsets = codebook
        .groups
        .iter()
        .scan(0usize, |offset, g| {
            let current = *offset;
            *offset += g.candidates.len();
            Some(current)
        })
        .collect();

    trace!(
        "Wideband best candidate {} (group {}, i2 position {}) with total {:?}",
        best,
        group,
        candidate,
        table.wideband_total(best)
    );
    Some(EnumeratedWideband { group, candidate, table, offsets })
}

/// Subband stage over an enumerated codebook with the wideband group fixed
pub fn enumerated_subband_search<I1: Clone, I2: Clone>(
    codebook: &EnumeratedCodebook<I1, I2>,
    wideband: EnumeratedWideband,
    ctx: &SearchContext<'_>,
) -> Option<EnumeratedChoice<I1, I2>> {
    let group = codebook.groups.get(wideband.group)?;
    let best = group.candidates.get(wideband.candidate)?;
    let best_precoder = best.precoder.clone()?;

    if let Some(prg) = ctx.prg {
        return Some(EnumeratedChoice {
            i1: group.i1.clone(),
            i2: SubbandI2::NotReported,
            partition: prg.partition.clone(),
            precoders: draw_prg_precoders(group, &prg),
        });
    }

    if !ctx.subband_pmi {
        return Some(EnumeratedChoice {
            i1: group.i1.clone(),
            i2: SubbandI2::Wideband(best.i2.clone()),
            partition: SubbandInfo::wideband(&ctx.bwp),
            precoders: vec![best_precoder],
        });
    }

    let offset = wideband.offsets[wideband.group];
    let (i2, precoders): (Vec<Option<I2>>, Vec<Precoder>) = (0..ctx.pmi_subbands.num_subbands())
        .map(|sb| {
            let pick = first_max_index(
                (0..group.candidates.len())
                    .map(|c| rounded(wideband.table.subband_total(sb, offset + c))),
            );
            match pick.and_then(|c| group.candidates.get(c)) {
                Some(cand) => (
                    Some(cand.i2.clone()),
                    cand.precoder.clone().unwrap_or_else(|| best_precoder.clone()),
                ),
                None => (None, best_precoder.clone()),
            }
        })
        .unzip();

    debug!(
        "Subband stage: {} of {} subbands reported",
        i2.iter().filter(|v| v.is_some()).count(),
        i2.len()
    );
    Some(EnumeratedChoice {
        i1: group.i1.clone(),
        i2: SubbandI2::Subband(i2),
        partition: ctx.pmi_subbands.clone(),
        precoders,
    })
}

/// One precoder per PRG, drawn uniformly among the unrestricted i2 of the group
pub fn draw_prg_precoders<I1, I2>(group: &CandidateGroup<I1, I2>, prg: &PrgDraw<'_>) -> Vec<Precoder> {
    let allowed: Vec<&Precoder> = group
        .candidates
        .iter()
        .filter_map(|c| c.precoder.as_ref())
        .collect();
    if allowed.is_empty() {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(prg.seed);
    (0..prg.partition.num_subbands())
        .map(|_| allowed[rng.gen_range(0..allowed.len())].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebook::Candidate;
    use nalgebra::DMatrix;
    use num_complex::Complex64;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn sample(rb: usize, h: &[Complex64]) -> ReSample {
        ReSample {
            subcarrier: rb * 12,
            symbol: 5,
            rb,
            h: DMatrix::from_row_slice(1, h.len(), h),
        }
    }

    fn two_port_codebook() -> EnumeratedCodebook<u32, u32> {
        let mut cb = EnumeratedCodebook::new(1, 2);
        let s = std::f64::consts::FRAC_1_SQRT_2;
        cb.push_group(
            0,
            vec![
                Candidate { i2: 0, precoder: Some(DMatrix::from_column_slice(2, 1, &[c(s, 0.0), c(s, 0.0)])) },
                Candidate { i2: 1, precoder: Some(DMatrix::from_column_slice(2, 1, &[c(s, 0.0), c(-s, 0.0)])) },
                Candidate { i2: 2, precoder: None },
            ],
        );
        cb
    }

    fn context<'a>(samples: &'a [ReSample], partition: &'a SubbandInfo, subband_pmi: bool) -> SearchContext<'a> {
        SearchContext {
            samples,
            noise_variance: 0.01,
            bwp: BandwidthPart::new(0, partition.total_rbs() as u16).unwrap(),
            pmi_subbands: partition,
            subband_pmi,
            prg: None,
        }
    }

    #[test]
    fn test_wideband_and_subband_selection() {
        // RB 0 favours co-phased ports, RB 1 anti-phased, RB 1 slightly stronger
        let samples = vec![
            sample(0, &[c(1.0, 0.0), c(1.0, 0.0)]),
            sample(1, &[c(1.1, 0.0), c(-1.1, 0.0)]),
        ];
        let partition = SubbandInfo { sizes: vec![1, 1] };
        let cb = two_port_codebook();

        let ctx = context(&samples, &partition, true);
        let wideband = enumerated_wideband_search(&cb, &ctx).unwrap();
        assert_eq!(wideband.candidate, 1);

        let choice = enumerated_subband_search(&cb, wideband, &ctx).unwrap();
        assert_eq!(choice.i2, SubbandI2::Subband(vec![Some(0), Some(1)]));
        assert_eq!(choice.precoders.len(), 2);
    }

    #[test]
    fn test_subband_without_samples() {
        let samples = vec![sample(0, &[c(1.0, 0.0), c(1.0, 0.0)])];
        let partition = SubbandInfo { sizes: vec![1, 1] };
        let cb = two_port_codebook();
        let ctx = context(&samples, &partition, true);
        let wideband = enumerated_wideband_search(&cb, &ctx).unwrap();
        let choice = enumerated_subband_search(&cb, wideband, &ctx).unwrap();
        assert_eq!(choice.i2, SubbandI2::Subband(vec![Some(0), None]));
    }

    #[test]
    fn test_ties_keep_first_candidate() {
        // Only port 0 has gain, both candidates see the same SINR
        let samples = vec![sample(0, &[c(1.0, 0.0), c(0.0, 0.0)])];
        let partition = SubbandInfo { sizes: vec![1] };
        let cb = two_port_codebook();
        let ctx = context(&samples, &partition, false);
        let wideband = enumerated_wideband_search(&cb, &ctx).unwrap();
        assert_eq!(wideband.candidate, 0);
    }

    #[test]
    fn test_no_samples_or_fully_restricted() {
        let partition = SubbandInfo { sizes: vec![1] };
        let cb = two_port_codebook();
        assert!(enumerated_wideband_search(&cb, &context(&[], &partition, false)).is_none());

        let samples = vec![sample(0, &[c(1.0, 0.0), c(1.0, 0.0)])];
        let mut restricted = two_port_codebook();
        for cand in &mut restricted.groups[0].candidates {
            cand.precoder = None;
        }
        assert!(enumerated_wideband_search(&restricted, &context(&samples, &partition, false)).is_none());
    }

    #[test]
    fn test_prg_draw_is_reproducible() {
        let cb = two_port_codebook();
        let partition = SubbandInfo { sizes: vec![2, 2, 2, 2, 2] };
        let prg = PrgDraw { partition: &partition, seed: 0 };
        let first = draw_prg_precoders(&cb.groups[0], &prg);
        let second = draw_prg_precoders(&cb.groups[0], &prg);
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        // The restricted candidate is never drawn
        assert!(first.iter().all(|w| w.iter().all(|v| v.norm() > 0.5)));
    }
}
