//! Rank Selection
//!
//! Runs the PMI search for every allowed rank and keeps the rank that maximizes the
//! configured objective.

use crate::codebook::CodebookStrategy;
use crate::config::{CsiReportConfig, RiObjective};
use crate::cqi::{cqi_from_sinr, CqiReport, LinkQualityModel};
use crate::pmi::{search_rank, PmiOutcome, SINR_COMPARISON_DECIMALS};
use crate::report::Measurement;
use common::utils::round_to_decimals;
use tracing::{debug, trace, warn};

/// Margin a higher rank must gain over the current best under the SINR objective
pub const RANK_HYSTERESIS: f64 = 0.1;

/// Layers below this linear SINR do not count toward the SINR objective
pub const MIN_LAYER_SINR: f64 = 1.0;

/// Selected rank with its PMI outcome
#[derive(Debug, Clone)]
pub struct RankSelection {
    pub rank: u8,
    pub outcome: PmiOutcome,
    /// CQI computed during the search, only under the spectral efficiency objective
    pub cqi: Option<CqiReport>,
    /// Objective value of every evaluated rank, SINR totals rounded like PMI totals
    pub metrics: Vec<(u8, Option<f64>)>,
}

/// Sum of the per-layer mean SINR over layers of at least 0 dB
pub fn sinr_metric(layer_means: &[f64]) -> f64 {
    layer_means.iter().filter(|&&s| s >= MIN_LAYER_SINR).sum()
}

/// Rank under the SINR objective
///
/// The first rank with a value becomes the best; a later rank replaces it only when its
/// total exceeds the best by more than [`RANK_HYSTERESIS`].
pub fn pick_rank_max_sinr(totals: &[(u8, Option<f64>)]) -> Option<u8> {
    let mut best: Option<(u8, f64)> = None;
    for &(rank, total) in totals {
        let Some(total) = total else { continue };
        match best {
            Some((_, best_total)) if total <= best_total + RANK_HYSTERESIS => {}
            _ => best = Some((rank, total)),
        }
    }
    best.map(|(rank, _)| rank)
}

/// Rank under the spectral efficiency objective, ties keep the lowest rank
pub fn pick_rank_max_se(values: &[(u8, Option<f64>)]) -> Option<u8> {
    let mut best: Option<(u8, f64)> = None;
    for &(rank, value) in values {
        let Some(value) = value else { continue };
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((rank, value)),
        }
    }
    best.map(|(rank, _)| rank)
}

/// Run the rank search over the allowed ranks
///
/// `None` when no rank is allowed, there are no CSI-RS samples or no rank yields a
/// selection.
pub fn select_rank<M: LinkQualityModel + ?Sized>(
    config: &CsiReportConfig,
    measurement: &Measurement,
    model: &M,
) -> Option<RankSelection> {
    let ranks = config
        .valid_ranks(measurement.ports, measurement.rx_antennas)
        .ranks();
    if ranks.is_empty() || measurement.samples.is_empty() {
        warn!(
            "No rank to report: {} allowed ranks, {} CSI-RS samples",
            ranks.len(),
            measurement.samples.len()
        );
        return None;
    }

    let strategy = CodebookStrategy::from_config(&config.codebook);
    let ctx = measurement.search_context(config);
    let subband_cqi = config.uses_subbands(config.cqi_mode);

    let mut candidates: Vec<(PmiOutcome, Option<CqiReport>)> = Vec::with_capacity(ranks.len());
    let mut metrics = Vec::with_capacity(ranks.len());
    for &rank in &ranks {
        let outcome = search_rank(&strategy, measurement.ports, rank, &ctx);
        let (metric, cqi) = match config.ri_objective {
            RiObjective::MaxSinr => (
                outcome
                    .layer_means()
                    .map(|m| round_to_decimals(sinr_metric(&m), SINR_COMPARISON_DECIMALS)),
                None,
            ),
            RiObjective::MaxSe => {
                if outcome.selection.is_none() {
                    (None, None)
                } else {
                    let cqi = cqi_from_sinr(
                        model,
                        &config.bwp,
                        config.cqi_table,
                        &measurement.samples,
                        &outcome.re_sinr,
                        &measurement.cqi_subbands,
                        subband_cqi,
                        rank,
                    );
                    (cqi.spectral_efficiency(config.cqi_table), Some(cqi))
                }
            }
        };
        trace!("Rank {} objective {:?}", rank, metric);
        metrics.push((rank, metric));
        candidates.push((outcome, cqi));
    }

    let chosen = match config.ri_objective {
        RiObjective::MaxSinr => pick_rank_max_sinr(&metrics),
        RiObjective::MaxSe => pick_rank_max_se(&metrics),
    };
    let Some(rank) = chosen else {
        warn!("No rank produced a precoder selection");
        return None;
    };
    debug!("Selected rank {} ({:?}) from {:?}", rank, config.ri_objective, metrics);

    let (outcome, cqi) = candidates.into_iter().find(|(o, _)| o.rank == rank)?;
    Some(RankSelection { rank, outcome, cqi, metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ReSample;
    use crate::codebook::PmiIndices;
    use crate::config::{CodebookConfig, SinglePanelConfig};
    use crate::cqi::SinrThresholdTable;
    use crate::subband::SubbandInfo;
    use approx::assert_relative_eq;
    use common::{BandwidthPart, CarrierGrid};
    use nalgebra::DMatrix;
    use num_complex::Complex64;

    /// Two-port report allowing only the rank-1 precoder [1, j] and the rank-2
    /// precoder [[1, 1], [j, -j]]
    fn two_port_config() -> CsiReportConfig {
        let mut cfg = CsiReportConfig::new(
            CarrierGrid::new(0, 24).unwrap(),
            BandwidthPart::new(0, 24).unwrap(),
        );
        cfg.codebook = CodebookConfig::Type1SinglePanel(SinglePanelConfig {
            subset_restriction: Some(vec![false, true, false, false, false, true]),
            ..Default::default()
        });
        cfg
    }

    /// Unit noise measurement on a channel with H^H H = [[a, jb], [-jb, a]]
    ///
    /// The rank-1 precoder then reaches a SINR of a - b and the two rank-2 layers
    /// (a - b) / 2 and (a + b) / 2, so rank 2 gains exactly b.
    fn measurement(cfg: &CsiReportConfig, a: f64, b: f64) -> Measurement {
        let h = DMatrix::from_row_slice(
            2,
            2,
            &[
                Complex64::new(a.sqrt(), 0.0),
                Complex64::new(0.0, b / a.sqrt()),
                Complex64::new(0.0, 0.0),
                Complex64::new((a - b * b / a).sqrt(), 0.0),
            ],
        );
        let samples = (0..24)
            .map(|rb| ReSample { subcarrier: rb * 12, symbol: 5, rb, h: h.clone() })
            .collect();
        Measurement {
            samples,
            noise_variance: 1.0,
            ports: 2,
            rx_antennas: 2,
            cqi_subbands: SubbandInfo::wideband(&cfg.bwp),
            pmi_subbands: SubbandInfo::wideband(&cfg.bwp),
            prg: None,
        }
    }

    #[test]
    fn test_sinr_metric_ignores_weak_layers() {
        assert_eq!(sinr_metric(&[10.0, 0.5, 1.0]), 11.0);
        assert_eq!(sinr_metric(&[0.2]), 0.0);
    }

    #[test]
    fn test_max_sinr_hysteresis() {
        assert_eq!(pick_rank_max_sinr(&[(1, Some(10.0)), (2, Some(10.05))]), Some(1));
        assert_eq!(pick_rank_max_sinr(&[(1, Some(10.0)), (2, Some(10.15))]), Some(2));
        // The margin applies against the current best, not the previous rank
        assert_eq!(
            pick_rank_max_sinr(&[(1, Some(10.0)), (2, Some(10.08)), (3, Some(10.16))]),
            Some(3)
        );
    }

    #[test]
    fn test_rank_search_hysteresis() {
        let cfg = two_port_config();
        let model = SinrThresholdTable::default();
        for (gain, expected) in [(0.05, 1), (0.1, 1), (0.15, 2)] {
            let selection = select_rank(&cfg, &measurement(&cfg, 10.0, gain), &model).unwrap();
            assert_eq!(selection.rank, expected, "rank 2 gain {}", gain);
            assert_eq!(selection.metrics.len(), 2);
            assert_relative_eq!(selection.metrics[0].1.unwrap(), 10.0 - gain, epsilon = 1e-12);
            assert_relative_eq!(selection.metrics[1].1.unwrap(), 10.0, epsilon = 1e-12);
            assert!(selection.cqi.is_none());
        }
    }

    #[test]
    fn test_rank_search_reports_selected_precoder() {
        let cfg = two_port_config();
        let selection = select_rank(&cfg, &measurement(&cfg, 10.0, 0.15), &SinrThresholdTable::default()).unwrap();
        match selection.outcome.selection.as_ref().map(|s| s.indices.clone()) {
            Some(PmiIndices::SinglePanel { i2, .. }) => assert_eq!(i2, crate::codebook::SubbandI2::Wideband(1)),
            other => panic!("Unexpected indices {:?}", other),
        }
        let layers = selection.outcome.layer_means().unwrap();
        assert_relative_eq!(layers[0], 4.925, epsilon = 1e-9);
        assert_relative_eq!(layers[1], 5.075, epsilon = 1e-9);
    }

    #[test]
    fn test_max_sinr_skips_missing() {
        assert_eq!(pick_rank_max_sinr(&[(1, None), (2, Some(0.0))]), Some(2));
        assert_eq!(pick_rank_max_sinr(&[(1, None), (2, None)]), None);
        assert_eq!(pick_rank_max_sinr(&[]), None);
    }

    #[test]
    fn test_max_se_ties_keep_lowest_rank() {
        assert_eq!(pick_rank_max_se(&[(1, Some(4.0)), (2, Some(4.0))]), Some(1));
        assert_eq!(pick_rank_max_se(&[(1, Some(4.0)), (2, Some(4.01))]), Some(2));
        assert_eq!(pick_rank_max_se(&[(1, None), (2, Some(0.0))]), Some(2));
    }
}
