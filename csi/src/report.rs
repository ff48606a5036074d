//! CSI Report
//!
//! Top-level entry point: validates the configuration against the channel estimate,
//! gathers the CSI-RS samples and runs the rank, PMI and CQI selection for one
//! scheduling opportunity.

use crate::channel::{effective_noise_variance, ChannelEstimate, ReSample};
use crate::codebook::{PmiIndices, Precoder, RealizedCodebook};
use crate::config::{CodebookConfig, CsiReportConfig, ReportQuantity, ReportingMode};
use crate::cqi::{cqi_from_sinr, CqiReport, LinkQualityModel, SinrThresholdTable};
use crate::pmi::{PrgDraw, SearchContext};
use crate::ri::select_rank;
use crate::rs::CsiRsGrid;
use crate::subband::SubbandInfo;
use crate::CsiError;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Validated inputs of one report
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Channel at the CSI-RS REs inside the BWP
    pub samples: Vec<ReSample>,
    /// Floored noise variance
    pub noise_variance: f64,
    pub ports: usize,
    pub rx_antennas: usize,
    pub cqi_subbands: SubbandInfo,
    /// PMI subbands, split by R for the enhanced Type II codebook
    pub pmi_subbands: SubbandInfo,
    /// Precoding resource groups of the cri-RI-i1-CQI report quantity
    pub prg: Option<SubbandInfo>,
}

impl Measurement {
    /// Validate the configuration and gather the samples
    pub fn prepare(
        config: &CsiReportConfig,
        channel: &ChannelEstimate,
        csirs: &CsiRsGrid,
        noise_variance: f64,
    ) -> Result<Self, CsiError> {
        let ports = channel.ports();
        config.validate(ports)?;
        channel.check_carrier(&config.carrier)?;
        if let Some(csirs_ports) = csirs.ports {
            if csirs_ports as usize != ports {
                return Err(CsiError::InvalidInput(format!(
                    "CSI-RS has {} ports but the channel estimate has {}",
                    csirs_ports, ports
                )));
            }
        }

        let cqi_subbands = SubbandInfo::new(&config.bwp, config.subband_size, config.cqi_mode)?;
        let mut pmi_subbands = SubbandInfo::new(&config.bwp, config.subband_size, config.pmi_mode)?;
        match &config.codebook {
            CodebookConfig::EnhancedType2(cfg) => {
                if let Some(size) = config.subband_size {
                    pmi_subbands = pmi_subbands.split(&config.bwp, size, cfg.pmi_subbands_per_cqi_subband);
                }
            }
            // Subband amplitudes are reported per CSI subband whatever the PMI mode
            CodebookConfig::Type2(cfg) if cfg.subband_amplitude && config.subband_size.is_some() => {
                pmi_subbands = cqi_subbands_for(config)?;
            }
            _ => {}
        }
        let prg = match (config.report_quantity, config.prg_size) {
            (ReportQuantity::CriRiI1Cqi, Some(size)) => Some(SubbandInfo::prg(&config.bwp, size)?),
            _ => None,
        };

        let samples = channel.gather(&config.carrier, &config.bwp, csirs);
        let measurement = Self {
            samples,
            noise_variance: effective_noise_variance(noise_variance),
            ports,
            rx_antennas: channel.rx_antennas(),
            cqi_subbands,
            pmi_subbands,
            prg,
        };
        debug!(
            "Measurement: {} samples, {} ports, {} rx antennas, {} CQI / {} PMI subbands, noise variance {:e}",
            measurement.samples.len(),
            measurement.ports,
            measurement.rx_antennas,
            measurement.cqi_subbands.num_subbands(),
            measurement.pmi_subbands.num_subbands(),
            measurement.noise_variance
        );
        Ok(measurement)
    }

    /// Search inputs shared by all ranks
    pub fn search_context(&self, config: &CsiReportConfig) -> SearchContext<'_> {
        SearchContext {
            samples: &self.samples,
            noise_variance: self.noise_variance,
            bwp: config.bwp,
            pmi_subbands: &self.pmi_subbands,
            subband_pmi: config.uses_subbands(config.pmi_mode),
            prg: self.prg.as_ref().map(|partition| PrgDraw { partition, seed: config.prg_seed }),
        }
    }

    /// Subbands reported with a CQI row, zero in wideband mode
    fn reported_cqi_subbands(&self, config: &CsiReportConfig) -> usize {
        if config.uses_subbands(config.cqi_mode) {
            self.cqi_subbands.num_subbands()
        } else {
            0
        }
    }
}

/// CSI subbands of the BWP regardless of the reporting modes
fn cqi_subbands_for(config: &CsiReportConfig) -> Result<SubbandInfo, CsiError> {
    SubbandInfo::new(&config.bwp, config.subband_size, ReportingMode::Subband)
}

/// Intermediate results kept for the scheduler
#[derive(Debug, Clone)]
pub struct CsiDiagnostics {
    pub cqi_subbands: SubbandInfo,
    pub pmi_subbands: SubbandInfo,
    pub noise_variance: f64,
    pub num_samples: usize,
    /// Per-RE, per-layer SINR of the selected precoders
    pub re_sinr: Vec<Vec<f64>>,
    /// Per-layer SINR of each CQI subband, `None` without CSI-RS
    pub subband_sinr: Vec<Option<Vec<f64>>>,
    /// Objective value per evaluated rank
    pub rank_metrics: Vec<(u8, Option<f64>)>,
    pub codebook: Option<RealizedCodebook>,
    /// Partition the precoders apply to
    pub precoder_partition: Option<SubbandInfo>,
    /// Precoding matrices W actually used
    pub precoders: Vec<Precoder>,
}

/// One CSI report
#[derive(Debug, Clone, Serialize)]
pub struct CsiReport {
    /// Rank indicator, `None` when nothing is reported
    pub ri: Option<u8>,
    /// One-based PMI, `None` when nothing is reported
    pub pmi: Option<PmiIndices>,
    pub cqi: CqiReport,
    #[serde(skip)]
    pub diagnostics: CsiDiagnostics,
}

impl CsiReport {
    pub fn is_reported(&self) -> bool {
        self.ri.is_some()
    }
}

/// CSI report computation for one report configuration
#[derive(Debug, Clone)]
pub struct CsiReporter<M = SinrThresholdTable> {
    config: CsiReportConfig,
    model: M,
}

impl CsiReporter<SinrThresholdTable> {
    /// Reporter using the built-in thresholds of the configured CQI table
    pub fn with_default_model(config: CsiReportConfig) -> Self {
        let model = SinrThresholdTable::default_for(config.cqi_table);
        Self { config, model }
    }
}

impl<M: LinkQualityModel> CsiReporter<M> {
    pub fn new(config: CsiReportConfig, model: M) -> Self {
        Self { config, model }
    }

    pub fn config(&self) -> &CsiReportConfig {
        &self.config
    }

    /// Compute RI, PMI and CQI
    ///
    /// Configuration errors are returned before any search. Missing CSI-RS samples or a
    /// fully restricted codebook give a report whose RI, PMI and CQI are `None`.
    pub fn compute(
        &self,
        channel: &ChannelEstimate,
        csirs: &CsiRsGrid,
        noise_variance: f64,
    ) -> Result<CsiReport, CsiError> {
        let config = &self.config;
        let measurement = Measurement::prepare(config, channel, csirs, noise_variance)?;
        let reported_subbands = measurement.reported_cqi_subbands(config);

        let mut diagnostics = CsiDiagnostics {
            cqi_subbands: measurement.cqi_subbands.clone(),
            pmi_subbands: measurement.pmi_subbands.clone(),
            noise_variance: measurement.noise_variance,
            num_samples: measurement.samples.len(),
            re_sinr: Vec::new(),
            subband_sinr: vec![None; measurement.cqi_subbands.num_subbands()],
            rank_metrics: Vec::new(),
            codebook: None,
            precoder_partition: None,
            precoders: Vec::new(),
        };

        let selection = select_rank(config, &measurement, &self.model);
        let Some(rank_selection) = selection else {
            warn!(
                "No CSI report: {} CSI-RS samples in BWP, {} codebook",
                measurement.samples.len(),
                config.codebook.codebook_type()
            );
            return Ok(CsiReport {
                ri: None,
                pmi: None,
                cqi: CqiReport::not_reported(reported_subbands, 1),
                diagnostics,
            });
        };

        let rank = rank_selection.rank;
        let outcome = rank_selection.outcome;
        let cqi = match rank_selection.cqi {
            Some(cqi) => cqi,
            None => cqi_from_sinr(
                &self.model,
                &config.bwp,
                config.cqi_table,
                &measurement.samples,
                &outcome.re_sinr,
                &measurement.cqi_subbands,
                reported_subbands > 0,
                rank,
            ),
        };

        diagnostics.subband_sinr = outcome.subband_sinr(&measurement.samples, &measurement.cqi_subbands);
        diagnostics.rank_metrics = rank_selection.metrics;
        let pmi = outcome.selection.as_ref().map(|s| s.indices.to_one_based());
        if let Some(selection) = outcome.selection {
            diagnostics.precoder_partition = Some(selection.partition);
            diagnostics.precoders = selection.precoders;
        }
        diagnostics.re_sinr = outcome.re_sinr;
        diagnostics.codebook = Some(outcome.codebook);

        info!(
            "CSI report: RI {}, wideband CQI {:?}, {} codebook",
            rank,
            cqi.wideband_cqi(),
            config.codebook.codebook_type()
        );
        Ok(CsiReport {
            ri: Some(rank),
            pmi,
            cqi,
            diagnostics,
        })
    }
}
