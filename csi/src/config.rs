//! CSI Report Configuration
//!
//! Strongly typed form of the CSI report configuration (TS 38.214 Section 5.2.1.4 and the
//! CodebookConfig IE of TS 38.331). The codebook family is a tagged union whose variants
//! carry only the fields that apply to them. [`CsiReportConfig::validate`] runs every
//! consistency check once, before any search starts.

use crate::codebook::etype2::ParamCombination;
use crate::codebook::restriction::beam_group_restriction_len;
use crate::cqi::CqiTable;
use crate::CsiError;
use bitflags::bitflags;
use common::{BandwidthPart, CarrierGrid};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Supported CSI-RS port counts
pub const SUPPORTED_PORTS: [usize; 8] = [1, 2, 4, 8, 12, 16, 24, 32];

/// (N1, N2) panel configurations for four or more ports (TS 38.214 Table 5.2.2.2.1-2)
pub const SINGLE_PANEL_LAYOUTS: [(u8, u8); 13] = [
    (2, 1),
    (2, 2),
    (4, 1),
    (3, 2),
    (6, 1),
    (4, 2),
    (8, 1),
    (4, 3),
    (6, 2),
    (12, 1),
    (4, 4),
    (8, 2),
    (16, 1),
];

/// (Ng, N1, N2) multi-panel configurations (TS 38.214 Table 5.2.2.2.2-1)
pub const MULTI_PANEL_LAYOUTS: [(u8, u8, u8); 8] = [
    (2, 2, 1),
    (2, 4, 1),
    (4, 2, 1),
    (2, 2, 2),
    (2, 8, 1),
    (4, 4, 1),
    (2, 4, 2),
    (4, 2, 2),
];

/// Smallest BWP for which subband reporting is defined
pub const MIN_SUBBAND_BWP_SIZE: u16 = 24;

/// Wideband or subband reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportingMode {
    #[default]
    Wideband,
    Subband,
}

/// Codebook mode (TS 38.331 codebookMode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum CodebookMode {
    #[default]
    Mode1 = 1,
    Mode2 = 2,
}

/// Report quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportQuantity {
    /// cri-RI-PMI-CQI
    #[default]
    CriRiPmiCqi,
    /// cri-RI-i1-CQI: only i1 is reported, CQI assumes a random i2 per PRG
    CriRiI1Cqi,
}

/// Objective used to pick the rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RiObjective {
    /// Maximize the total per-layer SINR above 0 dB
    #[default]
    MaxSinr,
    /// Maximize the spectral efficiency implied by the CQI
    MaxSe,
}

/// Codebook family tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodebookType {
    Type1SinglePanel,
    Type1MultiPanel,
    Type2,
    EnhancedType2,
}

impl fmt::Display for CodebookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodebookType::Type1SinglePanel => "Type I single-panel",
            CodebookType::Type1MultiPanel => "Type I multi-panel",
            CodebookType::Type2 => "Type II",
            CodebookType::EnhancedType2 => "enhanced Type II",
        };
        f.write_str(name)
    }
}

/// Antenna panel dimensions in dual-polarized elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelDims {
    /// Horizontal elements
    pub n1: u8,
    /// Vertical elements
    pub n2: u8,
}

impl PanelDims {
    pub fn new(n1: u8, n2: u8) -> Self {
        Self { n1, n2 }
    }

    /// Elements per polarization
    pub fn elements(&self) -> usize {
        self.n1 as usize * self.n2 as usize
    }

    /// Oversampling factors (O1, O2)
    pub fn oversampling(&self) -> (usize, usize) {
        (4, if self.n2 > 1 { 4 } else { 1 })
    }
}

impl Default for PanelDims {
    fn default() -> Self {
        Self { n1: 1, n2: 1 }
    }
}

/// Type I single-panel codebook configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SinglePanelConfig {
    /// Panel dimensions, (1, 1) for one or two ports
    pub panel: PanelDims,
    pub codebook_mode: CodebookMode,
    /// Beam bitmap, bit N2*O2*l + m enables v(l, m); six bits for two ports
    pub subset_restriction: Option<Vec<bool>>,
    /// Rank-1 i2 bitmap, bit i2 enables precoders with that i2
    pub i2_restriction: Option<Vec<bool>>,
}

/// Type I multi-panel codebook configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiPanelConfig {
    /// Number of panels
    pub ng: u8,
    /// Per-panel dimensions
    pub panel: PanelDims,
    pub codebook_mode: CodebookMode,
    /// Beam bitmap, bit N2*O2*l + m enables v(l, m)
    pub subset_restriction: Option<Vec<bool>>,
}

/// Type II codebook configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type2Config {
    pub panel: PanelDims,
    /// Number of combined beams L
    pub num_beams: u8,
    /// Phase alphabet size N_PSK
    pub phase_alphabet: u8,
    /// Report subband amplitudes
    pub subband_amplitude: bool,
    /// B1 then four B2 blocks, see [`crate::codebook::restriction`]
    pub subset_restriction: Option<Vec<bool>>,
}

/// Enhanced Type II codebook configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedType2Config {
    pub panel: PanelDims,
    /// paramCombination-r16 (1..=8)
    pub param_combination: u8,
    /// numberOfPMI-SubbandsPerCQI-Subband R (1 or 2)
    pub pmi_subbands_per_cqi_subband: u8,
    /// B1 then four B2 blocks, see [`crate::codebook::restriction`]
    pub subset_restriction: Option<Vec<bool>>,
}

/// Codebook family with its family-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CodebookConfig {
    Type1SinglePanel(SinglePanelConfig),
    Type1MultiPanel(MultiPanelConfig),
    Type2(Type2Config),
    EnhancedType2(EnhancedType2Config),
}

impl Default for CodebookConfig {
    fn default() -> Self {
        CodebookConfig::Type1SinglePanel(SinglePanelConfig::default())
    }
}

impl CodebookConfig {
    /// Family tag
    pub fn codebook_type(&self) -> CodebookType {
        match self {
            CodebookConfig::Type1SinglePanel(_) => CodebookType::Type1SinglePanel,
            CodebookConfig::Type1MultiPanel(_) => CodebookType::Type1MultiPanel,
            CodebookConfig::Type2(_) => CodebookType::Type2,
            CodebookConfig::EnhancedType2(_) => CodebookType::EnhancedType2,
        }
    }

    /// Highest rank the family defines for the given port count
    pub fn family_max_rank(&self, ports: usize) -> u8 {
        match self {
            CodebookConfig::Type1SinglePanel(_) => match ports {
                1 => 1,
                2 => 2,
                4 => 4,
                _ => 8,
            },
            CodebookConfig::Type1MultiPanel(_) => 4,
            CodebookConfig::Type2(_) => 2,
            CodebookConfig::EnhancedType2(cfg) => ParamCombination::from_index(cfg.param_combination)
                .map(|pc| pc.max_rank())
                .unwrap_or(4),
        }
    }

    /// Length of the rank restriction bitmap
    pub fn rank_restriction_len(&self, ports: usize) -> usize {
        match self {
            CodebookConfig::Type1SinglePanel(_) => match ports {
                1 => 1,
                2 => 2,
                4 => 4,
                _ => 8,
            },
            CodebookConfig::Type1MultiPanel(_) => 4,
            CodebookConfig::Type2(_) => 2,
            CodebookConfig::EnhancedType2(_) => 4,
        }
    }

    fn validate(&self, ports: usize) -> Result<(), CsiError> {
        match self {
            CodebookConfig::Type1SinglePanel(cfg) => validate_single_panel(cfg, ports),
            CodebookConfig::Type1MultiPanel(cfg) => validate_multi_panel(cfg, ports),
            CodebookConfig::Type2(cfg) => validate_type2(cfg, ports),
            CodebookConfig::EnhancedType2(cfg) => validate_enhanced_type2(cfg, ports),
        }
    }
}

bitflags! {
    /// Set of ranks a report may use
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RankSet: u8 {
        const RANK1 = 1 << 0;
        const RANK2 = 1 << 1;
        const RANK3 = 1 << 2;
        const RANK4 = 1 << 3;
        const RANK5 = 1 << 4;
        const RANK6 = 1 << 5;
        const RANK7 = 1 << 6;
        const RANK8 = 1 << 7;
    }
}

impl RankSet {
    /// Ranks 1 through `max_rank`
    pub fn up_to(max_rank: u8) -> Self {
        let max_rank = max_rank.min(8);
        if max_rank == 0 {
            return RankSet::empty();
        }
        RankSet::from_bits_truncate(((1u16 << max_rank) - 1) as u8)
    }

    /// Build from a restriction bitmap where bit i enables rank i + 1
    pub fn from_bitmap(bits: &[bool]) -> Self {
        bits.iter()
            .take(8)
            .enumerate()
            .filter(|(_, &enabled)| enabled)
            .fold(RankSet::empty(), |set, (i, _)| {
                set | RankSet::from_bits_truncate(1 << i)
            })
    }

    /// Ranks in increasing order
    pub fn ranks(&self) -> Vec<u8> {
        (1..=8u8)
            .filter(|&rank| self.bits() & (1 << (rank - 1)) != 0)
            .collect()
    }
}

/// CSI report configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiReportConfig {
    /// Carrier grid the channel estimate covers
    pub carrier: CarrierGrid,
    /// Bandwidth part the report refers to
    pub bwp: BandwidthPart,
    /// Codebook family and its parameters
    pub codebook: CodebookConfig,
    /// PMI reporting granularity
    pub pmi_mode: ReportingMode,
    /// CQI reporting granularity
    pub cqi_mode: ReportingMode,
    /// Subband size in RBs, required for subband reporting on BWPs of 24 RBs or more
    pub subband_size: Option<u16>,
    /// PRG size in RBs (2 or 4), used by the cri-RI-i1-CQI report quantity
    pub prg_size: Option<u16>,
    pub report_quantity: ReportQuantity,
    pub cqi_table: CqiTable,
    /// Rank restriction bitmap, bit i enables rank i + 1
    pub rank_restriction: Option<Vec<bool>>,
    pub ri_objective: RiObjective,
    /// Seed of the per-PRG random i2 draw
    pub prg_seed: u64,
}

impl CsiReportConfig {
    /// Create a configuration with default reporting settings: Type I single-panel,
    /// wideband PMI and CQI, codebook mode 1, CQI table 1, no restrictions
    pub fn new(carrier: CarrierGrid, bwp: BandwidthPart) -> Self {
        Self {
            carrier,
            bwp,
            codebook: CodebookConfig::default(),
            pmi_mode: ReportingMode::Wideband,
            cqi_mode: ReportingMode::Wideband,
            subband_size: None,
            prg_size: None,
            report_quantity: ReportQuantity::CriRiPmiCqi,
            cqi_table: CqiTable::Table1,
            rank_restriction: None,
            ri_objective: RiObjective::MaxSinr,
            prg_seed: 0,
        }
    }

    /// True when subbands actually partition the BWP for the given mode
    pub fn uses_subbands(&self, mode: ReportingMode) -> bool {
        mode == ReportingMode::Subband && self.bwp.n_size >= MIN_SUBBAND_BWP_SIZE
    }

    /// Ranks allowed by the codebook family, the antenna counts and the rank restriction
    pub fn valid_ranks(&self, ports: usize, rx_antennas: usize) -> RankSet {
        let max_rank = self
            .codebook
            .family_max_rank(ports)
            .min(ports.min(rx_antennas).min(8) as u8);
        let allowed = match &self.rank_restriction {
            Some(bits) => RankSet::from_bitmap(bits),
            None => RankSet::all(),
        };
        RankSet::up_to(max_rank) & allowed
    }

    /// Check the configuration for the given number of CSI-RS ports
    pub fn validate(&self, ports: usize) -> Result<(), CsiError> {
        if !self.carrier.contains(&self.bwp) {
            return Err(CsiError::InvalidConfiguration(format!(
                "BWP {:?} does not fit in carrier {:?}",
                self.bwp, self.carrier
            )));
        }

        if !SUPPORTED_PORTS.contains(&ports) {
            return Err(CsiError::InvalidConfiguration(format!(
                "Unsupported number of CSI-RS ports: {}",
                ports
            )));
        }

        self.codebook.validate(ports)?;

        let needs_subbands = self.uses_subbands(self.pmi_mode) || self.uses_subbands(self.cqi_mode);
        if needs_subbands {
            let size = self.subband_size.ok_or_else(|| {
                CsiError::InvalidConfiguration(
                    "Subband reporting requires a subband size".to_string(),
                )
            })?;
            crate::subband::check_subband_size(self.bwp.n_size, size)?;
        }

        if let Some(prg) = self.prg_size {
            if prg != 2 && prg != 4 {
                return Err(CsiError::InvalidConfiguration(format!(
                    "PRG size must be 2 or 4, got {}",
                    prg
                )));
            }
        }

        if self.report_quantity == ReportQuantity::CriRiI1Cqi {
            if self.codebook.codebook_type() != CodebookType::Type1SinglePanel {
                return Err(CsiError::InvalidConfiguration(
                    "cri-RI-i1-CQI requires the Type I single-panel codebook".to_string(),
                ));
            }
            if self.prg_size.is_none() {
                return Err(CsiError::InvalidConfiguration(
                    "cri-RI-i1-CQI requires a PRG size".to_string(),
                ));
            }
        }

        if let Some(bits) = &self.rank_restriction {
            let expected = self.codebook.rank_restriction_len(ports);
            if bits.len() != expected {
                return Err(CsiError::InvalidConfiguration(format!(
                    "Rank restriction must have {} bits for {} with {} ports, got {}",
                    expected,
                    self.codebook.codebook_type(),
                    ports,
                    bits.len()
                )));
            }
        }

        debug!(
            "Validated {} report configuration: {} ports, BWP {}+{}",
            self.codebook.codebook_type(),
            ports,
            self.bwp.n_start,
            self.bwp.n_size
        );
        Ok(())
    }
}

fn check_bitmap_len(name: &str, bits: &Option<Vec<bool>>, expected: usize) -> Result<(), CsiError> {
    match bits {
        Some(bits) if bits.len() != expected => Err(CsiError::InvalidConfiguration(format!(
            "{} must have {} bits, got {}",
            name,
            expected,
            bits.len()
        ))),
        _ => Ok(()),
    }
}

fn check_panel(panel: &PanelDims, ports: usize) -> Result<(), CsiError> {
    if !SINGLE_PANEL_LAYOUTS.contains(&(panel.n1, panel.n2)) || 2 * panel.elements() != ports {
        return Err(CsiError::InvalidConfiguration(format!(
            "Panel dimensions ({}, {}) are not valid for {} ports",
            panel.n1, panel.n2, ports
        )));
    }
    Ok(())
}

fn validate_single_panel(cfg: &SinglePanelConfig, ports: usize) -> Result<(), CsiError> {
    if ports <= 2 {
        if cfg.panel != PanelDims::default() {
            return Err(CsiError::InvalidConfiguration(format!(
                "Panel dimensions must be (1, 1) for {} ports",
                ports
            )));
        }
        if cfg.codebook_mode != CodebookMode::Mode1 {
            return Err(CsiError::InvalidConfiguration(
                "Codebook mode 2 requires at least four ports".to_string(),
            ));
        }
        let csr_len = if ports == 2 { 6 } else { 1 };
        check_bitmap_len("Codebook subset restriction", &cfg.subset_restriction, csr_len)?;
    } else {
        check_panel(&cfg.panel, ports)?;
        let (o1, o2) = cfg.panel.oversampling();
        let csr_len = cfg.panel.n1 as usize * o1 * cfg.panel.n2 as usize * o2;
        check_bitmap_len("Codebook subset restriction", &cfg.subset_restriction, csr_len)?;
    }
    check_bitmap_len("i2 restriction", &cfg.i2_restriction, 16)
}

fn validate_multi_panel(cfg: &MultiPanelConfig, ports: usize) -> Result<(), CsiError> {
    let layout = (cfg.ng, cfg.panel.n1, cfg.panel.n2);
    if !MULTI_PANEL_LAYOUTS.contains(&layout)
        || 2 * cfg.ng as usize * cfg.panel.elements() != ports
    {
        return Err(CsiError::InvalidConfiguration(format!(
            "Multi-panel layout (Ng={}, N1={}, N2={}) is not valid for {} ports",
            cfg.ng, cfg.panel.n1, cfg.panel.n2, ports
        )));
    }
    if cfg.codebook_mode == CodebookMode::Mode2 && cfg.ng != 2 {
        return Err(CsiError::InvalidConfiguration(
            "Multi-panel codebook mode 2 requires two panels".to_string(),
        ));
    }
    let (o1, o2) = cfg.panel.oversampling();
    let csr_len = cfg.panel.n1 as usize * o1 * cfg.panel.n2 as usize * o2;
    check_bitmap_len("Codebook subset restriction", &cfg.subset_restriction, csr_len)
}

fn validate_type2(cfg: &Type2Config, ports: usize) -> Result<(), CsiError> {
    check_panel(&cfg.panel, ports)?;
    if !(2..=4).contains(&cfg.num_beams) || cfg.num_beams as usize > cfg.panel.elements() {
        return Err(CsiError::InvalidConfiguration(format!(
            "Type II beam count {} is not valid for panel ({}, {})",
            cfg.num_beams, cfg.panel.n1, cfg.panel.n2
        )));
    }
    if cfg.phase_alphabet != 4 && cfg.phase_alphabet != 8 {
        return Err(CsiError::InvalidConfiguration(format!(
            "Type II phase alphabet must be 4 or 8, got {}",
            cfg.phase_alphabet
        )));
    }
    check_bitmap_len(
        "Codebook subset restriction",
        &cfg.subset_restriction,
        beam_group_restriction_len(&cfg.panel),
    )
}

fn validate_enhanced_type2(cfg: &EnhancedType2Config, ports: usize) -> Result<(), CsiError> {
    check_panel(&cfg.panel, ports)?;
    let combination = ParamCombination::from_index(cfg.param_combination).ok_or_else(|| {
        CsiError::InvalidConfiguration(format!(
            "paramCombination must be 1..=8, got {}",
            cfg.param_combination
        ))
    })?;
    if ports == 4 && cfg.param_combination > 2 {
        return Err(CsiError::InvalidConfiguration(format!(
            "paramCombination {} is not supported with 4 ports",
            cfg.param_combination
        )));
    }
    if ports < 32 && cfg.param_combination > 6 {
        return Err(CsiError::InvalidConfiguration(format!(
            "paramCombination {} requires 32 ports",
            cfg.param_combination
        )));
    }
    if combination.num_beams as usize > cfg.panel.elements() {
        return Err(CsiError::InvalidConfiguration(format!(
            "paramCombination {} needs {} beams but the panel has {} elements",
            cfg.param_combination,
            combination.num_beams,
            cfg.panel.elements()
        )));
    }
    if cfg.pmi_subbands_per_cqi_subband != 1 && cfg.pmi_subbands_per_cqi_subband != 2 {
        return Err(CsiError::InvalidConfiguration(format!(
            "PMI subbands per CQI subband must be 1 or 2, got {}",
            cfg.pmi_subbands_per_cqi_subband
        )));
    }
    check_bitmap_len(
        "Codebook subset restriction",
        &cfg.subset_restriction,
        beam_group_restriction_len(&cfg.panel),
    )
}
