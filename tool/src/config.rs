//! Report Configuration Files
//!
//! File form of a CSI report configuration. YAML and TOML are both accepted and share the
//! same field names; everything except the carrier grid has a default.

use anyhow::{anyhow, bail, Context, Result};
use common::{BandwidthPart, CarrierGrid};
use csi::{
    CodebookConfig, CodebookMode, CqiTable, CsiReportConfig, EnhancedType2Config,
    MultiPanelConfig, PanelDims, ReportQuantity, ReportingMode, RiObjective, SinglePanelConfig,
    Type2Config,
};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportFileConfig {
    pub carrier: CarrierFileConfig,
    /// Defaults to the whole carrier
    #[serde(default)]
    pub bwp: Option<BwpFileConfig>,
    #[serde(default)]
    pub codebook: CodebookFileConfig,
    #[serde(default)]
    pub pmi_mode: ModeName,
    #[serde(default)]
    pub cqi_mode: ModeName,
    #[serde(default)]
    pub subband_size: Option<u16>,
    #[serde(default)]
    pub prg_size: Option<u16>,
    #[serde(default)]
    pub report_quantity: QuantityName,
    #[serde(default = "default_cqi_table")]
    pub cqi_table: u8,
    /// Rank restriction bitmap, bit 0 enables rank 1
    #[serde(default)]
    pub rank_restriction: Option<String>,
    #[serde(default)]
    pub ri_objective: ObjectiveName,
    #[serde(default)]
    pub prg_seed: u64,
}

fn default_cqi_table() -> u8 {
    1
}

/// Carrier grid
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct CarrierFileConfig {
    #[serde(default)]
    pub n_start_grid: u16,
    pub n_size_grid: u16,
}

/// Bandwidth part
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BwpFileConfig {
    pub n_start: u16,
    pub n_size: u16,
}

/// Codebook section, tagged by `type`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodebookFileConfig {
    Type1SinglePanel {
        #[serde(default = "default_panel")]
        panel: [u8; 2],
        #[serde(default = "default_codebook_mode")]
        codebook_mode: u8,
        #[serde(default)]
        subset_restriction: Option<String>,
        #[serde(default)]
        i2_restriction: Option<String>,
    },
    Type1MultiPanel {
        ng: u8,
        panel: [u8; 2],
        #[serde(default = "default_codebook_mode")]
        codebook_mode: u8,
        #[serde(default)]
        subset_restriction: Option<String>,
    },
    Type2 {
        panel: [u8; 2],
        num_beams: u8,
        #[serde(default = "default_phase_alphabet")]
        phase_alphabet: u8,
        #[serde(default)]
        subband_amplitude: bool,
        #[serde(default)]
        subset_restriction: Option<String>,
    },
    EnhancedType2 {
        panel: [u8; 2],
        param_combination: u8,
        #[serde(default = "default_pmi_subbands")]
        pmi_subbands_per_cqi_subband: u8,
        #[serde(default)]
        subset_restriction: Option<String>,
    },
}

impl Default for CodebookFileConfig {
    fn default() -> Self {
        CodebookFileConfig::Type1SinglePanel {
            panel: default_panel(),
            codebook_mode: default_codebook_mode(),
            subset_restriction: None,
            i2_restriction: None,
        }
    }
}

fn default_panel() -> [u8; 2] {
    [1, 1]
}

fn default_codebook_mode() -> u8 {
    1
}

fn default_phase_alphabet() -> u8 {
    8
}

fn default_pmi_subbands() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeName {
    #[default]
    Wideband,
    Subband,
}

impl From<ModeName> for ReportingMode {
    fn from(mode: ModeName) -> Self {
        match mode {
            ModeName::Wideband => ReportingMode::Wideband,
            ModeName::Subband => ReportingMode::Subband,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuantityName {
    #[default]
    CriRiPmiCqi,
    CriRiI1Cqi,
}

/// RI objective as written in files and on the command line
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectiveName {
    #[default]
    MaxSinr,
    MaxSe,
}

impl From<ObjectiveName> for RiObjective {
    fn from(objective: ObjectiveName) -> Self {
        match objective {
            ObjectiveName::MaxSinr => RiObjective::MaxSinr,
            ObjectiveName::MaxSe => RiObjective::MaxSe,
        }
    }
}

impl ReportFileConfig {
    /// Load from a YAML or TOML file, chosen by extension
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let config = match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml(&text)?,
            Some("toml") => Self::from_toml(&text)?,
            other => bail!("Unsupported configuration format {:?}, use .yaml or .toml", other),
        };
        info!("Loaded report configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("Invalid YAML configuration")
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid TOML configuration")
    }

    /// Convert into the engine configuration
    pub fn into_report_config(self) -> Result<CsiReportConfig> {
        let carrier = CarrierGrid::new(self.carrier.n_start_grid, self.carrier.n_size_grid)
            .ok_or_else(|| anyhow!("Invalid carrier grid {:?}", self.carrier))?;
        let bwp = match self.bwp {
            Some(bwp) => BandwidthPart::new(bwp.n_start, bwp.n_size)
                .ok_or_else(|| anyhow!("Invalid bandwidth part {:?}", bwp))?,
            None => BandwidthPart::new(carrier.n_start_grid, carrier.n_size_grid)
                .ok_or_else(|| anyhow!("Carrier {:?} is not a valid bandwidth part", carrier))?,
        };

        let mut config = CsiReportConfig::new(carrier, bwp);
        config.codebook = self.codebook.into_codebook_config()?;
        config.pmi_mode = self.pmi_mode.into();
        config.cqi_mode = self.cqi_mode.into();
        config.subband_size = self.subband_size;
        config.prg_size = self.prg_size;
        config.report_quantity = match self.report_quantity {
            QuantityName::CriRiPmiCqi => ReportQuantity::CriRiPmiCqi,
            QuantityName::CriRiI1Cqi => ReportQuantity::CriRiI1Cqi,
        };
        config.cqi_table = CqiTable::from_u8(self.cqi_table)
            .ok_or_else(|| anyhow!("Unknown CQI table {}", self.cqi_table))?;
        config.rank_restriction = self.rank_restriction.as_deref().map(parse_bits).transpose()?;
        config.ri_objective = self.ri_objective.into();
        config.prg_seed = self.prg_seed;
        Ok(config)
    }
}

impl CodebookFileConfig {
    fn into_codebook_config(self) -> Result<CodebookConfig> {
        let config = match self {
            CodebookFileConfig::Type1SinglePanel { panel, codebook_mode, subset_restriction, i2_restriction } => {
                CodebookConfig::Type1SinglePanel(SinglePanelConfig {
                    panel: PanelDims::new(panel[0], panel[1]),
                    codebook_mode: codebook_mode_from(codebook_mode)?,
                    subset_restriction: subset_restriction.as_deref().map(parse_bits).transpose()?,
                    i2_restriction: i2_restriction.as_deref().map(parse_bits).transpose()?,
                })
            }
            CodebookFileConfig::Type1MultiPanel { ng, panel, codebook_mode, subset_restriction } => {
                CodebookConfig::Type1MultiPanel(MultiPanelConfig {
                    ng,
                    panel: PanelDims::new(panel[0], panel[1]),
                    codebook_mode: codebook_mode_from(codebook_mode)?,
                    subset_restriction: subset_restriction.as_deref().map(parse_bits).transpose()?,
                })
            }
            CodebookFileConfig::Type2 { panel, num_beams, phase_alphabet, subband_amplitude, subset_restriction } => {
                CodebookConfig::Type2(Type2Config {
                    panel: PanelDims::new(panel[0], panel[1]),
                    num_beams,
                    phase_alphabet,
                    subband_amplitude,
                    subset_restriction: subset_restriction.as_deref().map(parse_bits).transpose()?,
                })
            }
            CodebookFileConfig::EnhancedType2 {
                panel,
                param_combination,
                pmi_subbands_per_cqi_subband,
                subset_restriction,
            } => CodebookConfig::EnhancedType2(EnhancedType2Config {
                panel: PanelDims::new(panel[0], panel[1]),
                param_combination,
                pmi_subbands_per_cqi_subband,
                subset_restriction: subset_restriction.as_deref().map(parse_bits).transpose()?,
            }),
        };
        Ok(config)
    }
}

fn codebook_mode_from(mode: u8) -> Result<CodebookMode> {
    CodebookMode::from_u8(mode).ok_or_else(|| anyhow!("Unknown codebook mode {}", mode))
}

/// Parse a bitmap written as a string of 0/1 characters, bit 0 first
///
/// Underscores and whitespace are ignored so long bitmaps can be grouped.
pub fn parse_bits(text: &str) -> Result<Vec<bool>> {
    text.chars()
        .filter(|c| *c != '_' && !c.is_whitespace())
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            other => Err(anyhow!("Invalid bitmap character {:?}", other)),
        })
        .collect()
}
