//! CSI Feedback Engine
//!
//! This crate computes downlink channel state information feedback for 5G NR: the rank
//! indicator (RI), precoding matrix indicator (PMI) and channel quality indicator (CQI)
//! according to 3GPP TS 38.214 Sections 5.2.2.1 and 5.2.2.2.
//!
//! The search runs bottom-up: [`subband`] partitions the bandwidth part, [`codebook`]
//! builds the candidate precoders, [`sinr`] evaluates them against the channel estimate,
//! [`pmi`] picks the precoders, [`ri`] picks the rank and [`cqi`] maps the achieved SINR
//! to a CQI index. [`report`] ties the stages together for one scheduling opportunity.

pub mod config;
pub mod subband;
pub mod rs;
pub mod channel;
pub mod codebook;
pub mod quantizer;
pub mod sinr;
pub mod pmi;
pub mod ri;
pub mod cqi;
pub mod report;

// Re-export commonly used types
pub use config::{
    CodebookConfig, CodebookMode, CodebookType, CsiReportConfig, EnhancedType2Config,
    MultiPanelConfig, PanelDims, RankSet, ReportQuantity, ReportingMode, RiObjective,
    SinglePanelConfig, Type2Config,
};
pub use channel::{ChannelEstimate, ReSample};
pub use codebook::{PmiIndices, Precoder, RealizedCodebook, SubbandI2};
pub use cqi::{CqiReport, CqiTable, LinkQuality, LinkQualityModel, SinrThresholdTable};
pub use report::{CsiDiagnostics, CsiReport, CsiReporter};
pub use rs::{CsiRsGrid, CsiRsPower, CsiRsResource, ReIndex};
pub use subband::SubbandInfo;

use interfaces::InterfaceError;
use thiserror::Error;

/// Errors raised by the CSI engine
///
/// Only caller bugs are errors. Missing reference signals, non-finite channel samples and
/// fully restricted codebooks are reported through `None` values in the report instead.
#[derive(Error, Debug)]
pub enum CsiError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),
}
