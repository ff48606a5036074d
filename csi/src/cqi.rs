//! CQI Selection
//!
//! Maps the SINR achieved by the selected rank and precoders to CQI indices.
//! Based on 3GPP TS 38.214 Section 5.2.2.1 (Tables 5.2.2.1-2 to 5.2.2.1-5)

use crate::channel::{ChannelEstimate, ReSample};
use crate::config::CsiReportConfig;
use crate::pmi::pmi_for_rank;
use crate::report::Measurement;
use crate::rs::CsiRsGrid;
use crate::subband::SubbandInfo;
use crate::CsiError;
use common::utils::{finite_mean, linear_to_db};
use common::BandwidthPart;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Highest CQI index
pub const MAX_CQI: u8 = 15;

/// Extra margin of the default table 3 thresholds
const TABLE3_MARGIN_DB: f64 = 2.0;

/// Default thresholds for table 1, in dB
const TABLE1_THRESHOLDS_DB: [f64; 15] = [
    -6.7, -4.7, -2.3, 0.2, 2.4, 4.3, 5.9, 8.1, 10.3, 11.7, 14.1, 16.3, 18.7, 21.0, 22.7,
];

/// Default thresholds for table 2, in dB
const TABLE2_THRESHOLDS_DB: [f64; 15] = [
    -6.7, -2.3, 2.4, 5.9, 8.1, 10.3, 11.7, 14.1, 16.3, 18.7, 21.0, 22.7, 24.8, 27.0, 29.0,
];

/// Default thresholds for table 3 before the margin, in dB
const TABLE3_THRESHOLDS_DB: [f64; 15] = [
    -10.5, -8.5, -6.7, -4.7, -2.3, 0.2, 2.4, 4.3, 5.9, 8.1, 10.3, 11.7, 14.1, 16.3, 18.7,
];

/// Modulation of a CQI entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Modulation {
    Qpsk,
    Qam16,
    Qam64,
    Qam256,
}

impl Modulation {
    pub fn bits_per_symbol(&self) -> u8 {
        match self {
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
            Modulation::Qam256 => 8,
        }
    }
}

/// One row of a CQI table
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CqiEntry {
    pub modulation: Modulation,
    /// Code rate x 1024
    pub code_rate: u16,
    /// Bits per resource element
    pub efficiency: f64,
}

const fn entry(modulation: Modulation, code_rate: u16, efficiency: f64) -> CqiEntry {
    CqiEntry { modulation, code_rate, efficiency }
}

use Modulation::{Qam16, Qam256, Qam64, Qpsk};

/// Table 5.2.2.1-2, CQI 1..=15
const TABLE1: [CqiEntry; 15] = [
    entry(Qpsk, 78, 0.1523),
    entry(Qpsk, 120, 0.2344),
    entry(Qpsk, 193, 0.3770),
    entry(Qpsk, 308, 0.6016),
    entry(Qpsk, 449, 0.8770),
    entry(Qpsk, 602, 1.1758),
    entry(Qam16, 378, 1.4766),
    entry(Qam16, 490, 1.9141),
    entry(Qam16, 616, 2.4063),
    entry(Qam64, 466, 2.7305),
    entry(Qam64, 567, 3.3223),
    entry(Qam64, 666, 3.9023),
    entry(Qam64, 772, 4.5234),
    entry(Qam64, 873, 5.1152),
    entry(Qam64, 948, 5.5547),
];

/// Table 5.2.2.1-3, CQI 1..=15
const TABLE2: [CqiEntry; 15] = [
    entry(Qpsk, 78, 0.1523),
    entry(Qpsk, 193, 0.3770),
    entry(Qpsk, 449, 0.8770),
    entry(Qam16, 378, 1.4766),
    entry(Qam16, 490, 1.9141),
    entry(Qam16, 616, 2.4063),
    entry(Qam64, 466, 2.7305),
    entry(Qam64, 567, 3.3223),
    entry(Qam64, 666, 3.9023),
    entry(Qam64, 772, 4.5234),
    entry(Qam64, 873, 5.1152),
    entry(Qam256, 711, 5.5547),
    entry(Qam256, 797, 6.2266),
    entry(Qam256, 885, 6.9141),
    entry(Qam256, 948, 7.4063),
];

/// Table 5.2.2.1-4, CQI 1..=15
const TABLE3: [CqiEntry; 15] = [
    entry(Qpsk, 30, 0.0586),
    entry(Qpsk, 50, 0.0977),
    entry(Qpsk, 78, 0.1523),
    entry(Qpsk, 120, 0.2344),
    entry(Qpsk, 193, 0.3770),
    entry(Qpsk, 308, 0.6016),
    entry(Qpsk, 449, 0.8770),
    entry(Qpsk, 602, 1.1758),
    entry(Qam16, 378, 1.4766),
    entry(Qam16, 490, 1.9141),
    entry(Qam16, 616, 2.4063),
    entry(Qam64, 466, 2.7305),
    entry(Qam64, 567, 3.3223),
    entry(Qam64, 666, 3.9023),
    entry(Qam64, 772, 4.5234),
];

/// CQI table in use
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, FromPrimitive, ToPrimitive,
)]
pub enum CqiTable {
    #[default]
    Table1 = 1,
    Table2 = 2,
    Table3 = 3,
}

impl CqiTable {
    /// Rows for CQI 1..=15; CQI 0 is out of range
    pub fn entries(&self) -> &'static [CqiEntry; 15] {
        match self {
            CqiTable::Table1 => &TABLE1,
            CqiTable::Table2 => &TABLE2,
            CqiTable::Table3 => &TABLE3,
        }
    }

    /// Row of a CQI index, `None` for CQI 0
    pub fn entry(&self, cqi: u8) -> Option<&'static CqiEntry> {
        cqi.checked_sub(1).and_then(|i| self.entries().get(i as usize))
    }

    /// Spectral efficiency of a CQI index, zero for CQI 0
    pub fn efficiency(&self, cqi: u8) -> f64 {
        self.entry(cqi).map(|e| e.efficiency).unwrap_or(0.0)
    }

    /// Target transport block error probability
    pub fn bler_target(&self) -> f64 {
        match self {
            CqiTable::Table1 | CqiTable::Table2 => 0.1,
            CqiTable::Table3 => 0.00001,
        }
    }
}

impl fmt::Display for CqiTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqiTable::Table1 => write!(f, "table1"),
            CqiTable::Table2 => write!(f, "table2"),
            CqiTable::Table3 => write!(f, "table3"),
        }
    }
}

/// Link quality estimated for one codeword
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkQuality {
    pub cqi: u8,
    pub effective_sinr_db: f64,
    /// Estimated block error rate at `cqi`
    pub bler: f64,
}

/// SINR to CQI mapping
///
/// Receives the per-RE SINR of the layers of one codeword and returns the highest CQI
/// whose block error rate meets the target of the table.
pub trait LinkQualityModel {
    fn estimate(&self, bwp: &BandwidthPart, table: CqiTable, re_sinr: &[Vec<f64>]) -> LinkQuality;
}

/// CQI lookup against 15 monotone SINR thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinrThresholdTable {
    thresholds_db: [f64; 15],
}

impl SinrThresholdTable {
    /// Thresholds for CQI 1..=15, `None` unless finite and non-decreasing
    pub fn new(thresholds_db: [f64; 15]) -> Option<Self> {
        let valid = thresholds_db.iter().all(|t| t.is_finite())
            && thresholds_db.windows(2).all(|w| w[0] <= w[1]);
        valid.then_some(Self { thresholds_db })
    }

    /// Built-in thresholds for a CQI table
    pub fn default_for(table: CqiTable) -> Self {
        let thresholds_db = match table {
            CqiTable::Table1 => TABLE1_THRESHOLDS_DB,
            CqiTable::Table2 => TABLE2_THRESHOLDS_DB,
            CqiTable::Table3 => TABLE3_THRESHOLDS_DB.map(|t| t + TABLE3_MARGIN_DB),
        };
        Self { thresholds_db }
    }

    pub fn thresholds_db(&self) -> &[f64; 15] {
        &self.thresholds_db
    }

    /// Number of thresholds met by an SINR in dB
    pub fn lookup(&self, sinr_db: f64) -> u8 {
        self.thresholds_db.iter().filter(|&&t| t <= sinr_db).count() as u8
    }
}

impl Default for SinrThresholdTable {
    fn default() -> Self {
        Self::default_for(CqiTable::Table1)
    }
}

impl LinkQualityModel for SinrThresholdTable {
    fn estimate(&self, _bwp: &BandwidthPart, table: CqiTable, re_sinr: &[Vec<f64>]) -> LinkQuality {
        let mean = finite_mean(re_sinr.iter().flatten().copied()).unwrap_or(0.0);
        let effective_sinr_db = linear_to_db(mean);
        let cqi = self.lookup(effective_sinr_db);
        LinkQuality {
            cqi,
            effective_sinr_db,
            bler: if cqi >= 1 { table.bler_target() } else { 1.0 },
        }
    }
}

/// Layers of each codeword: one codeword up to rank 4, two beyond
pub fn codeword_layers(rank: u8) -> Vec<usize> {
    let rank = rank as usize;
    if rank <= 4 {
        vec![rank]
    } else {
        vec![rank / 2, rank - rank / 2]
    }
}

/// Differential subband CQI: 0 same, 1 one higher, 2 two or more higher, 3 lower
pub fn differential_cqi(subband: u8, wideband: u8) -> u8 {
    match subband as i16 - wideband as i16 {
        0 => 0,
        1 => 1,
        d if d >= 2 => 2,
        _ => 3,
    }
}

/// CQI matrix of one report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CqiReport {
    /// Row 0 holds the wideband CQI, rows 1..=N the differential subband CQI; one column
    /// per codeword. `None` where the CQI is not reported.
    pub rows: Vec<Vec<Option<u8>>>,
    pub codeword_layers: Vec<usize>,
    /// Wideband link quality per codeword
    pub wideband: Vec<Option<LinkQuality>>,
    /// Absolute subband CQI per subband and codeword
    #[serde(skip)]
    pub subband_absolute: Vec<Vec<Option<u8>>>,
}

impl CqiReport {
    /// All cells `None`, shaped for the given subband count (0 in wideband mode)
    pub fn not_reported(num_subbands: usize, codewords: usize) -> Self {
        Self {
            rows: vec![vec![None; codewords]; 1 + num_subbands],
            codeword_layers: Vec::new(),
            wideband: vec![None; codewords],
            subband_absolute: vec![vec![None; codewords]; num_subbands],
        }
    }

    pub fn num_codewords(&self) -> usize {
        self.rows.first().map(|r| r.len()).unwrap_or(0)
    }

    /// Wideband CQI per codeword
    pub fn wideband_cqi(&self) -> Vec<Option<u8>> {
        self.rows.first().cloned().unwrap_or_default()
    }

    /// Sum over codewords of layers x (1 - BLER) x efficiency of the wideband CQI
    pub fn spectral_efficiency(&self, table: CqiTable) -> Option<f64> {
        if self.codeword_layers.is_empty() {
            return None;
        }
        self.codeword_layers
            .iter()
            .zip(&self.wideband)
            .map(|(&layers, quality)| {
                quality.map(|q| layers as f64 * (1.0 - q.bler) * table.efficiency(q.cqi))
            })
            .sum()
    }
}

/// CQI from the per-RE, per-layer SINR of the selected precoders
///
/// `partition` is the CQI subband partition; subband rows are only produced when
/// `subband_cqi` is set.
#[allow(clippy::too_many_arguments)]
pub fn cqi_from_sinr<M: LinkQualityModel + ?Sized>(
    model: &M,
    bwp: &BandwidthPart,
    table: CqiTable,
    samples: &[ReSample],
    re_sinr: &[Vec<f64>],
    partition: &SubbandInfo,
    subband_cqi: bool,
    rank: u8,
) -> CqiReport {
    let layers = codeword_layers(rank);
    let num_subbands = if subband_cqi { partition.num_subbands() } else { 0 };
    if samples.is_empty() || re_sinr.len() != samples.len() || rank == 0 {
        return CqiReport::not_reported(num_subbands, layers.len());
    }

    // Per-RE SINR restricted to the layers of each codeword
    let mut first_layer = 0;
    let per_codeword: Vec<Vec<Vec<f64>>> = layers
        .iter()
        .map(|&count| {
            let range = first_layer..first_layer + count;
            first_layer += count;
            re_sinr.iter().map(|v| v.get(range.clone()).unwrap_or_default().to_vec()).collect()
        })
        .collect();

    let wideband: Vec<Option<LinkQuality>> = per_codeword
        .iter()
        .map(|cw| Some(model.estimate(bwp, table, cw)))
        .collect();

    let mut rows = vec![wideband.iter().map(|q| q.map(|q| q.cqi)).collect::<Vec<_>>()];
    let mut subband_absolute = Vec::with_capacity(num_subbands);
    for sb in 0..num_subbands {
        let members: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| partition.subband_of_rb(s.rb) == Some(sb))
            .map(|(i, _)| i)
            .collect();
        let absolute: Vec<Option<u8>> = per_codeword
            .iter()
            .map(|cw| {
                if members.is_empty() {
                    return None;
                }
                let subset: Vec<Vec<f64>> = members.iter().map(|&i| cw[i].clone()).collect();
                Some(model.estimate(bwp, table, &subset).cqi)
            })
            .collect();
        trace!("Subband {} absolute CQI {:?}", sb, absolute);
        rows.push(
            absolute
                .iter()
                .zip(&wideband)
                .map(|(sb_cqi, wb)| Some(differential_cqi((*sb_cqi)?, wb.as_ref()?.cqi)))
                .collect(),
        );
        subband_absolute.push(absolute);
    }

    debug!("Wideband CQI {:?} over {} subbands", rows[0], num_subbands);
    CqiReport {
        rows,
        codeword_layers: layers,
        wideband,
        subband_absolute,
    }
}

/// CQI for an externally fixed rank, with the PMI selected for that rank
pub fn select_cqi<M: LinkQualityModel + ?Sized>(
    config: &CsiReportConfig,
    model: &M,
    channel: &ChannelEstimate,
    csirs: &CsiRsGrid,
    rank: u8,
    noise_variance: f64,
) -> Result<CqiReport, CsiError> {
    let measurement = Measurement::prepare(config, channel, csirs, noise_variance)?;
    let outcome = pmi_for_rank(config, &measurement, rank);
    let subband_cqi = config.uses_subbands(config.cqi_mode);
    if outcome.selection.is_none() {
        let subbands = if subband_cqi { measurement.cqi_subbands.num_subbands() } else { 0 };
        return Ok(CqiReport::not_reported(subbands, codeword_layers(rank).len()));
    }
    Ok(cqi_from_sinr(
        model,
        &config.bwp,
        config.cqi_table,
        &measurement.samples,
        &outcome.re_sinr,
        &measurement.cqi_subbands,
        subband_cqi,
        rank,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_traits::FromPrimitive;

    fn bwp() -> BandwidthPart {
        BandwidthPart::new(0, 24).unwrap()
    }

    fn samples_on_rbs(rbs: &[usize]) -> Vec<ReSample> {
        rbs.iter()
            .map(|&rb| ReSample {
                subcarrier: rb * 12,
                symbol: 5,
                rb,
                h: nalgebra::DMatrix::zeros(1, 1),
            })
            .collect()
    }

    #[test]
    fn test_tables() {
        assert_eq!(CqiTable::Table1.entry(0), None);
        assert_eq!(CqiTable::Table1.entry(15).unwrap().code_rate, 948);
        assert_eq!(CqiTable::Table2.entry(15).unwrap().modulation, Modulation::Qam256);
        assert_relative_eq!(CqiTable::Table3.efficiency(1), 0.0586);
        assert_eq!(CqiTable::Table3.bler_target(), 0.00001);
        assert_eq!(CqiTable::from_u8(2), Some(CqiTable::Table2));
        for table in [CqiTable::Table1, CqiTable::Table2, CqiTable::Table3] {
            assert!(table.entries().windows(2).all(|w| w[0].efficiency < w[1].efficiency));
        }
    }

    #[test]
    fn test_threshold_table() {
        assert!(SinrThresholdTable::new([0.0; 15]).is_some());
        let mut decreasing = TABLE1_THRESHOLDS_DB;
        decreasing[3] = -20.0;
        assert!(SinrThresholdTable::new(decreasing).is_none());

        let table = SinrThresholdTable::default();
        assert_eq!(table.lookup(-10.0), 0);
        assert_eq!(table.lookup(-6.7), 1);
        assert_eq!(table.lookup(100.0), MAX_CQI);

        let t3 = SinrThresholdTable::default_for(CqiTable::Table3);
        assert_relative_eq!(t3.thresholds_db()[0], -8.5, epsilon = 1e-12);
    }

    #[test]
    fn test_estimate() {
        let table = SinrThresholdTable::default();
        // Mean linear SINR 10 -> 10 dB -> 8 thresholds met
        let quality = table.estimate(&bwp(), CqiTable::Table1, &[vec![5.0], vec![15.0]]);
        assert_relative_eq!(quality.effective_sinr_db, 10.0, epsilon = 1e-9);
        assert_eq!(quality.cqi, 8);
        assert_relative_eq!(quality.bler, 0.1);

        let quality = table.estimate(&bwp(), CqiTable::Table1, &[vec![0.01]]);
        assert_eq!(quality.cqi, 0);
        assert_relative_eq!(quality.bler, 1.0);
    }

    #[test]
    fn test_codeword_split() {
        assert_eq!(codeword_layers(1), vec![1]);
        assert_eq!(codeword_layers(4), vec![4]);
        assert_eq!(codeword_layers(5), vec![2, 3]);
        assert_eq!(codeword_layers(8), vec![4, 4]);
    }

    #[test]
    fn test_differential_mapping() {
        assert_eq!(differential_cqi(7, 7), 0);
        assert_eq!(differential_cqi(8, 7), 1);
        assert_eq!(differential_cqi(9, 7), 2);
        assert_eq!(differential_cqi(15, 7), 2);
        assert_eq!(differential_cqi(6, 7), 3);
        assert_eq!(differential_cqi(0, 7), 3);
    }

    #[test]
    fn test_subband_cqi() {
        let model = SinrThresholdTable::default();
        let partition = SubbandInfo { sizes: vec![8, 8, 8] };
        // Subband 0 strong, subband 1 weak, subband 2 without CSI-RS
        let samples = samples_on_rbs(&[0, 8, 9, 10, 11]);
        let re_sinr = vec![vec![100.0], vec![1.0], vec![1.0], vec![1.0], vec![1.0]];
        let report = cqi_from_sinr(&model, &bwp(), CqiTable::Table1, &samples, &re_sinr, &partition, true, 1);

        assert_eq!(report.rows.len(), 4);
        // Wideband 13.2 dB -> 10, subband 0 at 20 dB -> 13, subband 1 at 0 dB -> 3
        assert_eq!(report.rows[0], vec![Some(10)]);
        assert_eq!(report.rows[1], vec![Some(2)]);
        assert_eq!(report.rows[2], vec![Some(3)]);
        assert_eq!(report.rows[3], vec![None]);
        assert_eq!(report.subband_absolute[0], vec![Some(13)]);
        assert_eq!(report.subband_absolute[2], vec![None]);
    }

    #[test]
    fn test_not_reported_shape() {
        let report = CqiReport::not_reported(3, 1);
        assert_eq!(report.rows.len(), 4);
        assert!(report.rows.iter().flatten().all(|c| c.is_none()));
        assert_eq!(report.spectral_efficiency(CqiTable::Table1), None);
    }

    #[test]
    fn test_spectral_efficiency() {
        let model = SinrThresholdTable::default();
        let partition = SubbandInfo { sizes: vec![24] };
        let samples = samples_on_rbs(&[0, 1, 2, 3, 4]);
        let re_sinr = vec![vec![1000.0; 6]; 5];
        let report = cqi_from_sinr(&model, &bwp(), CqiTable::Table1, &samples, &re_sinr, &partition, false, 6);
        assert_eq!(report.codeword_layers, vec![3, 3]);
        assert_eq!(report.rows, vec![vec![Some(15), Some(15)]]);
        let expected = 6.0 * 0.9 * 5.5547;
        assert_relative_eq!(report.spectral_efficiency(CqiTable::Table1).unwrap(), expected, epsilon = 1e-9);
    }
}
