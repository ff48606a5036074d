//! Codebooks
//!
//! Candidate precoders of the four codebook families and their PMI index sets.
//! Based on 3GPP TS 38.214 Section 5.2.2.2
//!
//! The Type I families enumerate their candidates explicitly. The Type II families keep
//! only the beam basis and build precoders on demand from the channel eigenvectors.

pub mod beams;
pub mod etype2;
pub mod restriction;
pub mod type1_multi;
pub mod type1_single;
pub mod type2;

use crate::config::{CodebookConfig, PanelDims};
use crate::pmi::{PmiSelection, SearchContext};
use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::Serialize;
use tracing::debug;

/// Precoding matrix, ports x layers
pub type Precoder = DMatrix<Complex64>;

/// One candidate of an enumerated codebook
#[derive(Debug, Clone)]
pub struct Candidate<I2> {
    pub i2: I2,
    /// `None` when the subset restriction excludes the candidate
    pub precoder: Option<Precoder>,
}

/// Candidates sharing one wideband index
#[derive(Debug, Clone)]
pub struct CandidateGroup<I1, I2> {
    pub i1: I1,
    pub candidates: Vec<Candidate<I2>>,
}

/// Explicitly enumerated codebook for one rank
#[derive(Debug, Clone)]
pub struct EnumeratedCodebook<I1, I2> {
    pub rank: u8,
    pub ports: usize,
    pub groups: Vec<CandidateGroup<I1, I2>>,
}

impl<I1, I2> EnumeratedCodebook<I1, I2> {
    pub fn new(rank: u8, ports: usize) -> Self {
        Self { rank, ports, groups: Vec::new() }
    }

    pub fn push_group(&mut self, i1: I1, candidates: Vec<Candidate<I2>>) {
        self.groups.push(CandidateGroup { i1, candidates });
    }

    pub fn num_candidates(&self) -> usize {
        self.groups.iter().map(|g| g.candidates.len()).sum()
    }

    pub fn num_allowed(&self) -> usize {
        self.candidates().filter(|(_, _, c)| c.precoder.is_some()).count()
    }

    pub fn is_fully_restricted(&self) -> bool {
        self.num_allowed() == 0
    }

    /// All candidates in enumeration order as (group, index in group, candidate)
    pub fn candidates(&self) -> impl Iterator<Item = (usize, usize, &Candidate<I2>)> + '_ {
        self.groups.iter().enumerate().flat_map(|(g, group)| {
            group.candidates.iter().enumerate().map(move |(c, cand)| (g, c, cand))
        })
    }
}

/// i1 of the Type I single-panel codebook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SinglePanelI1 {
    pub i11: u32,
    pub i12: u32,
    pub i13: u32,
}

/// i1 of the Type I multi-panel codebook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MultiPanelI1 {
    pub i11: u32,
    pub i12: u32,
    pub i13: u32,
    /// Panel co-phasing i1,4,q for q = 1..3, unused entries zero
    pub i14: [u32; 3],
}

/// i2 of the Type I multi-panel codebook, i21 and i22 only in codebook mode 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MultiPanelI2 {
    pub i20: u32,
    pub i21: u32,
    pub i22: u32,
}

/// i1 of the Type II codebook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Type2I1 {
    /// Rotation [q1, q2]
    pub i11: [u32; 2],
    /// Combinatorial index of the orthogonal beams
    pub i12: u32,
    /// Strongest coefficient per layer
    pub i13: Vec<u32>,
    /// Wideband amplitude indices per layer (2L each)
    pub i14: Vec<Vec<u32>>,
}

/// i2 of the Type II codebook for one subband
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Type2I2 {
    /// Phase indices per layer (2L each)
    pub i21: Vec<Vec<u32>>,
    /// Subband amplitude indices per layer (2L each), empty without subband amplitude
    pub i22: Vec<Vec<u32>>,
}

/// i1 of the enhanced Type II codebook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnhancedType2I1 {
    /// Rotation [q1, q2]
    pub i11: [u32; 2],
    /// Combinatorial index of the orthogonal beams
    pub i12: u32,
    /// Window start M_initial, only reported for more than 19 PMI subbands
    pub i15: Option<i32>,
    /// Combinatorial index of the frequency bases per layer
    pub i16: Vec<u32>,
    /// Non-zero coefficient bitmap per layer (2L x Mv, beam-major)
    pub i17: Vec<Vec<bool>>,
    /// Strongest coefficient per layer
    pub i18: Vec<u32>,
}

/// i2 of the enhanced Type II codebook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnhancedType2I2 {
    /// Reference amplitude of the weaker polarization per layer
    pub i23: Vec<u32>,
    /// Differential amplitudes per layer (2L x Mv)
    pub i24: Vec<Vec<u32>>,
    /// 16PSK phases per layer (2L x Mv)
    pub i25: Vec<Vec<u32>>,
}

/// i2 reporting granularity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SubbandI2<T> {
    /// One i2 for the whole BWP
    Wideband(T),
    /// One i2 per subband, `None` for subbands without CSI-RS
    Subband(Vec<Option<T>>),
    /// i2 is not reported (cri-RI-i1-CQI)
    NotReported,
}

impl<T> SubbandI2<T> {
    pub fn map<U, F: FnMut(&T) -> U>(&self, mut f: F) -> SubbandI2<U> {
        match self {
            SubbandI2::Wideband(v) => SubbandI2::Wideband(f(v)),
            SubbandI2::Subband(values) => {
                SubbandI2::Subband(values.iter().map(|v| v.as_ref().map(&mut f)).collect())
            }
            SubbandI2::NotReported => SubbandI2::NotReported,
        }
    }
}

/// PMI index set of one report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PmiIndices {
    SinglePanel {
        i1: SinglePanelI1,
        i2: SubbandI2<u32>,
    },
    MultiPanel {
        i1: MultiPanelI1,
        i2: SubbandI2<MultiPanelI2>,
    },
    Type2 {
        i1: Type2I1,
        i2: SubbandI2<Type2I2>,
    },
    EnhancedType2 {
        i1: EnhancedType2I1,
        i2: SubbandI2<EnhancedType2I2>,
    },
}

fn inc(v: u32) -> u32 {
    v + 1
}

fn inc_all(values: &[u32]) -> Vec<u32> {
    values.iter().map(|&v| v + 1).collect()
}

fn inc_nested(values: &[Vec<u32>]) -> Vec<Vec<u32>> {
    values.iter().map(|v| inc_all(v)).collect()
}

impl PmiIndices {
    /// The same indices counted from one, as reported to the scheduler
    pub fn to_one_based(&self) -> PmiIndices {
        match self {
            PmiIndices::SinglePanel { i1, i2 } => PmiIndices::SinglePanel {
                i1: SinglePanelI1 { i11: inc(i1.i11), i12: inc(i1.i12), i13: inc(i1.i13) },
                i2: i2.map(|&v| inc(v)),
            },
            PmiIndices::MultiPanel { i1, i2 } => PmiIndices::MultiPanel {
                i1: MultiPanelI1 {
                    i11: inc(i1.i11),
                    i12: inc(i1.i12),
                    i13: inc(i1.i13),
                    i14: i1.i14.map(inc),
                },
                i2: i2.map(|v| MultiPanelI2 { i20: inc(v.i20), i21: inc(v.i21), i22: inc(v.i22) }),
            },
            PmiIndices::Type2 { i1, i2 } => PmiIndices::Type2 {
                i1: Type2I1 {
                    i11: i1.i11.map(inc),
                    i12: inc(i1.i12),
                    i13: inc_all(&i1.i13),
                    i14: inc_nested(&i1.i14),
                },
                i2: i2.map(|v| Type2I2 { i21: inc_nested(&v.i21), i22: inc_nested(&v.i22) }),
            },
            PmiIndices::EnhancedType2 { i1, i2 } => PmiIndices::EnhancedType2 {
                i1: EnhancedType2I1 {
                    i11: i1.i11.map(inc),
                    i12: inc(i1.i12),
                    i15: i1.i15.map(|v| v + 1),
                    i16: inc_all(&i1.i16),
                    i17: i1.i17.clone(),
                    i18: inc_all(&i1.i18),
                },
                i2: i2.map(|v| EnhancedType2I2 {
                    i23: inc_all(&v.i23),
                    i24: inc_nested(&v.i24),
                    i25: inc_nested(&v.i25),
                }),
            },
        }
    }
}

/// Beam basis of the Type II families
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeamBasis {
    pub panel: PanelDims,
    /// Oversampling (O1, O2)
    pub oversampling: (usize, usize),
    /// Beams combined per polarization
    pub num_beams: usize,
    /// Rotations searched
    pub rotations: usize,
    /// Beam combinations per rotation
    pub combinations: usize,
}

/// Codebook realized for the selected rank, reported as a diagnostic
#[derive(Debug, Clone)]
pub enum RealizedCodebook {
    SinglePanel(EnumeratedCodebook<SinglePanelI1, u32>),
    MultiPanel(EnumeratedCodebook<MultiPanelI1, MultiPanelI2>),
    BeamBasis(BeamBasis),
}

impl RealizedCodebook {
    /// Enumerated candidates, zero for the Type II families
    pub fn num_candidates(&self) -> usize {
        match self {
            RealizedCodebook::SinglePanel(cb) => cb.num_candidates(),
            RealizedCodebook::MultiPanel(cb) => cb.num_candidates(),
            RealizedCodebook::BeamBasis(_) => 0,
        }
    }
}

/// One codebook family: codebook construction plus the two search stages
pub trait CodebookFamily {
    /// Codebook of one rank
    type Codebook;
    /// Outcome of the wideband stage
    type Wideband;

    fn build_codebook(&self, ports: usize, rank: u8) -> Self::Codebook;

    /// Pick the wideband indices, `None` when nothing can be selected
    fn wideband_search(
        &self,
        codebook: &Self::Codebook,
        ctx: &SearchContext<'_>,
    ) -> Option<Self::Wideband>;

    /// Complete the selection per subband with the wideband indices fixed
    fn subband_search(
        &self,
        codebook: &Self::Codebook,
        wideband: Self::Wideband,
        ctx: &SearchContext<'_>,
    ) -> Option<PmiSelection>;

    fn realize(&self, codebook: Self::Codebook) -> RealizedCodebook;
}

/// Outcome of running one family for one rank
#[derive(Debug, Clone)]
pub struct FamilyOutcome {
    pub selection: Option<PmiSelection>,
    pub codebook: RealizedCodebook,
}

fn run_family<F: CodebookFamily>(
    family: &F,
    ports: usize,
    rank: u8,
    ctx: &SearchContext<'_>,
) -> FamilyOutcome {
    let codebook = family.build_codebook(ports, rank);
    let selection = family
        .wideband_search(&codebook, ctx)
        .and_then(|wideband| family.subband_search(&codebook, wideband, ctx));
    FamilyOutcome {
        selection,
        codebook: family.realize(codebook),
    }
}

/// Codebook family selected once from the configuration
#[derive(Debug, Clone)]
pub enum CodebookStrategy<'a> {
    SinglePanel(type1_single::SinglePanelFamily<'a>),
    MultiPanel(type1_multi::MultiPanelFamily<'a>),
    Type2(type2::Type2Family<'a>),
    EnhancedType2(etype2::EnhancedType2Family<'a>),
}

impl<'a> CodebookStrategy<'a> {
    pub fn from_config(config: &'a CodebookConfig) -> Self {
        match config {
            CodebookConfig::Type1SinglePanel(cfg) => {
                CodebookStrategy::SinglePanel(type1_single::SinglePanelFamily::new(cfg))
            }
            CodebookConfig::Type1MultiPanel(cfg) => {
                CodebookStrategy::MultiPanel(type1_multi::MultiPanelFamily::new(cfg))
            }
            CodebookConfig::Type2(cfg) => CodebookStrategy::Type2(type2::Type2Family::new(cfg)),
            CodebookConfig::EnhancedType2(cfg) => {
                CodebookStrategy::EnhancedType2(etype2::EnhancedType2Family::new(cfg))
            }
        }
    }

    /// Run both search stages for one rank
    pub fn select(&self, ports: usize, rank: u8, ctx: &SearchContext<'_>) -> FamilyOutcome {
        let outcome = match self {
            CodebookStrategy::SinglePanel(f) => run_family(f, ports, rank, ctx),
            CodebookStrategy::MultiPanel(f) => run_family(f, ports, rank, ctx),
            CodebookStrategy::Type2(f) => run_family(f, ports, rank, ctx),
            CodebookStrategy::EnhancedType2(f) => run_family(f, ports, rank, ctx),
        };
        debug!(
            "Rank {} search over {} enumerated candidates: {}",
            rank,
            outcome.codebook.num_candidates(),
            if outcome.selection.is_some() { "selected" } else { "nothing selectable" }
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_based_indices() {
        let pmi = PmiIndices::SinglePanel {
            i1: SinglePanelI1::default(),
            i2: SubbandI2::Subband(vec![Some(0), None, Some(3)]),
        };
        assert_eq!(
            pmi.to_one_based(),
            PmiIndices::SinglePanel {
                i1: SinglePanelI1 { i11: 1, i12: 1, i13: 1 },
                i2: SubbandI2::Subband(vec![Some(1), None, Some(4)]),
            }
        );
    }

    #[test]
    fn test_enumerated_codebook_counts() {
        let mut cb: EnumeratedCodebook<u32, u32> = EnumeratedCodebook::new(1, 2);
        cb.push_group(
            0,
            vec![
                Candidate { i2: 0, precoder: None },
                Candidate { i2: 1, precoder: Some(Precoder::zeros(2, 1)) },
            ],
        );
        cb.push_group(1, vec![Candidate { i2: 0, precoder: None }]);
        assert_eq!(cb.num_candidates(), 3);
        assert_eq!(cb.num_allowed(), 1);
        assert!(!cb.is_fully_restricted());
        let order: Vec<(usize, usize)> = cb.candidates().map(|(g, c, _)| (g, c)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0)]);
    }
}
