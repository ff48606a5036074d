//! Type I Multi-Panel Codebook
//!
//! Based on 3GPP TS 38.214 Section 5.2.2.2.2 (Tables 5.2.2.2.2-1 to 5.2.2.2.2-6)

use super::beams::{phi, stack_columns, BeamGrid};
use super::restriction::BeamBitmap;
use super::type1_single::two_layer_offsets;
use super::{
    Candidate, CodebookFamily, EnumeratedCodebook, MultiPanelI1, MultiPanelI2, PmiIndices, RealizedCodebook,
};
use crate::config::{CodebookMode, MultiPanelConfig};
use crate::pmi::{enumerated_subband_search, enumerated_wideband_search, EnumeratedWideband, PmiSelection, SearchContext};
use num_complex::Complex64;
use std::f64::consts::FRAC_PI_4;
use tracing::debug;

type Codebook = EnumeratedCodebook<MultiPanelI1, MultiPanelI2>;

const ONE: Complex64 = Complex64 { re: 1.0, im: 0.0 };

/// a_p = e^{j pi / 4} e^{j pi p / 2}
fn a(p: u32) -> Complex64 {
    Complex64::from_polar(1.0, FRAC_PI_4) * phi(p as usize)
}

/// b_n = e^{-j pi / 4} e^{j pi n / 2}
fn b(n: u32) -> Complex64 {
    Complex64::from_polar(1.0, -FRAC_PI_4) * phi(n as usize)
}

/// Type I multi-panel family
#[derive(Debug, Clone)]
pub struct MultiPanelFamily<'a> {
    cfg: &'a MultiPanelConfig,
}

impl<'a> MultiPanelFamily<'a> {
    pub fn new(cfg: &'a MultiPanelConfig) -> Self {
        Self { cfg }
    }

    /// Panel co-phasing indices i1,4
    fn panel_phases(&self) -> Vec<[u32; 3]> {
        match (self.cfg.codebook_mode, self.cfg.ng) {
            (CodebookMode::Mode1, 4) => (0..64u32).map(|x| [x / 16, x / 4 % 4, x % 4]).collect(),
            (CodebookMode::Mode1, _) => (0..4u32).map(|p| [p, 0, 0]).collect(),
            (CodebookMode::Mode2, _) => (0..16u32).map(|x| [x / 4, x % 4, 0]).collect(),
        }
    }

    /// Candidate i2 values for a rank
    fn i2_values(&self, rank: u8) -> Vec<MultiPanelI2> {
        let n0 = if rank == 1 { 4 } else { 2 };
        match self.cfg.codebook_mode {
            CodebookMode::Mode1 => (0..n0).map(|i20| MultiPanelI2 { i20, i21: 0, i22: 0 }).collect(),
            CodebookMode::Mode2 => (0..n0 * 4)
                .map(|x| MultiPanelI2 { i20: x / 4, i21: x / 2 % 2, i22: x % 2 })
                .collect(),
        }
    }

    /// Per-block coefficients of one column: [pol A, pol B] for each panel
    fn column_blocks(&self, i14: &[u32; 3], i2: &MultiPanelI2, sign: f64) -> Vec<Complex64> {
        let ng = self.cfg.ng as usize;
        let n = phi(i2.i20 as usize);
        match self.cfg.codebook_mode {
            CodebookMode::Mode1 => (0..ng)
                .flat_map(|g| {
                    let panel = if g == 0 { ONE } else { phi(i14[g - 1] as usize) };
                    [panel, panel * n * sign]
                })
                .collect(),
            CodebookMode::Mode2 => vec![
                ONE,
                n * sign,
                a(i14[0]) * b(i2.i21),
                a(i14[1]) * b(i2.i22) * sign,
            ],
        }
    }
}

impl<'a> CodebookFamily for MultiPanelFamily<'a> {
    type Codebook = Codebook;
    type Wideband = EnumeratedWideband;

    fn build_codebook(&self, ports: usize, rank: u8) -> Codebook {
        let mut cb = Codebook::new(rank, ports);
        if !(1..=4).contains(&rank) {
            return cb;
        }

        let grid = BeamGrid::new(&self.cfg.panel);
        let bitmap = BeamBitmap::new(grid, self.cfg.subset_restriction.as_deref());
        let offsets = if rank == 1 { vec![(0, 0)] } else { two_layer_offsets(&grid) };
        let phases = self.panel_phases();
        let i2_values = self.i2_values(rank);
        let norm = 1.0 / ((ports * rank as usize) as f64).sqrt();

        for i11 in 0..grid.beams1() {
            for i12 in 0..grid.beams2() {
                for (i13, &(k1, k2)) in offsets.iter().enumerate() {
                    let first = (i11, i12);
                    let second = (i11 + k1, i12 + k2);
                    // Beam and polarization sign of each column
                    let layout: Vec<((usize, usize), f64)> = match rank {
                        1 => vec![(first, 1.0)],
                        2 => vec![(first, 1.0), (second, -1.0)],
                        3 => vec![(first, 1.0), (second, 1.0), (first, -1.0)],
                        _ => vec![(first, 1.0), (second, 1.0), (first, -1.0), (second, -1.0)],
                    };
                    let beams: Vec<(usize, usize)> = layout.iter().map(|c| c.0).collect();
                    let allowed = bitmap.allows_all(&beams);
                    let vectors: Vec<_> = beams.iter().map(|&(l, m)| grid.v(l, m)).collect();

                    for i14 in &phases {
                        let candidates = i2_values
                            .iter()
                            .map(|i2| Candidate {
                                i2: *i2,
                                precoder: allowed.then(|| {
                                    let blocks: Vec<Vec<Complex64>> = layout
                                        .iter()
                                        .map(|&(_, sign)| self.column_blocks(i14, i2, sign))
                                        .collect();
                                    stack_columns(&vectors, &blocks, norm)
                                }),
                            })
                            .collect();
                        cb.push_group(
                            MultiPanelI1 {
                                i11: i11 as u32,
                                i12: i12 as u32,
                                i13: i13 as u32,
                                i14: *i14,
                            },
                            candidates,
                        );
                    }
                }
            }
        }

        debug!(
            "Type I multi-panel codebook: Ng {}, {} ports, rank {}, {} of {} candidates allowed",
            self.cfg.ng,
            ports,
            rank,
            cb.num_allowed(),
            cb.num_candidates()
        );
        cb
    }

    fn wideband_search(&self, codebook: &Codebook, ctx: &SearchContext<'_>) -> Option<EnumeratedWideband> {
        enumerated_wideband_search(codebook, ctx)
    }

    fn subband_search(
        &self,
        codebook: &Codebook,
        wideband: EnumeratedWideband,
        ctx: &SearchContext<'_>,
    ) -> Option<PmiSelection> {
        let choice = enumerated_subband_search(codebook, wideband, ctx)?;
        Some(PmiSelection {
            indices: PmiIndices::MultiPanel { i1: choice.i1, i2: choice.i2 },
            partition: choice.partition,
            precoders: choice.precoders,
        })
    }

    fn realize(&self, codebook: Codebook) -> RealizedCodebook {
        RealizedCodebook::MultiPanel(codebook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PanelDims;
    use approx::assert_relative_eq;

    fn config(ng: u8, n1: u8, n2: u8, mode: CodebookMode) -> MultiPanelConfig {
        MultiPanelConfig {
            ng,
            panel: PanelDims::new(n1, n2),
            codebook_mode: mode,
            subset_restriction: None,
        }
    }

    #[test]
    fn test_candidate_counts() {
        let cfg = config(2, 2, 1, CodebookMode::Mode1);
        let family = MultiPanelFamily::new(&cfg);
        // 8 beams x 4 panel phases x 4 i2
        assert_eq!(family.build_codebook(8, 1).num_candidates(), 8 * 4 * 4);
        // Two i1,3 values for N1 = 2, N2 = 1
        assert_eq!(family.build_codebook(8, 2).num_candidates(), 8 * 2 * 4 * 2);

        let cfg = config(4, 2, 1, CodebookMode::Mode1);
        let family = MultiPanelFamily::new(&cfg);
        assert_eq!(family.build_codebook(16, 1).num_candidates(), 8 * 64 * 4);

        let cfg = config(2, 2, 1, CodebookMode::Mode2);
        let family = MultiPanelFamily::new(&cfg);
        assert_eq!(family.build_codebook(8, 1).num_candidates(), 8 * 16 * 16);
        assert_eq!(family.build_codebook(8, 3).num_candidates(), 8 * 2 * 16 * 8);
        assert_eq!(family.build_codebook(8, 5).num_candidates(), 0);
    }

    #[test]
    fn test_unit_column_power() {
        for cfg in [
            config(2, 2, 1, CodebookMode::Mode1),
            config(4, 2, 1, CodebookMode::Mode1),
            config(2, 2, 1, CodebookMode::Mode2),
        ] {
            let family = MultiPanelFamily::new(&cfg);
            let ports = 2 * cfg.ng as usize * cfg.panel.elements();
            for rank in 1..=4u8 {
                let cb = family.build_codebook(ports, rank);
                for (_, _, cand) in cb.candidates() {
                    let w = cand.precoder.as_ref().unwrap();
                    assert_eq!(w.shape(), (ports, rank as usize));
                    for col in w.column_iter() {
                        assert_relative_eq!(col.norm_squared(), 1.0 / rank as f64, epsilon = 1e-9);
                    }
                }
            }
        }
    }

    #[test]
    fn test_mode1_panel_cophasing() {
        let cfg = config(2, 2, 1, CodebookMode::Mode1);
        let family = MultiPanelFamily::new(&cfg);
        let cb = family.build_codebook(8, 1);
        // Group with i1,4 = 1 on beam (0, 0), i2 = 0
        let group = cb.groups.iter().find(|g| g.i1.i11 == 0 && g.i1.i14[0] == 1).unwrap();
        let w = group.candidates[0].precoder.as_ref().unwrap();
        // Second panel first polarization is rotated by phi(1) = j
        let ratio = w[(4, 0)] / w[(0, 0)];
        assert_relative_eq!(ratio.re, 0.0, epsilon = 1e-12);
        assert_relative_eq!(ratio.im, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_restriction() {
        let mut cfg = config(2, 2, 1, CodebookMode::Mode1);
        let mut bits = vec![true; 8];
        bits[5] = false;
        cfg.subset_restriction = Some(bits);
        let family = MultiPanelFamily::new(&cfg);
        let cb = family.build_codebook(8, 1);
        assert_eq!(cb.num_allowed(), 7 * 4 * 4);
    }
}
