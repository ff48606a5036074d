//! Type I Single-Panel Codebook
//!
//! Based on 3GPP TS 38.214 Section 5.2.2.2.1 (Tables 5.2.2.2.1-1 to 5.2.2.2.1-12)

use super::beams::{phi, stack_columns, theta, BeamGrid};
use super::restriction::{bit_enabled, BeamBitmap};
use super::{Candidate, CodebookFamily, EnumeratedCodebook, PmiIndices, Precoder, RealizedCodebook, SinglePanelI1};
use crate::config::{CodebookMode, SinglePanelConfig};
use crate::pmi::{enumerated_subband_search, enumerated_wideband_search, EnumeratedWideband, PmiSelection, SearchContext};
use num_complex::Complex64;
use tracing::debug;

type Codebook = EnumeratedCodebook<SinglePanelI1, u32>;

/// Column of a dual-polarized precoder: beam (l, m) on the first polarization and the
/// same beam times a coefficient on the second
type Column = ((usize, usize), Complex64);

const ONE: Complex64 = Complex64 { re: 1.0, im: 0.0 };

/// (k1, k2) offsets of i1,3 for two layers (Table 5.2.2.2.1-3)
pub fn two_layer_offsets(grid: &BeamGrid) -> Vec<(usize, usize)> {
    let (n1, n2, o1, o2) = (grid.n1, grid.n2, grid.o1, grid.o2);
    if n2 == 1 {
        if n1 == 2 {
            vec![(0, 0), (o1, 0)]
        } else {
            vec![(0, 0), (o1, 0), (2 * o1, 0), (3 * o1, 0)]
        }
    } else if n1 == n2 {
        vec![(0, 0), (o1, 0), (0, o2), (o1, o2)]
    } else {
        vec![(0, 0), (o1, 0), (0, o2), (2 * o1, 0)]
    }
}

/// (k1, k2) offsets of i1,3 for three and four layers below 16 ports (Table 5.2.2.2.1-4)
fn three_four_layer_offsets(grid: &BeamGrid) -> Vec<(usize, usize)> {
    let (o1, o2) = (grid.o1, grid.o2);
    match (grid.n1, grid.n2) {
        (4, 1) => vec![(o1, 0), (2 * o1, 0), (3 * o1, 0)],
        (6, 1) => vec![(o1, 0), (2 * o1, 0), (3 * o1, 0), (4 * o1, 0)],
        (2, 2) => vec![(o1, 0), (0, o2), (o1, o2)],
        (3, 2) => vec![(o1, 0), (0, o2), (o1, o2), (2 * o1, 0)],
        _ => vec![(o1, 0)],
    }
}

/// Type I single-panel family
#[derive(Debug, Clone)]
pub struct SinglePanelFamily<'a> {
    cfg: &'a SinglePanelConfig,
}

struct Builder<'a> {
    grid: BeamGrid,
    bitmap: BeamBitmap<'a>,
    i2_restriction: Option<&'a [bool]>,
    ports: usize,
    rank: u8,
}

impl<'a> Builder<'a> {
    fn norm(&self) -> f64 {
        1.0 / ((self.ports * self.rank as usize) as f64).sqrt()
    }

    fn i2_allowed(&self, i2: u32) -> bool {
        self.rank != 1 || bit_enabled(self.i2_restriction, i2 as usize)
    }

    /// Candidate made of dual-polarized columns
    fn dual_pol(&self, i2: u32, columns: &[Column]) -> Candidate<u32> {
        let beams: Vec<(usize, usize)> = columns.iter().map(|c| c.0).collect();
        let allowed = self.bitmap.allows_all(&beams) && self.i2_allowed(i2);
        let precoder = allowed.then(|| {
            let vectors: Vec<_> = columns.iter().map(|&((l, m), _)| self.grid.v(l, m)).collect();
            let blocks: Vec<Vec<Complex64>> = columns.iter().map(|&(_, a)| vec![ONE, a]).collect();
            stack_columns(&vectors, &blocks, self.norm())
        });
        Candidate { i2, precoder }
    }

    /// Three or four layers with 16 ports or more: four blocks of half-length beams
    fn split_panel(&self, i2: u32, l: usize, m: usize, p: usize) -> Candidate<u32> {
        let b1 = self.grid.beams1();
        let beams = [((2 * l + b1 - 1) % b1, m), (2 * l, m), (2 * l + 1, m)];
        let precoder = self.bitmap.allows_all(&beams).then(|| {
            let th = theta(p);
            let ph = phi(i2 as usize);
            // Signs of the theta, phi and phi*theta blocks per column
            const SIGNS: [[f64; 3]; 4] = [
                [1.0, 1.0, 1.0],
                [-1.0, 1.0, -1.0],
                [1.0, -1.0, -1.0],
                [-1.0, -1.0, 1.0],
            ];
            let v = self.grid.v_tilde(l, m);
            let vectors = vec![v; self.rank as usize];
            let blocks: Vec<Vec<Complex64>> = SIGNS
                .iter()
                .take(self.rank as usize)
                .map(|s| vec![ONE, th * s[0], ph * s[1], ph * th * s[2]])
                .collect();
            stack_columns(&vectors, &blocks, self.norm())
        });
        Candidate { i2, precoder }
    }
}

impl<'a> SinglePanelFamily<'a> {
    pub fn new(cfg: &'a SinglePanelConfig) -> Self {
        Self { cfg }
    }

    fn one_port(rank: u8) -> Codebook {
        let mut cb = Codebook::new(rank, 1);
        if rank == 1 {
            cb.push_group(
                SinglePanelI1::default(),
                vec![Candidate { i2: 0, precoder: Some(Precoder::from_element(1, 1, ONE)) }],
            );
        }
        cb
    }

    fn two_port(&self, rank: u8) -> Codebook {
        let mut cb = Codebook::new(rank, 2);
        let csr = self.cfg.subset_restriction.as_deref();
        let candidates = match rank {
            1 => (0..4u32)
                .map(|i2| Candidate {
                    i2,
                    precoder: bit_enabled(csr, i2 as usize).then(|| {
                        let s = std::f64::consts::FRAC_1_SQRT_2;
                        Precoder::from_column_slice(2, 1, &[ONE * s, phi(i2 as usize) * s])
                    }),
                })
                .collect(),
            2 => (0..2u32)
                .map(|i2| Candidate {
                    i2,
                    precoder: bit_enabled(csr, 4 + i2 as usize).then(|| {
                        let p = phi(i2 as usize);
                        Precoder::from_column_slice(2, 2, &[ONE * 0.5, p * 0.5, ONE * 0.5, -p * 0.5])
                    }),
                })
                .collect(),
            _ => Vec::new(),
        };
        if !candidates.is_empty() {
            cb.push_group(SinglePanelI1::default(), candidates);
        }
        cb
    }

    fn multi_port(&self, ports: usize, rank: u8) -> Codebook {
        let grid = BeamGrid::new(&self.cfg.panel);
        let builder = Builder {
            grid,
            bitmap: BeamBitmap::new(grid, self.cfg.subset_restriction.as_deref()),
            i2_restriction: self.cfg.i2_restriction.as_deref(),
            ports,
            rank,
        };
        let mut cb = Codebook::new(rank, ports);
        let (b1, b2) = (grid.beams1(), grid.beams2());
        let (o1, o2) = (grid.o1, grid.o2);
        let mode2 = self.cfg.codebook_mode == CodebookMode::Mode2;
        let i1 = |i11: usize, i12: usize, i13: usize| SinglePanelI1 {
            i11: i11 as u32,
            i12: i12 as u32,
            i13: i13 as u32,
        };
        // Beam offsets selected by i2 in codebook mode 2
        let mode2_offset = |q: usize| -> (usize, usize) {
            if grid.n2 > 1 {
                [(0, 0), (1, 0), (0, 1), (1, 1)][q]
            } else {
                (q, 0)
            }
        };
        let i12_mode2 = if grid.n2 > 1 { b2 / 2 } else { 1 };

        match rank {
            1 if !mode2 => {
                for i11 in 0..b1 {
                    for i12 in 0..b2 {
                        let candidates = (0..4)
                            .map(|n| builder.dual_pol(n as u32, &[((i11, i12), phi(n))]))
                            .collect();
                        cb.push_group(i1(i11, i12, 0), candidates);
                    }
                }
            }
            1 => {
                for i11 in 0..b1 / 2 {
                    for i12 in 0..i12_mode2 {
                        let candidates = (0..16)
                            .map(|i2| {
                                let (dl, dm) = mode2_offset(i2 / 4);
                                let beam = (2 * i11 + dl, 2 * i12 + dm);
                                builder.dual_pol(i2 as u32, &[(beam, phi(i2 % 4))])
                            })
                            .collect();
                        cb.push_group(i1(i11, i12, 0), candidates);
                    }
                }
            }
            2 => {
                let offsets = two_layer_offsets(&grid);
                let (r11, r12, n_i2) = if mode2 { (b1 / 2, i12_mode2, 8) } else { (b1, b2, 2) };
                for i11 in 0..r11 {
                    for i12 in 0..r12 {
                        for (i13, &(k1, k2)) in offsets.iter().enumerate() {
                            let candidates = (0..n_i2)
                                .map(|i2| {
                                    let (l, m, n) = if mode2 {
                                        let (dl, dm) = mode2_offset(i2 / 2);
                                        (2 * i11 + dl, 2 * i12 + dm, i2 % 2)
                                    } else {
                                        (i11, i12, i2)
                                    };
                                    builder.dual_pol(
                                        i2 as u32,
                                        &[((l, m), phi(n)), ((l + k1, m + k2), -phi(n))],
                                    )
                                })
                                .collect();
                            cb.push_group(i1(i11, i12, i13), candidates);
                        }
                    }
                }
            }
            3 | 4 if ports < 16 => {
                let offsets = three_four_layer_offsets(&grid);
                for i11 in 0..b1 {
                    for i12 in 0..b2 {
                        for (i13, &(k1, k2)) in offsets.iter().enumerate() {
                            let candidates = (0..2)
                                .map(|n| {
                                    let a = (i11, i12);
                                    let b = (i11 + k1, i12 + k2);
                                    let p = phi(n);
                                    let columns = [(a, p), (b, p), (a, -p), (b, -p)];
                                    builder.dual_pol(n as u32, &columns[..rank as usize])
                                })
                                .collect();
                            cb.push_group(i1(i11, i12, i13), candidates);
                        }
                    }
                }
            }
            3 | 4 => {
                for i11 in 0..b1 / 2 {
                    for i12 in 0..b2 {
                        for i13 in 0..4 {
                            let candidates = (0..2)
                                .map(|n| builder.split_panel(n as u32, i11, i12, i13))
                                .collect();
                            cb.push_group(i1(i11, i12, i13), candidates);
                        }
                    }
                }
            }
            5 | 6 => {
                let r12 = if grid.n2 > 1 { b2 } else { 1 };
                for i11 in 0..b1 {
                    for i12 in 0..r12 {
                        let beams = if grid.n2 > 1 {
                            [(i11, i12), (i11 + o1, i12), (i11 + o1, i12 + o2)]
                        } else {
                            [(i11, 0), (i11 + o1, 0), (i11 + 2 * o1, 0)]
                        };
                        let candidates = (0..2)
                            .map(|n| {
                                let p = phi(n);
                                let columns: Vec<Column> = if rank == 5 {
                                    vec![(beams[0], p), (beams[0], -p), (beams[1], ONE), (beams[1], -ONE), (beams[2], ONE)]
                                } else {
                                    vec![(beams[0], p), (beams[0], -p), (beams[1], p), (beams[1], -p), (beams[2], ONE), (beams[2], -ONE)]
                                };
                                builder.dual_pol(n as u32, &columns)
                            })
                            .collect();
                        cb.push_group(i1(i11, i12, 0), candidates);
                    }
                }
            }
            7 | 8 => {
                let (r11, r12) = match (grid.n1, grid.n2) {
                    (4, 1) => (b1 / 2, 1),
                    (_, 1) => (b1, 1),
                    (2, 2) => (b1, b2),
                    _ => (b1, b2 / 2),
                };
                for i11 in 0..r11 {
                    for i12 in 0..r12 {
                        let beams = if grid.n2 > 1 {
                            [(i11, i12), (i11 + o1, i12), (i11, i12 + o2), (i11 + o1, i12 + o2)]
                        } else {
                            [(i11, 0), (i11 + o1, 0), (i11 + 2 * o1, 0), (i11 + 3 * o1, 0)]
                        };
                        let candidates = (0..2)
                            .map(|n| {
                                let p = phi(n);
                                let mut columns: Vec<Column> = vec![(beams[0], p), (beams[0], -p), (beams[1], p)];
                                if rank == 8 {
                                    columns.push((beams[1], -p));
                                }
                                columns.extend([(beams[2], ONE), (beams[2], -ONE), (beams[3], ONE), (beams[3], -ONE)]);
                                builder.dual_pol(n as u32, &columns)
                            })
                            .collect();
                        cb.push_group(i1(i11, i12, 0), candidates);
                    }
                }
            }
            _ => {}
        }
        cb
    }
}

impl<'a> CodebookFamily for SinglePanelFamily<'a> {
    type Codebook = Codebook;
    type Wideband = EnumeratedWideband;

    fn build_codebook(&self, ports: usize, rank: u8) -> Codebook {
        let cb = match ports {
            1 => Self::one_port(rank),
            2 => self.two_port(rank),
            _ => self.multi_port(ports, rank),
        };
        debug!(
            "Type I single-panel codebook: {} ports, rank {}, {} groups, {} of {} candidates allowed",
            ports,
            rank,
            cb.groups.len(),
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
            indices: PmiIndices::SinglePanel { i1: choice.i1, i2: choice.i2 },
            partition: choice.partition,
            precoders: choice.precoders,
        })
    }

    fn realize(&self, codebook: Codebook) -> RealizedCodebook {
        RealizedCodebook::SinglePanel(codebook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PanelDims;
    use approx::assert_relative_eq;

    fn family_config(n1: u8, n2: u8, mode: CodebookMode) -> SinglePanelConfig {
        SinglePanelConfig {
            panel: PanelDims::new(n1, n2),
            codebook_mode: mode,
            subset_restriction: None,
            i2_restriction: None,
        }
    }

    /// W^H W = I / rank for every candidate
    fn assert_unit_column_power(cb: &Codebook) {
        let rank = cb.rank as f64;
        for (g, c, cand) in cb.candidates() {
            let w = cand.precoder.as_ref().unwrap();
            assert_eq!(w.nrows(), cb.ports);
            assert_eq!(w.ncols(), cb.rank as usize);
            for col in w.column_iter() {
                assert_relative_eq!(col.norm_squared(), 1.0 / rank, epsilon = 1e-9);
            }
            let gram = w.adjoint() * w;
            for i in 0..w.ncols() {
                for j in 0..w.ncols() {
                    let expected = if i == j { 1.0 / rank } else { 0.0 };
                    assert!(
                        (gram[(i, j)] - Complex64::new(expected, 0.0)).norm() < 1e-9,
                        "rank {} group {} i2 {}: W^H W[{}, {}] = {}",
                        cb.rank,
                        g,
                        c,
                        i,
                        j,
                        gram[(i, j)]
                    );
                }
            }
        }
    }

    #[test]
    fn test_one_port() {
        let cfg = SinglePanelConfig::default();
        let family = SinglePanelFamily::new(&cfg);
        let cb = family.build_codebook(1, 1);
        assert_eq!(cb.num_candidates(), 1);
        assert_unit_column_power(&cb);
        assert_eq!(family.build_codebook(1, 2).num_candidates(), 0);
    }

    #[test]
    fn test_two_port_unrestricted() {
        let mut cfg = SinglePanelConfig::default();
        cfg.subset_restriction = Some(vec![true; 6]);
        let family = SinglePanelFamily::new(&cfg);

        let cb = family.build_codebook(2, 1);
        assert_eq!(cb.num_candidates(), 4);
        assert_eq!(cb.num_allowed(), 4);
        assert_unit_column_power(&cb);

        let cb = family.build_codebook(2, 2);
        assert_eq!(cb.num_candidates(), 2);
        assert_unit_column_power(&cb);
    }

    #[test]
    fn test_two_port_restriction() {
        let mut cfg = SinglePanelConfig::default();
        cfg.subset_restriction = Some(vec![true, false, true, true, false, true]);
        let family = SinglePanelFamily::new(&cfg);
        let cb = family.build_codebook(2, 1);
        assert!(cb.groups[0].candidates[1].precoder.is_none());
        assert_eq!(cb.num_allowed(), 3);
        let cb = family.build_codebook(2, 2);
        assert!(cb.groups[0].candidates[0].precoder.is_none());
        assert_eq!(cb.num_allowed(), 1);
    }

    #[test]
    fn test_candidate_counts() {
        let cfg = family_config(4, 1, CodebookMode::Mode1);
        let family = SinglePanelFamily::new(&cfg);
        assert_eq!(family.build_codebook(8, 1).num_candidates(), 16 * 4);
        // Four i1,3 values for N1 > 2, N2 = 1
        assert_eq!(family.build_codebook(8, 2).num_candidates(), 16 * 4 * 2);
        assert_eq!(family.build_codebook(8, 3).num_candidates(), 16 * 3 * 2);

        let cfg = family_config(4, 1, CodebookMode::Mode2);
        let family = SinglePanelFamily::new(&cfg);
        assert_eq!(family.build_codebook(8, 1).num_candidates(), 8 * 16);
        assert_eq!(family.build_codebook(8, 2).num_candidates(), 8 * 4 * 8);

        let cfg = family_config(4, 2, CodebookMode::Mode1);
        let family = SinglePanelFamily::new(&cfg);
        assert_eq!(family.build_codebook(16, 3).num_candidates(), 8 * 8 * 4 * 2);
    }

    #[test]
    fn test_unit_column_power_all_ranks() {
        let layouts = [(2, 1), (2, 2), (4, 1), (3, 2), (4, 2), (8, 1)];
        for &(n1, n2) in &layouts {
            for mode in [CodebookMode::Mode1, CodebookMode::Mode2] {
                let cfg = family_config(n1, n2, mode);
                let family = SinglePanelFamily::new(&cfg);
                let ports = 2 * n1 as usize * n2 as usize;
                let max_rank = if ports == 4 { 4 } else { 8 };
                for rank in 1..=max_rank {
                    let cb = family.build_codebook(ports, rank);
                    assert!(cb.num_candidates() > 0, "({}, {}) rank {}", n1, n2, rank);
                    assert_unit_column_power(&cb);
                }
            }
        }
    }

    #[test]
    fn test_rank5_layout() {
        let cfg = family_config(4, 1, CodebookMode::Mode1);
        let family = SinglePanelFamily::new(&cfg);
        let cb = family.build_codebook(8, 5);
        assert_eq!(cb.num_candidates(), 16 * 2);
        assert_unit_column_power(&cb);

        // Columns 0-1 share the first beam, 2-3 the second, 4 the third
        let w = cb.groups[0].candidates[1].precoder.as_ref().unwrap();
        for x in 0..4 {
            assert_relative_eq!((w[(x, 0)] - w[(x, 1)]).norm(), 0.0, epsilon = 1e-12);
            assert_relative_eq!((w[(x, 2)] - w[(x, 3)]).norm(), 0.0, epsilon = 1e-12);
            assert_relative_eq!((w[(x + 4, 2)] + w[(x + 4, 3)]).norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_beam_restriction_applies() {
        let mut cfg = family_config(2, 1, CodebookMode::Mode1);
        let mut bits = vec![true; 8];
        bits[0] = false;
        cfg.subset_restriction = Some(bits);
        let family = SinglePanelFamily::new(&cfg);

        let cb = family.build_codebook(4, 1);
        // Beam 0 carries all four i2 values of group (0, 0)
        assert_eq!(cb.num_allowed(), 7 * 4);
        assert!(cb.groups[0].candidates.iter().all(|c| c.precoder.is_none()));

        // Two layers: groups (0, k1 = 0), (0, k1 = 4) and (4, k1 = 4) use beam 0
        let cb = family.build_codebook(4, 2);
        let restricted = cb.candidates().filter(|(_, _, c)| c.precoder.is_none()).count();
        assert_eq!(restricted, 3 * 2);
    }

    #[test]
    fn test_i2_restriction_rank1_only() {
        let mut cfg = family_config(2, 1, CodebookMode::Mode1);
        let mut bits = vec![true; 16];
        bits[2] = false;
        cfg.i2_restriction = Some(bits);
        let family = SinglePanelFamily::new(&cfg);
        let cb = family.build_codebook(4, 1);
        assert_eq!(cb.num_allowed(), 8 * 3);
        assert_eq!(family.build_codebook(4, 2).num_allowed(), family.build_codebook(4, 2).num_candidates());
    }
}
