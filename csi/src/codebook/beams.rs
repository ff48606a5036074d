//! DFT Beam Vectors
//!
//! Oversampled 2D DFT beams and co-phasing factors shared by all codebook families.
//! Based on 3GPP TS 38.214 Section 5.2.2.2.1

use crate::config::PanelDims;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Oversampled beam grid of one panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamGrid {
    pub n1: usize,
    pub n2: usize,
    pub o1: usize,
    pub o2: usize,
}

impl BeamGrid {
    pub fn new(panel: &PanelDims) -> Self {
        let (o1, o2) = panel.oversampling();
        Self {
            n1: panel.n1 as usize,
            n2: panel.n2 as usize,
            o1,
            o2,
        }
    }

    /// Elements per polarization
    pub fn elements(&self) -> usize {
        self.n1 * self.n2
    }

    /// Beams along the first dimension (N1 O1)
    pub fn beams1(&self) -> usize {
        self.n1 * self.o1
    }

    /// Beams along the second dimension (N2 O2)
    pub fn beams2(&self) -> usize {
        self.n2 * self.o2
    }

    /// Bit of beam (l, m) in a beam bitmap
    pub fn bitmap_index(&self, l: usize, m: usize) -> usize {
        self.beams2() * (l % self.beams1()) + m % self.beams2()
    }

    /// Beam v(l, m), element x1 N2 + x2
    pub fn v(&self, l: usize, m: usize) -> DVector<Complex64> {
        self.dft(l, m, self.n1, 2.0)
    }

    /// Half-length beam used by the 3 and 4 layer codebook for 16 ports and more
    pub fn v_tilde(&self, l: usize, m: usize) -> DVector<Complex64> {
        self.dft(l, m, self.n1 / 2, 4.0)
    }

    fn dft(&self, l: usize, m: usize, len1: usize, scale1: f64) -> DVector<Complex64> {
        let step1 = scale1 * PI * l as f64 / (self.o1 * self.n1) as f64;
        let step2 = 2.0 * PI * m as f64 / (self.o2 * self.n2) as f64;
        DVector::from_fn(len1 * self.n2, |idx, _| {
            let x1 = (idx / self.n2) as f64;
            let x2 = (idx % self.n2) as f64;
            Complex64::from_polar(1.0, step1 * x1 + step2 * x2)
        })
    }
}

/// Co-phasing factor e^{j pi n / 2}
pub fn phi(n: usize) -> Complex64 {
    psk(n, 4)
}

/// Co-phasing factor e^{j pi p / 4}
pub fn theta(p: usize) -> Complex64 {
    psk(p, 8)
}

/// N-PSK point e^{j 2 pi n / N}
pub fn psk(n: usize, alphabet: usize) -> Complex64 {
    Complex64::from_polar(1.0, 2.0 * PI * (n % alphabet) as f64 / alphabet as f64)
}

/// Stack per-column blocks into a precoder
///
/// `blocks[c]` lists the coefficient of each port block for column `c`. All blocks use the
/// same beam `beams[c]`.
pub fn stack_columns(
    beams: &[DVector<Complex64>],
    blocks: &[Vec<Complex64>],
    norm: f64,
) -> DMatrix<Complex64> {
    let block_len = beams.first().map(|b| b.len()).unwrap_or(0);
    let num_blocks = blocks.first().map(|b| b.len()).unwrap_or(0);
    let mut w = DMatrix::zeros(block_len * num_blocks, beams.len());
    for (c, (beam, coeffs)) in beams.iter().zip(blocks).enumerate() {
        for (b, &coeff) in coeffs.iter().enumerate() {
            for (x, &value) in beam.iter().enumerate() {
                w[(b * block_len + x, c)] = value * coeff * norm;
            }
        }
    }
    w
}
