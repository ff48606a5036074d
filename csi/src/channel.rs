//! Channel Estimate
//!
//! Holds the estimated channel tensor and extracts the per-RE channel matrices at the
//! CSI-RS measurement positions of a bandwidth part.

use crate::rs::CsiRsGrid;
use crate::CsiError;
use common::{BandwidthPart, CarrierGrid, SUBCARRIERS_PER_RB};
use interfaces::ChannelSnapshot;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::Array4;
use num_complex::Complex64;
use std::cmp::Ordering;
use tracing::{debug, trace};

/// Floor applied to the noise variance before any SINR computation
pub const NOISE_VARIANCE_FLOOR: f64 = 1e-10;

/// Estimated channel over the carrier grid, indexed [subcarrier, symbol, rx antenna, port]
#[derive(Debug, Clone)]
pub struct ChannelEstimate {
    h: Array4<Complex64>,
}

/// Channel matrix at one CSI-RS resource element
#[derive(Debug, Clone)]
pub struct ReSample {
    /// Subcarrier relative to the carrier grid
    pub subcarrier: usize,
    pub symbol: usize,
    /// Resource block relative to the start of the BWP
    pub rb: usize,
    /// Nr x P channel matrix
    pub h: DMatrix<Complex64>,
}

impl ChannelEstimate {
    pub fn new(h: Array4<Complex64>) -> Self {
        Self { h }
    }

    pub fn tensor(&self) -> &Array4<Complex64> {
        &self.h
    }

    pub fn num_subcarriers(&self) -> usize {
        self.h.shape()[0]
    }

    pub fn num_symbols(&self) -> usize {
        self.h.shape()[1]
    }

    pub fn rx_antennas(&self) -> usize {
        self.h.shape()[2]
    }

    pub fn ports(&self) -> usize {
        self.h.shape()[3]
    }

    /// Channel matrix at one resource element
    pub fn matrix_at(&self, k: usize, l: usize) -> DMatrix<Complex64> {
        DMatrix::from_fn(self.rx_antennas(), self.ports(), |r, p| self.h[[k, l, r, p]])
    }

    /// Check that the tensor covers the carrier grid
    pub fn check_carrier(&self, carrier: &CarrierGrid) -> Result<(), CsiError> {
        if self.num_subcarriers() < carrier.num_subcarriers() {
            return Err(CsiError::InvalidInput(format!(
                "Channel estimate has {} subcarriers, carrier needs {}",
                self.num_subcarriers(),
                carrier.num_subcarriers()
            )));
        }
        if self.rx_antennas() == 0 || self.ports() == 0 {
            return Err(CsiError::InvalidInput(
                "Channel estimate has no antennas".to_string(),
            ));
        }
        Ok(())
    }

    /// Channel matrices at the CSI-RS REs inside the BWP
    ///
    /// REs outside the BWP or the tensor are skipped, as are REs whose channel matrix
    /// holds any non-finite value.
    pub fn gather(
        &self,
        carrier: &CarrierGrid,
        bwp: &BandwidthPart,
        grid: &CsiRsGrid,
    ) -> Vec<ReSample> {
        let offset = bwp.subcarrier_offset(carrier);
        let end = offset + bwp.num_subcarriers();
        let mut dropped = 0usize;

        let samples: Vec<ReSample> = grid
            .elements
            .iter()
            .filter(|&&(k, l)| {
                k >= offset && k < end && k < self.num_subcarriers() && l < self.num_symbols()
            })
            .filter_map(|&(k, l)| {
                let h = self.matrix_at(k, l);
                if h.iter().all(|v| v.re.is_finite() && v.im.is_finite()) {
                    Some(ReSample {
                        subcarrier: k,
                        symbol: l,
                        rb: (k - offset) / SUBCARRIERS_PER_RB,
                        h,
                    })
                } else {
                    dropped += 1;
                    None
                }
            })
            .collect();

        debug!(
            "Gathered {} CSI-RS samples in BWP, dropped {} non-finite",
            samples.len(),
            dropped
        );
        samples
    }
}

impl TryFrom<&ChannelSnapshot> for ChannelEstimate {
    type Error = CsiError;

    fn try_from(snapshot: &ChannelSnapshot) -> Result<Self, Self::Error> {
        snapshot.check_shape()?;
        let [k, l, r, p] = snapshot.shape;
        let data = snapshot
            .samples
            .iter()
            .map(|&[re, im]| Complex64::new(re, im))
            .collect();
        let h = Array4::from_shape_vec((k, l, r, p), data)
            .map_err(|e| CsiError::InvalidInput(format!("Channel tensor shape: {}", e)))?;
        Ok(Self { h })
    }
}

/// Noise variance used for SINR computation
pub fn effective_noise_variance(noise_variance: f64) -> f64 {
    if noise_variance.is_finite() {
        noise_variance.max(NOISE_VARIANCE_FLOOR)
    } else {
        NOISE_VARIANCE_FLOOR
    }
}

/// Transmit-side covariance: mean of H^H H over the samples
pub fn covariance<'a, I>(samples: I, ports: usize) -> Option<DMatrix<Complex64>>
where
    I: IntoIterator<Item = &'a ReSample>,
{
    let mut sum = DMatrix::<Complex64>::zeros(ports, ports);
    let mut count = 0usize;
    for sample in samples {
        sum += sample.h.adjoint() * &sample.h;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(sum.unscale(count as f64))
}

/// Eigenvectors of the `count` largest eigenvalues of a Hermitian matrix, strongest first
pub fn dominant_eigenvectors(cov: &DMatrix<Complex64>, count: usize) -> Vec<DVector<Complex64>> {
    let eigen = SymmetricEigen::new(cov.clone());
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(Ordering::Equal)
    });
    trace!(
        "Strongest eigenvalue {:?} of {}",
        order.first().map(|&i| eigen.eigenvalues[i]),
        eigen.eigenvalues.len()
    );
    order
        .into_iter()
        .take(count)
        .map(|i| eigen.eigenvectors.column(i).into_owned())
        .collect()
}

/// Random Rayleigh-like samples, one per RB, for unit tests
#[cfg(test)]
pub(crate) fn random_samples(seed: u64, count: usize, rx: usize, ports: usize) -> Vec<ReSample> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|rb| ReSample {
            subcarrier: rb * 12,
            symbol: 5,
            rb,
            h: DMatrix::from_fn(rx, ports, |_, _| {
                Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
            }),
        })
        .collect()
}
