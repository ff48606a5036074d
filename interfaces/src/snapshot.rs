//! Channel Snapshots
//!
//! Serializable form of one CSI computation opportunity: the estimated channel tensor,
//! the noise variance and the CSI-RS resources it was estimated from.

use crate::InterfaceError;
use bytes::Bytes;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// CSI-RS resource as produced by the indices-generation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiRsResourceRecord {
    /// Zero-power resource (interference measurement only)
    #[serde(default)]
    pub zero_power: bool,
    /// Number of CSI-RS ports
    pub ports: u16,
    /// CDM group length (1, 2, 4 or 8)
    pub cdm_length: u8,
    /// Zero-based (subcarrier, symbol, port) resource element coordinates
    pub indices: Vec<[u32; 3]>,
}

/// Channel estimate snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Tensor shape [subcarriers, symbols, receive antennas, transmit ports]
    pub shape: [usize; 4],
    /// Row-major samples as [re, im] pairs
    pub samples: Vec<[f64; 2]>,
    /// Noise variance estimate
    pub noise_variance: f64,
    /// CSI-RS resources the estimate was derived from
    pub csi_rs: Vec<CsiRsResourceRecord>,
}

impl ChannelSnapshot {
    /// Create a snapshot, checking that the sample count matches the shape
    pub fn new(
        shape: [usize; 4],
        samples: Vec<[f64; 2]>,
        noise_variance: f64,
        csi_rs: Vec<CsiRsResourceRecord>,
    ) -> Result<Self, InterfaceError> {
        let snapshot = Self { shape, samples, noise_variance, csi_rs };
        snapshot.check_shape()?;
        Ok(snapshot)
    }

    /// Verify the sample buffer against the declared shape
    pub fn check_shape(&self) -> Result<(), InterfaceError> {
        let expected: usize = self.shape.iter().product();
        if expected != self.samples.len() {
            return Err(InterfaceError::InvalidSnapshot(format!(
                "shape {:?} needs {} samples, found {}",
                self.shape,
                expected,
                self.samples.len()
            )));
        }
        Ok(())
    }

    /// Complex sample at [subcarrier, symbol, rx, port]
    pub fn sample(&self, k: usize, l: usize, r: usize, p: usize) -> Complex64 {
        let [_, n_sym, n_rx, n_port] = self.shape;
        let [re, im] = self.samples[((k * n_sym + l) * n_rx + r) * n_port + p];
        Complex64::new(re, im)
    }

    /// Encode with bincode
    pub fn encode(&self) -> Result<Bytes, InterfaceError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode from bincode
    pub fn decode(data: &[u8]) -> Result<Self, InterfaceError> {
        let snapshot: ChannelSnapshot = bincode::deserialize(data)?;
        snapshot.check_shape()?;
        Ok(snapshot)
    }

    /// Load a snapshot; `.json` files are JSON, anything else bincode
    pub fn load(path: &Path) -> Result<Self, InterfaceError> {
        let data = std::fs::read(path)?;
        let snapshot = if is_json(path) {
            let snapshot: ChannelSnapshot = serde_json::from_slice(&data)?;
            snapshot.check_shape()?;
            snapshot
        } else {
            Self::decode(&data)?
        };
        info!(
            "Loaded channel snapshot {} with shape {:?}, {} CSI-RS resources",
            path.display(),
            snapshot.shape,
            snapshot.csi_rs.len()
        );
        Ok(snapshot)
    }

    /// Save a snapshot; `.json` files are JSON, anything else bincode
    pub fn save(&self, path: &Path) -> Result<(), InterfaceError> {
        let data = if is_json(path) {
            Bytes::from(serde_json::to_vec_pretty(self)?)
        } else {
            self.encode()?
        };
        std::fs::write(path, &data)?;
        debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
