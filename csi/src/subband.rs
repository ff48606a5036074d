//! Subband Partitioning
//!
//! Splits a bandwidth part into CSI reporting subbands or precoding resource groups.
//! Based on 3GPP TS 38.214 Section 5.2.1.4 (Table 5.2.1.4-2) and Section 5.1.2.3

use crate::config::{ReportingMode, MIN_SUBBAND_BWP_SIZE};
use crate::CsiError;
use common::BandwidthPart;
use serde::Serialize;
use tracing::debug;

/// Ordered subband sizes in resource blocks, summing to the BWP size
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubbandInfo {
    /// Size of each subband in RBs
    pub sizes: Vec<u16>,
}

/// Allowed subband sizes for a BWP size (TS 38.214 Table 5.2.1.4-2)
pub fn valid_subband_sizes(bwp_size: u16) -> Option<[u16; 2]> {
    match bwp_size {
        24..=72 => Some([4, 8]),
        73..=144 => Some([8, 16]),
        145..=275 => Some([16, 32]),
        _ => None,
    }
}

/// Check a configured subband size against the size table
pub fn check_subband_size(bwp_size: u16, subband_size: u16) -> Result<(), CsiError> {
    match valid_subband_sizes(bwp_size) {
        Some(sizes) if sizes.contains(&subband_size) => Ok(()),
        Some(sizes) => Err(CsiError::InvalidConfiguration(format!(
            "Subband size {} is not allowed for a BWP of {} RBs, expected {} or {}",
            subband_size, bwp_size, sizes[0], sizes[1]
        ))),
        None => Err(CsiError::InvalidConfiguration(format!(
            "BWP of {} RBs does not support subband reporting",
            bwp_size
        ))),
    }
}

impl SubbandInfo {
    /// A single subband spanning the whole BWP
    pub fn wideband(bwp: &BandwidthPart) -> Self {
        Self { sizes: vec![bwp.n_size] }
    }

    /// Reporting subbands for the given mode
    ///
    /// Wideband mode and BWPs smaller than 24 RBs give one subband. Otherwise the
    /// subband size must come from the size table.
    pub fn new(
        bwp: &BandwidthPart,
        subband_size: Option<u16>,
        mode: ReportingMode,
    ) -> Result<Self, CsiError> {
        if mode == ReportingMode::Wideband || bwp.n_size < MIN_SUBBAND_BWP_SIZE {
            return Ok(Self::wideband(bwp));
        }
        let size = subband_size.ok_or_else(|| {
            CsiError::InvalidConfiguration("Subband reporting requires a subband size".to_string())
        })?;
        check_subband_size(bwp.n_size, size)?;
        let info = Self::with_size(bwp, size);
        debug!(
            "Partitioned BWP {}+{} into {} subbands of nominal size {}",
            bwp.n_start,
            bwp.n_size,
            info.num_subbands(),
            size
        );
        Ok(info)
    }

    /// Precoding resource groups of 2 or 4 RBs
    pub fn prg(bwp: &BandwidthPart, prg_size: u16) -> Result<Self, CsiError> {
        if prg_size != 2 && prg_size != 4 {
            return Err(CsiError::InvalidConfiguration(format!(
                "PRG size must be 2 or 4, got {}",
                prg_size
            )));
        }
        Ok(Self::with_size(bwp, prg_size))
    }

    /// Partition aligned to common resource block boundaries, without table checks
    ///
    /// The first subband absorbs `size - (start mod size)` RBs and the last one
    /// takes the remainder.
    pub fn with_size(bwp: &BandwidthPart, size: u16) -> Self {
        if size == 0 {
            return Self::wideband(bwp);
        }
        let first = size - bwp.n_start % size;
        if first >= bwp.n_size {
            return Self::wideband(bwp);
        }

        let mut sizes = vec![first];
        let mut remaining = bwp.n_size - first;
        while remaining > size {
            sizes.push(size);
            remaining -= size;
        }
        if remaining > 0 {
            sizes.push(remaining);
        }
        Self { sizes }
    }

    /// Split every subband into `parts` PMI subbands (enhanced Type II, R = 2)
    pub fn split(&self, bwp: &BandwidthPart, nominal_size: u16, parts: u8) -> Self {
        if parts <= 1 || self.num_subbands() == 1 {
            return self.clone();
        }
        Self::with_size(bwp, nominal_size / parts as u16)
    }

    pub fn num_subbands(&self) -> usize {
        self.sizes.len()
    }

    pub fn total_rbs(&self) -> usize {
        self.sizes.iter().map(|&s| s as usize).sum()
    }

    /// BWP-relative first RB of each subband
    pub fn starts(&self) -> Vec<usize> {
        self.sizes
            .iter()
            .scan(0usize, |start, &size| {
                let current = *start;
                *start += size as usize;
                Some(current)
            })
            .collect()
    }

    /// Subband holding a BWP-relative RB
    pub fn subband_of_rb(&self, rb: usize) -> Option<usize> {
        let mut end = 0usize;
        for (idx, &size) in self.sizes.iter().enumerate() {
            end += size as usize;
            if rb < end {
                return Some(idx);
            }
        }
        None
    }
}
