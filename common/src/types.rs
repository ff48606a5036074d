//! Common Types for 5G NR Resource Grids
//!
//! Defines the carrier and bandwidth part geometry used throughout the CSI engine

use serde::{Deserialize, Serialize};

/// Number of subcarriers per resource block
pub const SUBCARRIERS_PER_RB: usize = 12;

/// Maximum number of resource blocks in a carrier or bandwidth part
pub const MAX_RBS: u16 = 275;

/// Maximum common resource block index a carrier may start at
pub const MAX_CRB_START: u16 = 2199;

/// Carrier resource grid (TS 38.211 Section 4.4.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CarrierGrid {
    /// Starting common resource block of the carrier (NStartGrid)
    pub n_start_grid: u16,
    /// Carrier size in resource blocks (NSizeGrid)
    pub n_size_grid: u16,
}

impl CarrierGrid {
    /// Create a new carrier grid with validation
    pub fn new(n_start_grid: u16, n_size_grid: u16) -> Option<Self> {
        if n_start_grid <= MAX_CRB_START && (1..=MAX_RBS).contains(&n_size_grid) {
            Some(Self { n_start_grid, n_size_grid })
        } else {
            None
        }
    }

    /// Number of subcarriers spanned by the grid
    pub fn num_subcarriers(&self) -> usize {
        self.n_size_grid as usize * SUBCARRIERS_PER_RB
    }

    /// Check whether a bandwidth part lies entirely within the carrier
    pub fn contains(&self, bwp: &BandwidthPart) -> bool {
        bwp.n_start >= self.n_start_grid
            && bwp.n_start as u32 + bwp.n_size as u32
                <= self.n_start_grid as u32 + self.n_size_grid as u32
    }
}

/// Bandwidth part (TS 38.211 Section 4.4.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BandwidthPart {
    /// Starting common resource block (NStartBWP)
    pub n_start: u16,
    /// Size in resource blocks (NSizeBWP)
    pub n_size: u16,
}

impl BandwidthPart {
    /// Create a new bandwidth part with validation
    pub fn new(n_start: u16, n_size: u16) -> Option<Self> {
        if n_start <= MAX_CRB_START + MAX_RBS && (1..=MAX_RBS).contains(&n_size) {
            Some(Self { n_start, n_size })
        } else {
            None
        }
    }

    /// One past the last common resource block of the BWP
    pub fn end(&self) -> u16 {
        self.n_start + self.n_size
    }

    /// First subcarrier of the BWP relative to the start of the carrier grid
    pub fn subcarrier_offset(&self, carrier: &CarrierGrid) -> usize {
        (self.n_start - carrier.n_start_grid) as usize * SUBCARRIERS_PER_RB
    }

    /// Number of subcarriers in the BWP
    pub fn num_subcarriers(&self) -> usize {
        self.n_size as usize * SUBCARRIERS_PER_RB
    }
}
