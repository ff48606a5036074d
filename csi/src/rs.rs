//! CSI-RS Resources
//!
//! Resource element coordinates of the CSI reference signals used for channel measurement.
//! Based on 3GPP TS 38.211 Section 7.4.1.5 and TS 38.214 Section 5.2.2.3.1

use crate::CsiError;
use interfaces::CsiRsResourceRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Zero-based resource element coordinate relative to the carrier grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReIndex {
    pub subcarrier: u32,
    pub symbol: u32,
    pub port: u32,
}

/// CSI-RS power type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsiRsPower {
    NonZero,
    Zero,
}

/// One CSI-RS resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsiRsResource {
    pub power: CsiRsPower,
    /// Number of antenna ports
    pub ports: u16,
    /// CDM group length
    pub cdm_length: u8,
    /// Resource elements of every port
    pub indices: Vec<ReIndex>,
}

impl From<&CsiRsResourceRecord> for CsiRsResource {
    fn from(record: &CsiRsResourceRecord) -> Self {
        Self {
            power: if record.zero_power { CsiRsPower::Zero } else { CsiRsPower::NonZero },
            ports: record.ports,
            cdm_length: record.cdm_length,
            indices: record
                .indices
                .iter()
                .map(|&[subcarrier, symbol, port]| ReIndex { subcarrier, symbol, port })
                .collect(),
        }
    }
}

/// Measurement resource elements shared by all non-zero-power resources
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CsiRsGrid {
    /// Port count common to the resources, `None` when there are none
    pub ports: Option<u16>,
    /// CDM length common to the resources
    pub cdm_length: Option<u8>,
    /// Sorted unique (subcarrier, symbol) pairs of port 0
    pub elements: Vec<(usize, usize)>,
}

impl CsiRsGrid {
    /// Collect the measurement REs
    ///
    /// Zero-power resources are dropped. The remaining resources must agree on port count
    /// and CDM length.
    pub fn from_resources(resources: &[CsiRsResource]) -> Result<Self, CsiError> {
        let mut ports = None;
        let mut cdm_length = None;
        let mut elements = BTreeSet::new();

        for resource in resources.iter().filter(|r| r.power == CsiRsPower::NonZero) {
            match ports {
                Some(p) if p != resource.ports => {
                    return Err(CsiError::InvalidInput(format!(
                        "CSI-RS resources disagree on port count: {} and {}",
                        p, resource.ports
                    )));
                }
                _ => ports = Some(resource.ports),
            }
            match cdm_length {
                Some(c) if c != resource.cdm_length => {
                    return Err(CsiError::InvalidInput(format!(
                        "CSI-RS resources disagree on CDM length: {} and {}",
                        c, resource.cdm_length
                    )));
                }
                _ => cdm_length = Some(resource.cdm_length),
            }

            elements.extend(
                resource
                    .indices
                    .iter()
                    .filter(|re| re.port == 0)
                    .map(|re| (re.subcarrier as usize, re.symbol as usize)),
            );
        }

        debug!(
            "CSI-RS grid: {} measurement REs, ports {:?}, CDM length {:?}",
            elements.len(),
            ports,
            cdm_length
        );

        Ok(Self {
            ports,
            cdm_length,
            elements: elements.into_iter().collect(),
        })
    }

    /// Convert snapshot records
    pub fn from_records(records: &[CsiRsResourceRecord]) -> Result<Self, CsiError> {
        let resources: Vec<CsiRsResource> = records.iter().map(CsiRsResource::from).collect();
        Self::from_resources(&resources)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(power: CsiRsPower, ports: u16, cdm: u8, res: &[(u32, u32)]) -> CsiRsResource {
        let indices = res
            .iter()
            .flat_map(|&(k, l)| {
                (0..ports as u32).map(move |port| ReIndex { subcarrier: k, symbol: l, port })
            })
            .collect();
        CsiRsResource { power, ports, cdm_length: cdm, indices }
    }

    #[test]
    fn test_zero_power_dropped() {
        let resources = vec![
            resource(CsiRsPower::Zero, 4, 2, &[(0, 5)]),
            resource(CsiRsPower::NonZero, 2, 2, &[(12, 5), (0, 5), (12, 5)]),
        ];
        let grid = CsiRsGrid::from_resources(&resources).unwrap();
        assert_eq!(grid.ports, Some(2));
        assert_eq!(grid.elements, vec![(0, 5), (12, 5)]);
    }

    #[test]
    fn test_mismatched_resources_rejected() {
        let resources = vec![
            resource(CsiRsPower::NonZero, 2, 2, &[(0, 5)]),
            resource(CsiRsPower::NonZero, 4, 2, &[(12, 5)]),
        ];
        assert!(matches!(
            CsiRsGrid::from_resources(&resources),
            Err(CsiError::InvalidInput(_))
        ));

        let resources = vec![
            resource(CsiRsPower::NonZero, 2, 2, &[(0, 5)]),
            resource(CsiRsPower::NonZero, 2, 1, &[(12, 5)]),
        ];
        assert!(CsiRsGrid::from_resources(&resources).is_err());
    }

    #[test]
    fn test_empty_grid_is_not_an_error() {
        let grid = CsiRsGrid::from_resources(&[resource(CsiRsPower::Zero, 2, 2, &[(0, 5)])]).unwrap();
        assert!(grid.is_empty());
        assert_eq!(grid.ports, None);
    }

    #[test]
    fn test_from_records() {
        let records = vec![CsiRsResourceRecord {
            zero_power: false,
            ports: 1,
            cdm_length: 1,
            indices: vec![[24, 5, 0], [0, 5, 0]],
        }];
        let grid = CsiRsGrid::from_records(&records).unwrap();
        assert_eq!(grid.elements, vec![(0, 5), (24, 5)]);
    }
}
