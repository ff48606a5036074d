//! Albor CSI Feedback Tool
//!
//! Runs the CSI engine on a stored channel snapshot and prints the RI, PMI and CQI report
//! as JSON. Can also write synthetic Rayleigh snapshots for smoke testing.

mod config;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use csi::{ChannelEstimate, CsiReporter, CsiRsGrid};
use interfaces::{ChannelSnapshot, CsiRsResourceRecord};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use config::{ObjectiveName, ReportFileConfig};

/// Symbols per slot with normal cyclic prefix
const SYMBOLS_PER_SLOT: usize = 14;

/// OFDM symbol carrying the synthetic CSI-RS
const SYNTH_CSI_RS_SYMBOL: u32 = 5;

/// Albor CSI feedback engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute a CSI report from a channel snapshot
    Report {
        /// Report configuration (.yaml or .toml)
        #[arg(short, long)]
        config: PathBuf,

        /// Channel snapshot (.json, anything else is bincode)
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Override the RI objective of the configuration
        #[arg(long, value_enum)]
        objective: Option<ObjectiveName>,
    },
    /// Write a synthetic i.i.d. Rayleigh channel snapshot
    Synth {
        /// Output snapshot (.json, anything else is bincode)
        #[arg(short, long)]
        output: PathBuf,

        /// CSI-RS ports
        #[arg(long, default_value = "4")]
        ports: usize,

        /// Receive antennas
        #[arg(long, default_value = "2")]
        rx: usize,

        /// Carrier size in resource blocks
        #[arg(long, default_value = "52")]
        rbs: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        #[arg(long, default_value = "0.01")]
        noise_variance: f64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Report { config, snapshot, objective } => run_report(config, snapshot, objective),
        Command::Synth { output, ports, rx, rbs, seed, noise_variance } => {
            let snapshot = synthetic_snapshot(ports, rx, rbs, seed, noise_variance)?;
            snapshot
                .save(&output)
                .with_context(|| format!("Failed to write snapshot {}", output.display()))?;
            info!(
                "Wrote synthetic snapshot {}: {} RBs, {} rx, {} ports",
                output.display(),
                rbs,
                rx,
                ports
            );
            Ok(())
        }
    }
}

fn run_report(
    config_path: PathBuf,
    snapshot_path: PathBuf,
    objective: Option<ObjectiveName>,
) -> Result<()> {
    let mut config = ReportFileConfig::load(&config_path)?.into_report_config()?;
    if let Some(objective) = objective {
        config.ri_objective = objective.into();
    }
    debug!("Report configuration: {:?}", config);

    let snapshot = ChannelSnapshot::load(&snapshot_path)
        .with_context(|| format!("Failed to load snapshot {}", snapshot_path.display()))?;
    let channel = ChannelEstimate::try_from(&snapshot)?;
    let csirs = CsiRsGrid::from_records(&snapshot.csi_rs)?;

    let reporter = CsiReporter::with_default_model(config);
    let report = reporter.compute(&channel, &csirs, snapshot.noise_variance)?;
    info!(
        "RI {:?}, wideband CQI {:?}, {} CSI-RS samples",
        report.ri,
        report.cqi.wideband_cqi(),
        report.diagnostics.num_samples
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// I.i.d. Rayleigh channel over the whole grid with one CSI-RS RE per RB
fn synthetic_snapshot(
    ports: usize,
    rx: usize,
    rbs: usize,
    seed: u64,
    noise_variance: f64,
) -> Result<ChannelSnapshot> {
    let ports_u16 = u16::try_from(ports).context("Too many ports")?;
    let mut rng = StdRng::seed_from_u64(seed);
    let component = Normal::new(0.0, 1.0 / 2.0_f64.sqrt())
        .map_err(|e| anyhow!("Invalid Rayleigh distribution: {}", e))?;

    let shape = [rbs * 12, SYMBOLS_PER_SLOT, rx, ports];
    let count: usize = shape.iter().product();
    let samples = (0..count)
        .map(|_| [component.sample(&mut rng), component.sample(&mut rng)])
        .collect();

    let indices = (0..rbs as u32)
        .flat_map(|rb| (0..ports_u16 as u32).map(move |port| [rb * 12, SYNTH_CSI_RS_SYMBOL, port]))
        .collect();
    let resource = CsiRsResourceRecord {
        zero_power: false,
        ports: ports_u16,
        cdm_length: 1,
        indices,
    };

    Ok(ChannelSnapshot::new(shape, samples, noise_variance, vec![resource])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BandwidthPart, CarrierGrid};
    use csi::{CodebookConfig, CsiReportConfig, PanelDims, SinglePanelConfig};

    #[test]
    fn test_synthetic_snapshot_layout() {
        let snapshot = synthetic_snapshot(2, 2, 4, 1, 0.1).unwrap();
        assert_eq!(snapshot.shape, [48, 14, 2, 2]);
        assert_eq!(snapshot.samples.len(), 48 * 14 * 4);
        assert_eq!(snapshot.csi_rs.len(), 1);
        assert_eq!(snapshot.csi_rs[0].indices.len(), 8);
        assert_eq!(snapshot.csi_rs[0].indices[3], [12, 5, 1]);
    }

    #[test]
    fn test_synthetic_snapshot_is_seeded() {
        let a = synthetic_snapshot(1, 1, 2, 7, 0.1).unwrap();
        let b = synthetic_snapshot(1, 1, 2, 7, 0.1).unwrap();
        let c = synthetic_snapshot(1, 1, 2, 8, 0.1).unwrap();
        assert_eq!(a.samples, b.samples);
        assert_ne!(a.samples, c.samples);
    }

    #[test]
    fn test_report_on_synthetic_snapshot() {
        let snapshot = synthetic_snapshot(4, 2, 24, 3, 0.01).unwrap();
        let channel = ChannelEstimate::try_from(&snapshot).unwrap();
        let csirs = CsiRsGrid::from_records(&snapshot.csi_rs).unwrap();

        let mut config = CsiReportConfig::new(
            CarrierGrid::new(0, 24).unwrap(),
            BandwidthPart::new(0, 24).unwrap(),
        );
        config.codebook = CodebookConfig::Type1SinglePanel(SinglePanelConfig {
            panel: PanelDims::new(2, 1),
            ..Default::default()
        });
        let report = CsiReporter::with_default_model(config)
            .compute(&channel, &csirs, snapshot.noise_variance)
            .unwrap();
        assert!(report.is_reported());
        assert_eq!(report.diagnostics.num_samples, 24);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("ri").is_some());
        assert!(json.get("diagnostics").is_none());
    }
}
