//! CLI entry point: one `RunCmd` with `--config`, `--out`, `--trials`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;

use crate::config::Scenario;
use crate::errors::SimError;
use crate::simulation;

#[derive(Debug, Clone, Parser)]
#[command(name = "quantas-sim", about = "Discrete-event BFT consensus simulator")]
pub struct Cli {
    /// Path to the scenario file (TOML or JSON, by extension).
    #[arg(long)]
    pub config: PathBuf,

    /// Where to write the per-round JSON log. Defaults to stdout.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Number of independent trials to run from the same scenario.
    #[arg(long, default_value_t = 1)]
    pub trials: usize,
}

impl Cli {
    /// Loads the scenario, runs `trials` independent trials, and flushes
    /// the merged, time-ordered log to `--out` (or stdout).
    ///
    /// Returns `anyhow::Result` at the CLI boundary; the underlying
    /// `SimError` is still recoverable via `anyhow::Error::downcast_ref`,
    /// which `main` uses to pick the process exit code (2 for configuration
    /// errors, 1 otherwise).
    pub fn execute(&self) -> anyhow::Result<()> {
        self.run().map_err(anyhow::Error::from)
    }

    fn run(&self) -> Result<(), SimError> {
        let scenario = Scenario::load(&self.config)?;
        log::info!(
            "loaded scenario: {} peers, protocol={}, {} trial(s)",
            scenario.topology.peers,
            scenario.protocol.name,
            self.trials
        );

        let all_records = simulation::run_trials(&scenario, self.trials)?;

        let mut writer: Box<dyn Write> = match &self.out {
            Some(path) => Box::new(BufWriter::new(File::create(path)?)),
            None => Box::new(BufWriter::new(io::stdout())),
        };
        for trial_records in &all_records {
            for record in trial_records {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}
