use std::process::ExitCode;

use clap::Parser;

use quantas_sim::cli::Cli;
use quantas_sim::errors::SimError;
use quantas_sim::logging;

/// Exit codes: 0 on success, 2 on configuration error, 1 on any other
/// internal failure (invariant violation, I/O, serialization).
fn main() -> ExitCode {
    logging::init_logging();

    let cli = Cli::parse();
    match cli.execute() {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            let is_config_error = matches!(err.downcast_ref::<SimError>(), Some(SimError::Config(_)));
            eprintln!("{err:#}");
            if is_config_error {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
