//! # stan-bench - Main Entry Point
//!
//! Runs one publish/subscribe throughput benchmark and prints the report.
//!
//! ## Execution Flow
//!
//! 1. **Parse arguments**: clap rejects malformed input with usage text
//! 2. **Initialize logging**: colorized stderr output, optional log file
//! 3. **Build configuration**: benchmark parameters and connect options are
//!    validated before any worker starts
//! 4. **Run the benchmark**: every worker is joined, failed or not
//! 5. **Report**: the text report goes to stdout, CSV/JSON exports to the
//!    requested files
//!
//! ## Exit Status
//!
//! Zero when every worker completed. When some workers failed, the report
//! for the samples that were collected is still printed, the failures are
//! listed, and the process exits with a non-zero status.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use stan_bench::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::BenchArgs,
    client::connector_for,
    logging::init_logging,
    results::{Report, ResultsManager},
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BenchArgs::parse();
    let _log_guard = init_logging(args.log.verbose, args.log.quiet, args.log.log_file.as_deref())?;

    info!("Starting stan-bench {}", stan_bench::VERSION);

    let config = BenchmarkConfig::from_args(&args)?;
    let options = args
        .connect
        .to_options()
        .context("Invalid connection options")?;
    let connector = connector_for(options)?;
    let backend = connector.name();

    let runner = BenchmarkRunner::new(config, connector);
    let outcome = runner.run().await?;

    print!("{}", Report::from_outcome(&outcome));

    let results_manager = ResultsManager::new(args.csv.as_deref(), args.json.as_deref());
    if results_manager.is_enabled() {
        for path in results_manager.finalize(&outcome, runner.config(), backend)? {
            println!("Saved results in {}", path.display());
        }
    }

    if outcome.is_success() {
        return Ok(());
    }
    for failure in &outcome.failures {
        error!("{}", failure);
    }
    Err(anyhow!(
        "{} worker(s) failed, results above are partial",
        outcome.failures.len()
    ))
}
