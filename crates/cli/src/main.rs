//! On-prem smoke test - Main Entry Point
//!
//! Runs the full record/serve/verify pipeline against a local server build
//! and prints `PASS` on stderr when every stage succeeds.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use onprem_e2e::verdict;
use onprem_e2e::webdriver::GeckoLauncher;
use onprem_e2e::{Scenario, SmokeConfig};

/// Run on-prem smoketests.
#[derive(Parser, Debug)]
#[command(name = "onprem-smoke")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The directory to run tests in (defaults to a fresh temp dir)
    tmpdir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, env = "ONPREM_SMOKE_CONFIG")]
    config: Option<PathBuf>,

    /// Run browser in headless mode
    #[arg(long)]
    headless: bool,

    /// Don't try to pull under any circumstances
    #[arg(long)]
    no_pull: bool,

    /// Write a JSON run report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<SmokeConfig> {
        let mut config = match &self.config {
            Some(path) => SmokeConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => SmokeConfig::default(),
        };

        if self.headless {
            config.browser.headless = true;
        }
        if self.no_pull {
            config.server.pull = false;
        }
        if let Some(tmpdir) = &self.tmpdir {
            config.workspace.root = Some(tmpdir.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.load_config()?;
    if cli.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut launcher = GeckoLauncher::new(&config.tools.geckodriver, config.browser.headless);
    launcher.port = config.browser.webdriver_port;
    launcher.command_timeout = config.browser.command_timeout();

    info!("On-prem smoke test v{}", env!("CARGO_PKG_VERSION"));
    let scenario = Scenario::new(config, launcher).context("preparing work environment")?;
    let outcome = scenario.run().await;

    if let Some(path) = &cli.report {
        if let Err(e) = outcome.report.write(path) {
            warn!("Failed to write run report to {}: {}", path.display(), e);
        }
    }

    Ok(verdict::report(&outcome.result))
}
