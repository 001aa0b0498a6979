//! On-prem smoke test orchestration
//!
//! This crate drives the record/replay debugging server end to end:
//! - Clones and builds a sample project, records it with the tracer
//! - Spawns the server as a subprocess and scrapes its URL from stdout
//! - Drives a browser over WebDriver to check sources and notebook persistence
//! - Verifies container cleanup and the exported source archive
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               Scenario<L: BrowserLauncher>               │
//! ├──────────────────────────────────────────────────────────┤
//! │  provision -> build -> record -> build_database          │
//! │    -> serve_and_read_sources -> notebook_write           │
//! │    -> restart_and_verify -> container_cleanup_check      │
//! │    -> export_verify -> teardown                          │
//! ├──────────────────────────────────────────────────────────┤
//! │  Cmd             run / capture / spawn                   │
//! │  ServerHandle    start (URL scrape) / stop (SIGINT)      │
//! │  BrowserSession  Poller + Attempts over BrowserDriver    │
//! │                  (GeckoDriver via GeckoLauncher)         │
//! │  WorkEnvironment TraceAllocator, BindMount               │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod archive;
pub mod browser;
pub mod config;
pub mod error;
pub mod process;
pub mod retry;
pub mod scenario;
pub mod server;
pub mod verdict;
pub mod webdriver;
pub mod workspace;

pub use browser::{BrowserDriver, BrowserLauncher, BrowserSession};
pub use config::SmokeConfig;
pub use error::{E2eError, E2eResult};
pub use scenario::{RunOutcome, RunReport, Scenario, Stage};
pub use server::ServerHandle;
