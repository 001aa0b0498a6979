//! Pass/fail signal
//!
//! Callers only look for the terminal `PASS` line on stderr. Its absence, for
//! whatever reason, is the failure signal.

use std::io::Write;
use std::process::ExitCode;

use tracing::error;

use crate::error::E2eResult;

pub const PASS_MARKER: &str = "PASS";

/// Write the verdict for `outcome` to `out`. Returns whether the run passed.
pub fn write_verdict<W: Write>(out: &mut W, outcome: &E2eResult<()>) -> std::io::Result<bool> {
    match outcome {
        Ok(()) => {
            writeln!(out, "\n{}", PASS_MARKER)?;
            out.flush()?;
            Ok(true)
        }
        Err(e) => {
            error!("Smoke test failed: {}", e);
            let mut source = std::error::Error::source(e);
            while let Some(cause) = source {
                error!("  caused by: {}", cause);
                source = cause.source();
            }
            Ok(false)
        }
    }
}

/// Emit the verdict on stderr and map it to the process exit code.
pub fn report(outcome: &E2eResult<()>) -> ExitCode {
    let stderr = std::io::stderr();
    match write_verdict(&mut stderr.lock(), outcome) {
        Ok(true) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
