//! Startup checks
//!
//! Preflight run before the daemon starts:
//! - the encoder binary answers `--version`
//! - state, scratch and storage directories exist and are writable

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("directory {path} is not usable: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Check that `binary --version` runs and exits cleanly.
pub fn check_encoder_available(binary: &str) -> Result<(), StartupError> {
    let output = Command::new(binary).arg("--version").output().map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} --version failed; is it built and in PATH? Error: {}",
            binary, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} --version exited with {}",
            binary, output.status
        )));
    }
    Ok(())
}

fn ensure_writable_dir(path: &Path) -> Result<(), StartupError> {
    let wrap = |source| StartupError::Directory {
        path: path.display().to_string(),
        source,
    };
    std::fs::create_dir_all(path).map_err(wrap)?;

    let probe = path.join(".conveyor-probe");
    std::fs::write(&probe, b"").map_err(wrap)?;
    std::fs::remove_file(&probe).map_err(wrap)?;
    Ok(())
}

/// Create every directory the daemon writes to.
pub fn prepare_directories(cfg: &Config) -> Result<(), StartupError> {
    ensure_writable_dir(&cfg.coordinator.state_dir)?;
    ensure_writable_dir(&cfg.worker.work_dir)?;
    ensure_writable_dir(&cfg.worker.storage_dir)?;
    Ok(())
}

/// Run all startup checks in order
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_encoder_available(&cfg.encoder.binary)?;
    prepare_directories(cfg)?;
    Ok(())
}
