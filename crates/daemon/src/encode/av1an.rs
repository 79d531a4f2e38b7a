//! Av1an encoder
//!
//! Builds and runs Av1an with fixed streaming-tuned settings and relays the
//! chunk progress it prints on stderr.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::{EncodeError, Encoder};

/// Fixed SVT-AV1 parameters for streaming output
const SVT_PARAMS: &str = "--preset 8 --crf 32 --keyint 240 --scd 1 --lookahead 40";

/// Parameters for a single Av1an run
#[derive(Debug, Clone)]
pub struct Av1anParams {
    /// Av1an executable
    pub binary: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Directory for temporary chunk files during encoding
    pub temp_chunks_dir: PathBuf,
    /// Av1an worker count
    pub workers: u32,
}

/// Build an Av1an command with all required encoding flags
pub fn build_av1an_command(params: &Av1anParams) -> Command {
    let mut cmd = Command::new(&params.binary);

    cmd.arg("-i").arg(&params.input_path);
    cmd.arg("-o").arg(&params.output_path);
    cmd.arg("--encoder").arg("svt-av1");
    cmd.arg("--pix-format").arg("yuv420p10le");
    cmd.arg("--video-params").arg(SVT_PARAMS);
    cmd.arg("--audio-params").arg("-c:a libopus -b:a 128k");
    cmd.arg("--workers").arg(params.workers.to_string());
    cmd.arg("--temp").arg(&params.temp_chunks_dir);
    cmd.arg("-y");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Extract a percentage from a progress line.
///
/// Av1an reports `done/total` frame or chunk counts; the last such token on
/// the line wins.
pub fn parse_progress(line: &str) -> Option<f32> {
    line.split_whitespace()
        .filter_map(|token| {
            let (done, total) = token.split_once('/')?;
            let done: u64 = done.parse().ok()?;
            let total: u64 = total.parse().ok()?;
            if total == 0 || done > total {
                return None;
            }
            Some(done as f32 / total as f32 * 100.0)
        })
        .last()
}

/// Runs Av1an per task, with temp chunks under `temp_root`.
#[derive(Debug, Clone)]
pub struct Av1anEncoder {
    binary: String,
    workers: u32,
    temp_root: PathBuf,
}

impl Av1anEncoder {
    pub fn new(binary: impl Into<String>, workers: u32, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workers,
            temp_root: temp_root.into(),
        }
    }

    fn params(&self, input: &Path, output: &Path) -> Av1anParams {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "task".to_string());
        Av1anParams {
            binary: self.binary.clone(),
            input_path: input.to_path_buf(),
            output_path: output.to_path_buf(),
            temp_chunks_dir: self.temp_root.join(format!("chunks_{}", stem)),
            workers: self.workers,
        }
    }
}

#[async_trait]
impl Encoder for Av1anEncoder {
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        progress: mpsc::Sender<f32>,
    ) -> Result<(), EncodeError> {
        let params = self.params(input, output);
        tokio::fs::create_dir_all(&params.temp_chunks_dir).await?;

        let outcome = run_av1an(&params, &progress).await;
        let _ = tokio::fs::remove_dir_all(&params.temp_chunks_dir).await;
        let status = outcome?;
        debug!(input = %input.display(), ?status, "av1an exited");

        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(EncodeError::Failed(code)),
                None => Err(EncodeError::Terminated),
            }
        }
    }
}

/// Spawn Av1an and relay its progress until it exits. An early return drops
/// the child, which kills it.
async fn run_av1an(
    params: &Av1anParams,
    progress: &mpsc::Sender<f32>,
) -> Result<ExitStatus, EncodeError> {
    let mut child = build_av1an_command(params).spawn()?;
    if let Some(stderr) = child.stderr.take() {
        // Progress bars redraw with carriage returns
        let mut segments = BufReader::new(stderr).split(b'\r');
        while let Some(segment) = segments.next_segment().await? {
            let text = String::from_utf8_lossy(&segment);
            for line in text.lines() {
                if let Some(percent) = parse_progress(line) {
                    let _ = progress.try_send(percent);
                }
            }
        }
    }
    Ok(child.wait().await?)
}
