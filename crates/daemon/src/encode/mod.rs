//! Encoder invocation

pub mod av1an;

pub use av1an::{build_av1an_command, parse_progress, Av1anEncoder, Av1anParams};

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder exited with a non-zero status
    #[error("encoder failed with exit code: {0}")]
    Failed(i32),

    /// Encoder was terminated by a signal
    #[error("encoder process was terminated by signal")]
    Terminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    /// A non-zero exit means the input cannot be encoded; retrying won't help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EncodeError::Failed(_))
    }
}

/// Turns a downloaded source into an encoded output.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encode `input` into `output`, sending percentages on `progress`.
    ///
    /// Progress delivery is best effort; a full channel drops the update.
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        progress: mpsc::Sender<f32>,
    ) -> Result<(), EncodeError>;
}
