//! Channel priority directory.
//!
//! Maps channel identities to a priority tier. The mapping is owned by an
//! external store and pulled periodically through a [`ChannelSource`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;

/// Priority tier of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPriority {
    High,
    Normal,
    /// Default for channels the directory does not know.
    Low,
}

impl Default for ChannelPriority {
    fn default() -> Self {
        Self::Low
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel source unavailable: {0}")]
    Unavailable(String),
}

/// Origin of channel priorities.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<(String, ChannelPriority)>, ChannelError>;
}

/// Fixed channel list, typically taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticChannels {
    entries: Vec<(String, ChannelPriority)>,
}

impl StaticChannels {
    pub fn new(entries: Vec<(String, ChannelPriority)>) -> Self {
        Self { entries }
    }

    pub fn from_config(cfg: &AdmissionConfig) -> Self {
        let high = cfg
            .high_priority_channels
            .iter()
            .map(|c| (c.clone(), ChannelPriority::High));
        let normal = cfg
            .normal_channels
            .iter()
            .map(|c| (c.clone(), ChannelPriority::Normal));
        Self {
            entries: high.chain(normal).collect(),
        }
    }
}

#[async_trait]
impl ChannelSource for StaticChannels {
    async fn fetch(&self) -> Result<Vec<(String, ChannelPriority)>, ChannelError> {
        Ok(self.entries.clone())
    }
}

/// Channel-to-tier mapping consulted by gatekeepers.
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    tiers: RwLock<HashMap<String, ChannelPriority>>,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tier of `channel`; unknown channels are [`ChannelPriority::Low`].
    pub fn priority(&self, channel: &str) -> ChannelPriority {
        self.tiers
            .read()
            .get(channel)
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&self, channel: &str, priority: ChannelPriority) {
        self.tiers.write().insert(channel.to_string(), priority);
    }

    pub fn len(&self) -> usize {
        self.tiers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the mapping with a fresh copy from `source`.
    ///
    /// On failure the previous mapping stays in place.
    pub async fn refresh(&self, source: &dyn ChannelSource) -> Result<usize, ChannelError> {
        let entries = source.fetch().await?;
        let fresh: HashMap<String, ChannelPriority> = entries.into_iter().collect();
        let count = fresh.len();
        *self.tiers.write() = fresh;
        Ok(count)
    }

    /// Refresh every `interval` until `stop` fires.
    pub async fn run_refresher(
        self: Arc<Self>,
        source: Arc<dyn ChannelSource>,
        interval: Duration,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.refresh(source.as_ref()).await {
                Ok(count) => debug!(channels = count, "channel directory refreshed"),
                Err(e) => warn!(error = %e, "channel directory refresh failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    #[async_trait]
    impl ChannelSource for FailingSource {
        async fn fetch(&self) -> Result<Vec<(String, ChannelPriority)>, ChannelError> {
            Err(ChannelError::Unavailable("db down".to_string()))
        }
    }

    #[test]
    fn test_unknown_channel_is_low() {
        let directory = ChannelDirectory::new();
        assert_eq!(directory.priority("@nobody"), ChannelPriority::Low);
    }

    #[tokio::test]
    async fn test_refresh_replaces_mapping() {
        let directory = ChannelDirectory::new();
        directory.set("@stale", ChannelPriority::High);

        let source = StaticChannels::new(vec![
            ("@alpha".to_string(), ChannelPriority::High),
            ("@beta".to_string(), ChannelPriority::Normal),
        ]);
        let count = directory.refresh(&source).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(directory.priority("@alpha"), ChannelPriority::High);
        assert_eq!(directory.priority("@beta"), ChannelPriority::Normal);
        assert_eq!(directory.priority("@stale"), ChannelPriority::Low);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_mapping() {
        let directory = ChannelDirectory::new();
        directory.set("@alpha", ChannelPriority::High);

        assert!(directory.refresh(&FailingSource).await.is_err());
        assert_eq!(directory.priority("@alpha"), ChannelPriority::High);
    }

    #[tokio::test]
    async fn test_static_channels_from_config() {
        let cfg = AdmissionConfig {
            high_priority_channels: vec!["@a".to_string()],
            normal_channels: vec!["@b".to_string(), "@c".to_string()],
            ..AdmissionConfig::default()
        };
        let entries = StaticChannels::from_config(&cfg).fetch().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("@a".to_string(), ChannelPriority::High));
    }

    #[tokio::test]
    async fn test_refresher_stops_on_cancel() {
        let directory = Arc::new(ChannelDirectory::new());
        let stop = CancellationToken::new();
        let source: Arc<dyn ChannelSource> = Arc::new(StaticChannels::new(vec![(
            "@alpha".to_string(),
            ChannelPriority::High,
        )]));

        let handle = tokio::spawn(directory.clone().run_refresher(
            source,
            Duration::from_millis(10),
            stop.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.cancel();
        handle.await.unwrap();

        assert_eq!(directory.priority("@alpha"), ChannelPriority::High);
    }
}
