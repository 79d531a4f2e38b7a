//! Gatekeepers for the transcode admission pool.
//!
//! Each function returns a predicate suitable for [`AdmissionPool::add_level`].
//! [`standard_pool`] wires them into the default four-level layout:
//!
//! 1. `priority`: channels the directory marks high priority
//! 2. `enabled`: channels the directory marks normal
//! 3. `supported`: streams whose support reaches the configured threshold
//! 4. `common`: everything else, released only after enough demand

use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionPool;
use crate::channels::{ChannelDirectory, ChannelPriority};
use crate::config::AdmissionConfig;
use crate::frequency_queue::FrequencyQueue;
use crate::protocol::TranscodeRequest;

pub const PRIORITY_LEVEL: &str = "priority";
pub const ENABLED_LEVEL: &str = "enabled";
pub const SUPPORTED_LEVEL: &str = "supported";
pub const COMMON_LEVEL: &str = "common";

/// Accept requests from channels of exactly `tier`.
pub fn priority(
    directory: Arc<ChannelDirectory>,
    tier: ChannelPriority,
) -> impl Fn(&str, &TranscodeRequest, &FrequencyQueue<TranscodeRequest>) -> bool + Send + Sync + 'static
{
    move |_key, request, _queue| {
        !request.channel.is_empty() && directory.priority(&request.channel) == tier
    }
}

/// Accept requests whose support amount reaches `threshold`.
pub fn min_support(
    threshold: f64,
) -> impl Fn(&str, &TranscodeRequest, &FrequencyQueue<TranscodeRequest>) -> bool + Send + Sync + 'static
{
    move |_key, request, _queue| request.support_amount >= threshold
}

pub fn catch_all(
) -> impl Fn(&str, &TranscodeRequest, &FrequencyQueue<TranscodeRequest>) -> bool + Send + Sync + 'static
{
    |_key, _request, _queue| true
}

/// Build the default pool from configuration.
pub fn standard_pool(
    cfg: &AdmissionConfig,
    directory: Arc<ChannelDirectory>,
) -> AdmissionPool<TranscodeRequest> {
    let mut pool = AdmissionPool::new(Duration::from_millis(cfg.idle_interval_ms));
    pool.add_level(
        PRIORITY_LEVEL,
        0,
        priority(directory.clone(), ChannelPriority::High),
    );
    pool.add_level(
        ENABLED_LEVEL,
        0,
        priority(directory, ChannelPriority::Normal),
    );
    pool.add_level(
        SUPPORTED_LEVEL,
        cfg.supported_min_hits,
        min_support(cfg.support_threshold),
    );
    pool.add_level(COMMON_LEVEL, cfg.common_min_hits, catch_all());
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmitOutcome;
    use crate::frequency_queue::ItemStatus;

    fn request(reference: &str, channel: &str, support: f64) -> TranscodeRequest {
        TranscodeRequest {
            reference: reference.to_string(),
            url: format!("https://cdn.example/{}", reference),
            content_key: format!("sha-{}", reference),
            channel: channel.to_string(),
            support_amount: support,
        }
    }

    fn directory() -> Arc<ChannelDirectory> {
        let directory = ChannelDirectory::new();
        directory.set("@vip", ChannelPriority::High);
        directory.set("@regular", ChannelPriority::Normal);
        Arc::new(directory)
    }

    #[test]
    fn test_requests_route_by_channel_and_support() {
        let cfg = AdmissionConfig::default();
        let pool = standard_pool(&cfg, directory());

        let cases = [
            ("a", "@vip", 0.0, PRIORITY_LEVEL),
            ("b", "@regular", 0.0, ENABLED_LEVEL),
            ("c", "@unknown", 5.0, SUPPORTED_LEVEL),
            ("d", "@unknown", 0.1, COMMON_LEVEL),
            ("e", "", 0.0, COMMON_LEVEL),
        ];
        for (reference, channel, support, level) in cases {
            let outcome = pool.admit(reference, request(reference, channel, support));
            assert_eq!(outcome, AdmitOutcome::Queued);
            assert_eq!(pool.status(reference), Some((level, ItemStatus::Queued)));
        }
    }

    #[test]
    fn test_priority_released_immediately_common_waits() {
        let cfg = AdmissionConfig {
            common_min_hits: 3,
            ..AdmissionConfig::default()
        };
        let pool = standard_pool(&cfg, directory());

        pool.admit("vip", request("vip", "@vip", 0.0));
        pool.admit("low", request("low", "", 0.0));

        let first = pool.next().unwrap();
        assert_eq!(first.item.key, "vip");
        assert!(pool.next().is_none());

        pool.admit("low", request("low", "", 0.0));
        pool.admit("low", request("low", "", 0.0));
        let second = pool.next().unwrap();
        assert_eq!(second.level, COMMON_LEVEL);
    }

    #[tokio::test]
    async fn test_high_priority_leads_output() {
        let pool = Arc::new(standard_pool(&AdmissionConfig::default(), directory()));
        assert_eq!(
            pool.admit("normal", request("normal", "@regular", 0.0)),
            AdmitOutcome::Queued
        );
        assert_eq!(
            pool.admit("high", request("high", "@vip", 0.0)),
            AdmitOutcome::Queued
        );

        let stop = tokio_util::sync::CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let handle = tokio::spawn(pool.clone().start(tx, stop.clone()));

        assert_eq!(rx.recv().await.unwrap().item.key, "high");
        assert_eq!(rx.recv().await.unwrap().item.key, "normal");
        stop.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let accept = min_support(2.5);
        let queue = FrequencyQueue::new();
        assert!(accept("x", &request("x", "", 2.5), &queue));
        assert!(!accept("x", &request("x", "", 2.4), &queue));
    }
}
