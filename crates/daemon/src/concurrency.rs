//! Worker slot planning
//!
//! Derives how many tasks a worker runs at once and how many encoder
//! workers each task gets, from the core count and configuration.

use crate::config::Config;

/// Share of logical cores the encoders are allowed to occupy
const TARGET_UTILIZATION: f32 = 0.85;

/// Slot plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct SlotPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Threads the encoders may use in total
    pub target_threads: u32,
    /// Encoder workers per task
    pub encoder_workers: u32,
    /// Concurrent task slots per worker
    pub worker_slots: u32,
}

impl SlotPlan {
    /// Derive a slot plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Encoder workers: 8 for 32+ cores, 4 otherwise (unless explicit)
    /// - Worker slots: target threads divided by encoder workers, at least 1
    ///   (unless explicit)
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .encoder
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let target_threads = ((total_cores as f32) * TARGET_UTILIZATION).round() as u32;

        let encoder_workers = if cfg.encoder.workers_per_job > 0 {
            cfg.encoder.workers_per_job
        } else {
            derive_encoder_workers(total_cores)
        };

        let worker_slots = if cfg.worker.concurrency > 0 {
            cfg.worker.concurrency
        } else {
            (target_threads / encoder_workers).max(1)
        };

        Self {
            total_cores,
            target_threads,
            encoder_workers,
            worker_slots,
        }
    }
}

fn derive_encoder_workers(cores: u32) -> u32 {
    if cores >= 32 {
        8
    } else {
        4
    }
}

pub fn derive_plan(cfg: &Config) -> SlotPlan {
    SlotPlan::derive(cfg)
}
