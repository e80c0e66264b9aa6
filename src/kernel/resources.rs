//! Resource tracking and admission control.
//!
//! Tracks the number of concurrently executing tasks and, when enabled,
//! samples host memory/CPU before admitting another one. Host sampling is
//! advisory: if the numbers are unavailable the task is admitted.

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;

use crate::types::{Error, ResourceConfig, Result};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Host usage sample.
#[derive(Debug, Clone, Copy)]
struct HostSample {
    available_memory_mb: f64,
    memory_usage_percent: f64,
    cpu_usage_percent: f64,
}

#[derive(Debug)]
struct ResourceState {
    current_tasks: usize,
    system: Option<System>,
}

impl ResourceState {
    /// Refresh and read host usage. `None` when sampling is off or the
    /// platform reports nothing useful.
    fn sample(&mut self) -> Option<HostSample> {
        let system = self.system.as_mut()?;
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let available = system.available_memory();
        Some(HostSample {
            available_memory_mb: available as f64 / BYTES_PER_MB,
            memory_usage_percent: (1.0 - available as f64 / total as f64) * 100.0,
            cpu_usage_percent: f64::from(system.global_cpu_usage()),
        })
    }
}

/// Snapshot of admission control state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub concurrent_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub max_memory_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_memory_gb: Option<f64>,
    /// current / max, as a percentage.
    pub resource_pressure: f64,
}

/// Admission control for task execution.
#[derive(Debug)]
pub struct ResourceManager {
    config: ResourceConfig,
    state: Mutex<ResourceState>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        let system = config.sample_system.then(System::new);
        Self {
            config,
            state: Mutex::new(ResourceState {
                current_tasks: 0,
                system,
            }),
        }
    }

    /// Try to reserve a slot for one task.
    ///
    /// Returns false when the concurrency cap is reached or the host check
    /// says the estimate would not fit.
    pub async fn acquire(&self, estimated_memory_mb: u64, estimated_cpu_percent: f64) -> bool {
        self.admit(estimated_memory_mb, estimated_cpu_percent)
            .await
            .is_ok()
    }

    /// Like [`acquire`](Self::acquire), but says why admission was refused.
    pub async fn admit(&self, estimated_memory_mb: u64, estimated_cpu_percent: f64) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.current_tasks >= self.config.max_concurrent_tasks {
            tracing::debug!(
                current = state.current_tasks,
                max = self.config.max_concurrent_tasks,
                "admission_rejected_concurrency"
            );
            return Err(Error::resource_exhausted(format!(
                "{} of {} task slots in use",
                state.current_tasks, self.config.max_concurrent_tasks
            )));
        }

        if let Some(sample) = state.sample() {
            if estimated_memory_mb as f64 > sample.available_memory_mb * 0.8 {
                tracing::debug!(
                    estimated_memory_mb,
                    available_memory_mb = sample.available_memory_mb,
                    "admission_rejected_memory"
                );
                return Err(Error::resource_exhausted(format!(
                    "estimated {} MB exceeds available memory",
                    estimated_memory_mb
                )));
            }
            if sample.cpu_usage_percent + estimated_cpu_percent > self.config.max_cpu_percent {
                tracing::debug!(
                    cpu_usage_percent = sample.cpu_usage_percent,
                    estimated_cpu_percent,
                    max_cpu_percent = self.config.max_cpu_percent,
                    "admission_rejected_cpu"
                );
                return Err(Error::resource_exhausted(format!(
                    "cpu at {:.1}%",
                    sample.cpu_usage_percent
                )));
            }
        }

        state.current_tasks += 1;
        Ok(())
    }

    /// Release a slot previously taken by `acquire`. Never goes below zero.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        state.current_tasks = state.current_tasks.saturating_sub(1);
    }

    pub async fn current_tasks(&self) -> usize {
        self.state.lock().await.current_tasks
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.config.max_concurrent_tasks
    }

    pub async fn status(&self) -> ResourceStatus {
        let mut state = self.state.lock().await;
        let sample = state.sample();
        let max = self.config.max_concurrent_tasks.max(1);

        ResourceStatus {
            concurrent_tasks: state.current_tasks,
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            max_memory_mb: self.config.max_memory_mb,
            cpu_usage_percent: sample.map(|s| s.cpu_usage_percent),
            memory_usage_percent: sample.map(|s| s.memory_usage_percent),
            available_memory_gb: sample.map(|s| s.available_memory_mb * BYTES_PER_MB / BYTES_PER_GB),
            resource_pressure: state.current_tasks as f64 / max as f64 * 100.0,
        }
    }
}
