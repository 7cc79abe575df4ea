// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::env;
use std::future;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use memmond::memory;
use memmond::memory::MemoryMonitor;
use memmond::memory::MemorySnapshot;
use memmond::memory::MonitorConfig;
use memmond::sched::TokioTaskRunner;
use tokio::runtime::Builder;

// Defaults flag pressure shortly before the kernel's own OOM response would.
const DEFAULT_USAGE_THRESHOLD: f64 = 0.95;
const DEFAULT_INTERVAL_MS: u64 = 1000;

const USAGE_THRESHOLD_ENV: &str = "MEMMOND_USAGE_THRESHOLD";
const MAX_OVERHEAD_BYTES_ENV: &str = "MEMMOND_MAX_OVERHEAD_BYTES";
const INTERVAL_MS_ENV: &str = "MEMMOND_INTERVAL_MS";

fn monitor_config_from_env() -> Result<MonitorConfig> {
    let usage_threshold = match env::var(USAGE_THRESHOLD_ENV) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Couldn't parse {}=\"{}\"", USAGE_THRESHOLD_ENV, raw))?,
        Err(_) => DEFAULT_USAGE_THRESHOLD,
    };
    let max_overhead_bytes = match env::var(MAX_OVERHEAD_BYTES_ENV) {
        Ok(raw) => Some(raw.parse().with_context(|| {
            format!("Couldn't parse {}=\"{}\"", MAX_OVERHEAD_BYTES_ENV, raw)
        })?),
        Err(_) => None,
    };
    let interval_ms: u64 = match env::var(INTERVAL_MS_ENV) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Couldn't parse {}=\"{}\"", INTERVAL_MS_ENV, raw))?,
        Err(_) => DEFAULT_INTERVAL_MS,
    };
    Ok(MonitorConfig {
        usage_threshold,
        max_overhead_bytes,
        interval: Duration::from_millis(interval_ms),
    })
}

// Logs transitions in and out of pressure rather than every tick.
fn log_pressure_changes() -> impl FnMut(bool, &MemorySnapshot, f64) + Send {
    let mut was_above = false;
    move |above, snapshot, usage_threshold| {
        if above != was_above {
            if above {
                info!(
                    "Memory pressure began (threshold fraction {}): {}",
                    usage_threshold, snapshot
                );
            } else {
                info!(
                    "Memory pressure eased (threshold fraction {}): {}",
                    usage_threshold, snapshot
                );
            }
            was_above = above;
        }
    }
}

fn main() -> Result<()> {
    // The default log level is info (debug! and trace! are ignored).
    env_logger::init();

    info!("Starting memmond");

    match memory::process_memory_bytes(std::process::id()) {
        Some(uss_bytes) => info!("Own unique set size at startup: {} bytes", uss_bytes),
        None => warn!("Couldn't measure own unique set size"),
    }

    let config = monitor_config_from_env()?;
    let rt = Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async {
        let runner = TokioTaskRunner::new();
        // The daemon runs standalone; no external subsystem contributes a
        // usage figure of its own.
        let _monitor = MemoryMonitor::start(
            config,
            Box::new(log_pressure_changes()),
            Box::new(|| 0),
            &runner,
        );
        future::pending::<()>().await
    });

    Ok(())
}
