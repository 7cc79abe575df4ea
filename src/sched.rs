// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use log::info;
use tokio::runtime::Handle;

/// Interface to the periodic-task machinery owned by the surrounding system:
/// run `task` every `interval` under `name`, until the owner shuts down.
pub trait PeriodicTaskRunner {
    fn run_periodically(&self, name: &'static str, interval: Duration, task: Box<dyn FnMut() + Send>);
}

/// Runs periodic tasks on the ambient tokio runtime.
pub struct TokioTaskRunner {
    handle: Handle,
}

impl TokioTaskRunner {
    /// Captures the current runtime. Must be called from a runtime context.
    pub fn new() -> Self {
        Self {
            handle: Handle::current(),
        }
    }
}

impl Default for TokioTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodicTaskRunner for TokioTaskRunner {
    fn run_periodically(
        &self,
        name: &'static str,
        interval: Duration,
        mut task: Box<dyn FnMut() + Send>,
    ) {
        info!("Scheduling {} every {:?}", name, interval);
        self.handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                task();
            }
        });
    }
}
