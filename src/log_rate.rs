// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use once_cell::sync::Lazy;

/// Default minimum delay between repeated emissions from one call site.
pub const LOG_INTERVAL: Duration = Duration::from_secs(5);

// Last emission time, keyed by call site.
static LAST_EMISSION: Lazy<Mutex<HashMap<&'static str, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns whether the call site identified by `key` may emit now, at the
/// default interval. Guards for failure logs that would otherwise repeat on
/// every sampling tick while a source stays unreadable.
pub fn should_log(key: &'static str) -> bool {
    should_log_every(key, LOG_INTERVAL)
}

/// Same as [`should_log`] with an explicit suppression interval.
pub fn should_log_every(key: &'static str, interval: Duration) -> bool {
    let now = Instant::now();
    let Ok(mut last_emission) = LAST_EMISSION.lock() else {
        // Rate limiting is best-effort; emit when its state is unavailable.
        return true;
    };
    match last_emission.get(key) {
        Some(last) if now.duration_since(*last) < interval => false,
        _ => {
            last_emission.insert(key, now);
            true
        }
    }
}
