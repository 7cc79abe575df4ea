// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use log::error;

use crate::log_rate;

// Global memory counters file, relative to the filesystem root.
const MEMINFO_FILE: &str = "proc/meminfo";

/// Parsed /proc/meminfo counters in bytes, only the fields the monitor
/// consumes. A counter the kernel didn't report stays `None`.
#[derive(Default, Clone)]
pub struct MemInfo {
    pub total: Option<u64>,
    pub available: Option<u64>,
    pub free: Option<u64>,
    pub cached: Option<u64>,
    pub buffers: Option<u64>,
}

impl MemInfo {
    /// Load the memory counters file at `path` and parse it.
    pub fn load(path: &Path) -> io::Result<Self> {
        let reader = File::open(path)?;
        Self::parse(BufReader::new(reader))
    }

    fn parse<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut result = Self::default();
        for line in reader.lines() {
            let line = line?;
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                continue;
            };
            let Some(value) = tokens.next() else {
                continue;
            };
            // Sized counters are always reported in kibibytes. Anything else
            // means the host is not the kernel this parser was written for.
            if let Some(unit) = tokens.next() {
                assert!(unit == "kB", "unexpected unit {} in meminfo: {}", unit, line);
            }
            let field = match key {
                "MemTotal:" => &mut result.total,
                "MemAvailable:" => &mut result.available,
                "MemFree:" => &mut result.free,
                "Cached:" => &mut result.cached,
                "Buffers:" => &mut result.buffers,
                _ => continue,
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            *field = Some(value * 1024);
        }
        Ok(result)
    }

    /// Machine-wide (used, total) in bytes. Both sides are `None` when the
    /// counters are incomplete or inconsistent.
    fn used_and_total(&self) -> (Option<u64>, Option<u64>) {
        let Some(total) = self.total else {
            if log_rate::should_log("meminfo_no_total") {
                error!("no MemTotal in meminfo, cannot size the machine");
            }
            return (None, None);
        };
        let available = match self.available {
            Some(available) if available > 0 => Some(available),
            // Kernels before 3.14 have no MemAvailable; approximate it the
            // way psutil does.
            _ => match (self.free, self.cached, self.buffers) {
                (Some(free), Some(cached), Some(buffers)) => Some(free + cached + buffers),
                _ => None,
            },
        };
        let Some(available) = available else {
            if log_rate::should_log("meminfo_no_available") {
                error!("couldn't determine available memory from meminfo");
            }
            return (None, None);
        };
        if total < available {
            if log_rate::should_log("meminfo_inconsistent") {
                error!(
                    "meminfo reports more available ({}) than total ({}) memory",
                    available, total
                );
            }
            return (None, None);
        }
        (Some(total - available), Some(total))
    }
}

/// Reads the machine-wide (used, total) memory in bytes. Either side is
/// `None` when /proc/meminfo is missing, incomplete or inconsistent; the
/// failure is logged at most once per [`log_rate::LOG_INTERVAL`].
pub fn system_memory_bytes() -> (Option<u64>, Option<u64>) {
    system_memory_bytes_from(Path::new("/"))
}

fn system_memory_bytes_from(root: &Path) -> (Option<u64>, Option<u64>) {
    let path = root.join(MEMINFO_FILE);
    match MemInfo::load(&path) {
        Ok(info) => info.used_and_total(),
        Err(e) => {
            if log_rate::should_log("meminfo_open") {
                error!("couldn't read {}: {}", path.display(), e);
            }
            (None, None)
        }
    }
}
