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

// smaps_rollup fields that count memory private to the process. Their sum
// approximates the unique set size (USS).
const USS_FIELDS: [&str; 3] = ["Private_Clean:", "Private_Dirty:", "Private_Hugetlb:"];

/// Returns the approximate unique resident set of `pid` in bytes, or `None`
/// when the process's rollup file is unreadable or reports no private
/// memory at all. Safe to call from any thread, independent of the sampler.
pub fn process_memory_bytes(pid: u32) -> Option<u64> {
    process_memory_bytes_from(Path::new("/"), pid)
}

fn process_memory_bytes_from(root: &Path, pid: u32) -> Option<u64> {
    let path = root.join(format!("proc/{}/smaps_rollup", pid));
    let reader = match File::open(&path) {
        Ok(file) => BufReader::new(file),
        Err(e) => {
            if log_rate::should_log("smaps_open") {
                error!("couldn't read {}: {}", path.display(), e);
            }
            return None;
        }
    };
    let uss = match parse_uss(reader) {
        Ok(uss) => uss,
        Err(e) => {
            if log_rate::should_log("smaps_read") {
                error!("couldn't read {}: {}", path.display(), e);
            }
            return None;
        }
    };
    if uss == 0 {
        // A live process always maps some private pages; zero means the
        // measurement failed, not that the process is weightless.
        if log_rate::should_log("smaps_zero") {
            error!("got zero private memory from {}", path.display());
        }
        return None;
    }
    Some(uss)
}

fn parse_uss<R: BufRead>(reader: R) -> io::Result<u64> {
    let mut uss: u64 = 0;
    // The first line is the mapping-range header.
    for line in reader.lines().skip(1) {
        let line = line?;
        let mut tokens = line.split_whitespace();
        let (Some(key), Some(value)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        // Same environment contract as /proc/meminfo: sized fields come in
        // kibibytes or not at all.
        if let Some(unit) = tokens.next() {
            assert!(unit == "kB", "unexpected unit {} in smaps_rollup: {}", unit, line);
        }
        if !USS_FIELDS.contains(&key) {
            continue;
        }
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        uss += value * 1024;
    }
    Ok(uss)
}
