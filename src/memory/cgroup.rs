// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;

use crate::common::read_file_to_u64;

// The two generations of cgroup memory ceiling files, relative to the
// filesystem root: the unified (v2) hierarchy and the legacy per-controller
// (v1) one.
const CGROUP_V2_MEMORY_MAX: &str = "sys/fs/cgroup/memory.max";
const CGROUP_V1_MEMORY_LIMIT: &str = "sys/fs/cgroup/memory/memory.limit_in_bytes";

/// Returns the memory ceiling of the confining cgroup in bytes, or `None`
/// when no ceiling is configured.
pub fn cgroup_memory_limit_bytes() -> Option<u64> {
    cgroup_memory_limit_bytes_from(Path::new("/"))
}

fn cgroup_memory_limit_bytes_from(root: &Path) -> Option<u64> {
    let v2_path = root.join(CGROUP_V2_MEMORY_MAX);
    let v1_path = root.join(CGROUP_V1_MEMORY_LIMIT);
    let path = if v2_path.exists() {
        v2_path
    } else if v1_path.exists() {
        v1_path
    } else {
        return None;
    };
    // v2 reports zero or the literal "max" when the limit is not set. Either
    // way there is no ceiling.
    match read_file_to_u64(path) {
        Ok(0) | Err(_) => None,
        Ok(limit) => Some(limit),
    }
}
