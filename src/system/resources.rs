//! System resource monitoring
//!
//! Reports RAM before a model load so out-of-memory failures can be explained.

#[cfg(any(target_os = "windows", target_os = "macos"))]
use std::process::Command;

/// System memory snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub ram_available_mb: u64,
    pub ram_total_mb: u64,
}

impl ResourceUsage {
    /// False when detection failed and the numbers are meaningless
    pub fn is_known(&self) -> bool {
        self.ram_total_mb > 0
    }
}

/// Get system memory usage (best effort)
pub fn get_resource_usage() -> ResourceUsage {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/meminfo")
            .map(|text| parse_meminfo(&text))
            .unwrap_or_default()
    }

    #[cfg(target_os = "macos")]
    {
        get_resource_usage_macos()
    }

    #[cfg(target_os = "windows")]
    {
        get_resource_usage_windows()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        ResourceUsage::default()
    }
}

/// Parse `MemTotal` and `MemAvailable` out of `/proc/meminfo`
pub fn parse_meminfo(text: &str) -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value_kb = parts.next().and_then(|v| v.parse::<u64>().ok());
        match (key, value_kb) {
            (Some("MemTotal:"), Some(kb)) => usage.ram_total_mb = kb / 1024,
            (Some("MemAvailable:"), Some(kb)) => usage.ram_available_mb = kb / 1024,
            _ => {}
        }
    }
    usage
}

/// Git metadata left by `git clone`; LFS keeps a second copy of every shard there
const GIT_DIR_NAME: &str = ".git";

/// Total bytes under a directory, recursively, not counting `.git`
pub fn directory_size_bytes(dir: &std::path::Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_name() != GIT_DIR_NAME)
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(meta) if meta.is_dir() => directory_size_bytes(&entry.path()),
            _ => 0,
        })
        .sum()
}

// =============================================================================
// macOS resource monitoring
// =============================================================================

#[cfg(target_os = "macos")]
fn get_resource_usage_macos() -> ResourceUsage {
    let total_mb = sysctl_u64("hw.memsize").map(|b| b / 1024 / 1024).unwrap_or(0);
    // Free + inactive pages approximate what a new allocation can get.
    let page_size = sysctl_u64("hw.pagesize").unwrap_or(16384);
    let available_pages = vm_stat_pages(&["Pages free:", "Pages inactive:"]).unwrap_or(0);

    ResourceUsage {
        ram_available_mb: available_pages * page_size / 1024 / 1024,
        ram_total_mb: total_mb,
    }
}

#[cfg(target_os = "macos")]
fn sysctl_u64(name: &str) -> Option<u64> {
    let output = Command::new("sysctl").args(["-n", name]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(target_os = "macos")]
fn vm_stat_pages(keys: &[&str]) -> Option<u64> {
    let output = Command::new("vm_stat").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut total = 0;
    for line in stdout.lines() {
        for key in keys {
            if let Some(rest) = line.strip_prefix(key) {
                if let Ok(v) = rest.trim().trim_end_matches('.').parse::<u64>() {
                    total += v;
                }
            }
        }
    }
    Some(total)
}

// =============================================================================
// Windows resource monitoring
// =============================================================================

#[cfg(target_os = "windows")]
fn get_resource_usage_windows() -> ResourceUsage {
    let output = Command::new("wmic")
        .args(["OS", "get", "FreePhysicalMemory,TotalVisibleMemorySize", "/Value"])
        .output();

    let Ok(output) = output else {
        return ResourceUsage::default();
    };

    if !output.status.success() {
        return ResourceUsage::default();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut usage = ResourceUsage::default();

    for line in stdout.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("FreePhysicalMemory=") {
            usage.ram_available_mb = value.trim().parse::<u64>().unwrap_or(0) / 1024;
        } else if let Some(value) = line.strip_prefix("TotalVisibleMemorySize=") {
            usage.ram_total_mb = value.trim().parse::<u64>().unwrap_or(0) / 1024;
        }
    }

    usage
}
