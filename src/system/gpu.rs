//! GPU detection
//!
//! Picks which compiled runtime library flavour can run on this machine.

use serde::{Deserialize, Serialize};
#[cfg(not(target_os = "macos"))]
use std::process::Command;

/// Flavour of a compiled runtime library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    Cuda,
    Metal,
    Vulkan,
    Cpu,
}

impl RuntimeBackend {
    /// Suffix used in library file names, e.g. `-cuda`
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeBackend::Cuda => "cuda",
            RuntimeBackend::Metal => "metal",
            RuntimeBackend::Vulkan => "vulkan",
            RuntimeBackend::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cuda" => Ok(RuntimeBackend::Cuda),
            "metal" => Ok(RuntimeBackend::Metal),
            "vulkan" => Ok(RuntimeBackend::Vulkan),
            "cpu" => Ok(RuntimeBackend::Cpu),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Shared library extensions accepted on this platform
pub fn library_extensions() -> &'static [&'static str] {
    if cfg!(target_os = "windows") {
        &["dll"]
    } else if cfg!(target_os = "macos") {
        &["so", "dylib"]
    } else {
        &["so"]
    }
}

/// Backends to try, best first, with `preferred` moved to the front
pub fn backend_order(preferred: Option<RuntimeBackend>) -> Vec<RuntimeBackend> {
    let mut order = detect_backends();
    if let Some(preferred) = preferred {
        order.retain(|b| *b != preferred);
        order.insert(0, preferred);
    }
    order
}

/// Detect usable backends (best effort)
pub fn detect_backends() -> Vec<RuntimeBackend> {
    #[cfg(target_os = "macos")]
    {
        vec![RuntimeBackend::Metal, RuntimeBackend::Cpu]
    }

    #[cfg(not(target_os = "macos"))]
    {
        let mut backends = Vec::new();
        if nvidia_gpu_present() {
            backends.push(RuntimeBackend::Cuda);
        }
        backends.push(RuntimeBackend::Vulkan);
        backends.push(RuntimeBackend::Cpu);
        backends
    }
}

/// `nvidia-smi -L` lists at least one GPU
#[cfg(not(target_os = "macos"))]
fn nvidia_gpu_present() -> bool {
    let output = match Command::new("nvidia-smi").arg("-L").output() {
        Ok(output) => output,
        Err(_) => return false,
    };

    if !output.status.success() {
        return false;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let found = stdout.lines().any(|line| line.trim_start().starts_with("GPU "));
    tracing::debug!("nvidia-smi reports GPU present: {}", found);
    found
}
