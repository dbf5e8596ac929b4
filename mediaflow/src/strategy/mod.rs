//! Execution strategy selection: native or container, and which device.
//!
//! The host is probed once at startup; every attempt afterwards is decided
//! from the cached probe results, the job's requested device and the
//! stage's resource class.

use crate::config::RuntimeConfig;
use crate::core::{Device, ExecutionAttempt, ExecutionMode, StageDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Operating system family of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    /// Linux.
    Linux,
    /// macOS.
    MacOs,
    /// Windows.
    Windows,
    /// Anything else.
    Other,
}

impl HostPlatform {
    /// The platform this binary was built for.
    #[must_use]
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }
}

/// Host capabilities the selector depends on.
#[cfg_attr(test, mockall::automock)]
pub trait RuntimeProbe: Send + Sync {
    /// Whether the native stage runtime is installed.
    fn native_available(&self) -> bool;

    /// The host platform.
    fn platform(&self) -> HostPlatform;
}

/// Probes the real host: looks the native runtime up on `PATH`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    native_runtime: String,
}

impl SystemProbe {
    /// Creates a probe for the configured native runtime.
    #[must_use]
    pub fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            native_runtime: runtime.native_runtime.clone(),
        }
    }

    fn find_executable(name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
    }
}

impl RuntimeProbe for SystemProbe {
    fn native_available(&self) -> bool {
        let found = Self::find_executable(&self.native_runtime);
        debug!(runtime = %self.native_runtime, found = ?found, "Probed native runtime");
        found.is_some()
    }

    fn platform(&self) -> HostPlatform {
        HostPlatform::current()
    }
}

/// Chooses `(mode, device)` for each stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStrategySelector {
    native_available: bool,
    platform: HostPlatform,
    gpu_passthrough: bool,
}

impl ExecutionStrategySelector {
    /// Probes the host once and caches the result.
    #[must_use]
    pub fn new(probe: &dyn RuntimeProbe, runtime: &RuntimeConfig) -> Self {
        let selector = Self {
            native_available: probe.native_available(),
            platform: probe.platform(),
            gpu_passthrough: runtime.gpu_passthrough,
        };
        info!(
            native = selector.native_available,
            platform = ?selector.platform,
            gpu_passthrough = selector.gpu_passthrough,
            "Execution strategy probed"
        );
        selector
    }

    /// Returns true if stages run natively.
    #[must_use]
    pub fn native_available(&self) -> bool {
        self.native_available
    }

    /// Selects the strategy for one attempt.
    ///
    /// Native execution with the requested device is preferred. Without a
    /// native runtime the stage runs in a container, keeping CUDA only
    /// where passthrough works (Linux with passthrough enabled) and using
    /// CPU otherwise. CPU-only stages and attempts after a device fallback
    /// always get CPU.
    #[must_use]
    pub fn select(
        &self,
        stage: &StageDefinition,
        requested: Device,
        forced_cpu: bool,
        attempt_number: u32,
    ) -> ExecutionAttempt {
        let wanted = if forced_cpu || !stage.is_accelerated() {
            Device::Cpu
        } else {
            requested
        };

        let (mode, device) = if self.native_available {
            let device = match wanted {
                Device::Mps if self.platform != HostPlatform::MacOs => Device::Cpu,
                other => other,
            };
            (ExecutionMode::Native, device)
        } else {
            let device = match wanted {
                Device::Cuda if self.passthrough_supported() => Device::Cuda,
                _ => Device::Cpu,
            };
            (ExecutionMode::Container, device)
        };

        if device != wanted {
            debug!(stage = %stage.name, requested = %wanted, selected = %device, mode = %mode, "Device unavailable in this mode");
        }

        ExecutionAttempt {
            mode,
            device,
            attempt_number,
        }
    }

    fn passthrough_supported(&self) -> bool {
        self.gpu_passthrough && self.platform == HostPlatform::Linux
    }
}
