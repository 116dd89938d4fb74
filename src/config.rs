//! Configuration for the memory manager
//!
//! [`MemoryConfig`] controls size-class granularity, per-device ceilings and
//! debug mode. It can be built programmatically or overlaid from the
//! environment.
//!
//! # Environment Variables
//!
//! - `MEMFORGE_MEM_STEP_SIZE`: rounding granularity in bytes
//! - `MEMFORGE_MAX_BUFFERS`: per-device buffer-count ceiling
//! - `MEMFORGE_MAX_BYTES`: per-device byte ceiling
//! - `MEMFORGE_MEM_DEBUG`: `1`/`true` disables caching

use crate::error::{MemError, MemResult};

const STEP_SIZE_ENV: &str = "MEMFORGE_MEM_STEP_SIZE";
const MAX_BUFFERS_ENV: &str = "MEMFORGE_MAX_BUFFERS";
const MAX_BYTES_ENV: &str = "MEMFORGE_MAX_BYTES";
const MEM_DEBUG_ENV: &str = "MEMFORGE_MEM_DEBUG";

/// Default rounding granularity
pub const DEFAULT_STEP_BYTES: usize = 1024;

/// Default per-device buffer-count ceiling
pub const DEFAULT_MAX_BUFFERS: usize = 1000;

/// Byte ceiling used when the device cannot report its memory size
pub const FALLBACK_MAX_BYTES: usize = 1 << 30;

/// Configuration for a [`MemoryManager`](crate::memory::MemoryManager)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Size-class rounding granularity in bytes
    pub step_bytes: usize,

    /// Maximum number of buffers per device (free ones included)
    pub max_buffers: usize,

    /// Byte ceiling per device; `None` derives it from the device memory size
    pub max_bytes: Option<usize>,

    /// Bypass caching: every free goes straight to the native allocator
    pub debug_mode: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            step_bytes: DEFAULT_STEP_BYTES,
            max_buffers: DEFAULT_MAX_BUFFERS,
            max_bytes: None,
            debug_mode: false,
        }
    }
}

impl MemoryConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with any `MEMFORGE_*` environment variables
    pub fn from_env() -> MemResult<Self> {
        Self::default().overlay_env()
    }

    /// Overlay `MEMFORGE_*` environment variables onto this config
    pub fn overlay_env(mut self) -> MemResult<Self> {
        if let Some(step) = env_usize(STEP_SIZE_ENV)? {
            self.step_bytes = step;
        }
        if let Some(max) = env_usize(MAX_BUFFERS_ENV)? {
            self.max_buffers = max;
        }
        if let Some(max) = env_usize(MAX_BYTES_ENV)? {
            self.max_bytes = Some(max);
        }
        if let Ok(raw) = std::env::var(MEM_DEBUG_ENV) {
            self.debug_mode = parse_flag(&raw).ok_or_else(|| {
                MemError::InvalidConfiguration(format!("{}={:?} is not a boolean", MEM_DEBUG_ENV, raw))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Set the rounding granularity
    pub fn with_step_bytes(mut self, step_bytes: usize) -> Self {
        self.step_bytes = step_bytes;
        self
    }

    /// Set the per-device buffer ceiling
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    /// Set the per-device byte ceiling
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Enable or disable debug mode
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Reject values the manager cannot work with
    pub fn validate(&self) -> MemResult<()> {
        if self.step_bytes == 0 {
            return Err(MemError::InvalidConfiguration(
                "step size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Byte ceiling for a device reporting `memory_size` bytes
    ///
    /// 75% of device memory, or 1 GiB when the size is unknown.
    pub fn max_bytes_for(&self, memory_size: usize) -> usize {
        match self.max_bytes {
            Some(max) => max,
            None if memory_size == 0 => FALLBACK_MAX_BYTES,
            None => memory_size / 4 * 3,
        }
    }
}

fn env_usize(name: &str) -> MemResult<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<usize>().map(Some).map_err(|e| {
            MemError::InvalidConfiguration(format!("{}={:?}: {}", name, raw, e))
        }),
        Err(_) => Ok(None),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
