//! Isolate configuration: heap constraints and startup data.

use crate::error::{Error, Result};
use std::sync::Arc;

/// Configuration for a new isolate.
///
/// The memory limit is the substrate's own ceiling, enforced by the heap
/// guard before the engine can fault; the engine additionally gets hard heap
/// limits derived from it so a guard miss still cannot take down the
/// process.
#[derive(Debug, Clone, Default)]
pub struct IsolateConfig {
    pub(crate) memory_limit: Option<usize>,
    pub(crate) initial_heap_size: Option<usize>,
    pub(crate) snapshot: Option<Arc<[u8]>>,
    pub(crate) name: Option<String>,
}

impl IsolateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the isolate at `bytes` of heap plus external memory. Unset means
    /// uncapped.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Initial engine heap reservation. Requires a memory limit.
    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    /// Startup snapshot consumed at isolate creation. The blob is shared by
    /// reference count, so one snapshot can back any number of isolates.
    pub fn with_snapshot(mut self, blob: impl Into<Arc<[u8]>>) -> Self {
        self.snapshot = Some(blob.into());
        self
    }

    /// Name used in log output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match (self.initial_heap_size, self.memory_limit) {
            (Some(_), None) => Err(Error::platform(
                "initial_heap_size requires a memory limit to be set as well",
            )),
            (Some(initial), Some(limit)) if initial > limit => Err(Error::platform(format!(
                "initial_heap_size ({initial}) cannot exceed the memory limit ({limit})"
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(IsolateConfig::new().validate().is_ok());
    }

    #[test]
    fn test_initial_heap_requires_limit() {
        let config = IsolateConfig::new().with_initial_heap_size(1024 * 1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_heap_must_not_exceed_limit() {
        let config = IsolateConfig::new()
            .with_memory_limit(1024 * 1024)
            .with_initial_heap_size(2 * 1024 * 1024);
        assert!(config.validate().is_err());

        let config = IsolateConfig::new()
            .with_memory_limit(2 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024);
        assert!(config.validate().is_ok());
    }
}
