use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Operator gate consulted before every processor pass.
///
/// Seeded from configuration at startup. `set` only affects this process;
/// the configured value wins again after a restart.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    enabled: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_processing_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }
}
