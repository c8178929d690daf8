//! ResourceProbe implementations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use sysinfo::System;

use crate::ports::ResourceProbe;

/// Reads available memory from the OS on every call.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn available_memory_bytes(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        system.available_memory()
    }
}

/// Reports whatever value it was last given.
#[derive(Debug)]
pub struct StaticProbe {
    available: AtomicU64,
}

impl StaticProbe {
    pub fn new(available_bytes: u64) -> Self {
        Self {
            available: AtomicU64::new(available_bytes),
        }
    }

    pub fn set(&self, available_bytes: u64) {
        self.available.store(available_bytes, Ordering::SeqCst);
    }
}

impl ResourceProbe for StaticProbe {
    fn available_memory_bytes(&self) -> u64 {
        self.available.load(Ordering::SeqCst)
    }
}
