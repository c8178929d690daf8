//! ResourceProbe port - admission control のためのメモリ観測

/// Reports memory currently available to this host.
pub trait ResourceProbe: Send + Sync {
    fn available_memory_bytes(&self) -> u64;
}
