//! Machine configuration.

use cpu_s390::ArchMode;

/// Configuration for one machine instance.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Main-storage size in bytes (rounded up to a 4 KiB multiple).
    pub mainsize: u64,
    /// Number of CPU engines.
    pub numcpu: usize,
    /// Architecture personality of every engine.
    pub arch: ArchMode,
    /// CPU identification number reported by STIDP.
    pub cpuid: u64,
    /// Timer-thread tick interval in milliseconds.
    pub timer_interval_ms: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mainsize: 16 * 1024 * 1024,
            numcpu: 1,
            arch: ArchMode::Esa390,
            cpuid: 0x0000_0001_3090_0000,
            timer_interval_ms: 1,
        }
    }
}

impl MachineConfig {
    /// Configuration with `mainsize` bytes and `numcpu` engines.
    #[must_use]
    pub fn new(mainsize: u64, numcpu: usize) -> Self {
        Self {
            mainsize,
            numcpu,
            ..Self::default()
        }
    }

    /// Select the architecture personality.
    #[must_use]
    pub fn arch(mut self, arch: ArchMode) -> Self {
        self.arch = arch;
        self
    }
}
