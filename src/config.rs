use crate::constants;

/// Run-time options, filled in by the command line.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of loop iterations before the run is aborted.
    pub timeout: u64,
    /// Stack size in bytes. The stack grows down from [`constants::STACK_TOP`].
    pub stack_size: u32,
    /// Upper bound on the total guest memory footprint in bytes.
    pub storage_size: u64,
    /// Enables the branch predictor.
    pub predictor: bool,
    /// Number of predictor entries. Must be a power of two.
    pub predictor_size: usize,
    /// Enables the per-opcode breakdown in the device report.
    pub detail: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            timeout: constants::DEFAULT_TIMEOUT,
            stack_size: constants::DEFAULT_STACK_SIZE,
            storage_size: constants::DEFAULT_STORAGE_SIZE,
            predictor: false,
            predictor_size: constants::DEFAULT_PREDICTOR_SIZE,
            detail: false,
        }
    }
}
