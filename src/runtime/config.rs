use bon::Builder;

/// Configuration for a [`Runtime`](super::Runtime).
#[derive(Debug, Clone, Builder)]
pub struct RuntimeConfig {
    /// Convert panics escaping action code into action faults.
    ///
    /// Disable to let panics propagate, e.g. to inspect them under a debugger.
    #[builder(default = true)]
    pub catch_action_panics: bool,

    /// Number of consecutive liveness checks a monitor may spend in a hot state.
    /// `0` disables the check.
    #[builder(default = 0)]
    pub liveness_temperature_threshold: u32,

    /// Maximum number of scheduling steps of a controlled execution.
    #[builder(default = 100_000)]
    pub max_steps: u64,

    /// Seed for nondeterministic choices. A random seed is used if not set.
    pub seed: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
