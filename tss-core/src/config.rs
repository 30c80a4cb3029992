#![forbid(unsafe_code)]

use std::time::Duration;

/// Session timing knobs. Both timeouts are absolute from session start;
/// round durations vary too much for per-round deadlines to be useful.
#[derive(Clone, Copy, Debug)]
pub struct TssConfig {
    /// Bounds an entire keysign session.
    pub key_sign_timeout: Duration,
    /// Bounds any one-shot setup step (party construction and start).
    pub pre_param_timeout: Duration,
}

impl TssConfig {
    pub fn with_key_sign_timeout(mut self, timeout: Duration) -> Self {
        self.key_sign_timeout = timeout;
        self
    }

    pub fn with_pre_param_timeout(mut self, timeout: Duration) -> Self {
        self.pre_param_timeout = timeout;
        self
    }
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            key_sign_timeout: Duration::from_secs(90),
            pre_param_timeout: Duration::from_secs(5),
        }
    }
}
