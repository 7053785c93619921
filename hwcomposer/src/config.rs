// Process-wide typed options registry. Follows the host compositor's small,
// named-settings-struct approach to configuration: no file I/O, no serde
// round-trip. The core never persists anything, it only exposes typed
// lookups over values the embedding binary has already decided.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
}

/// A process-wide, in-memory name/value registry.
#[derive(Default)]
pub struct Options {
    values: RwLock<HashMap<String, Value>>,
}

impl Options {
    pub const FRAME_POOL_SIZE: &'static str = "hwc.frame_pool_size";
    pub const FRAME_POOL_SOFT_LIMIT: &'static str = "hwc.frame_pool_soft_limit";
    pub const FLIP_WATCHDOG_MS: &'static str = "hwc.flip_watchdog_ms";
    pub const GPU_WAIT_TIMEOUT_MS: &'static str = "hwc.gpu_wait_timeout_ms";
    pub const QUEUE_DRAIN_TIMEOUT_MS: &'static str = "hwc.queue_drain_timeout_ms";
    pub const FLUSH_DEFAULT_TIMEOUT_MS: &'static str = "hwc.flush_default_timeout_ms";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.values.read().unwrap().get(name) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        match self.values.read().unwrap().get(name) {
            Some(Value::Int(i)) => *i,
            _ => default,
        }
    }

    pub fn set_bool(&self, name: &str, value: bool) {
        self.values.write().unwrap().insert(name.to_string(), Value::Bool(value));
    }

    pub fn set_int(&self, name: &str, value: i64) {
        self.values.write().unwrap().insert(name.to_string(), Value::Int(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_options_fall_back_to_default() {
        let opts = Options::new();
        assert_eq!(opts.get_int(Options::FRAME_POOL_SIZE, 10), 10);
        assert!(!opts.get_bool("unknown.flag", false));
    }

    #[test]
    fn set_overrides_default() {
        let opts = Options::new();
        opts.set_int(Options::GPU_WAIT_TIMEOUT_MS, 5_000);
        assert_eq!(opts.get_int(Options::GPU_WAIT_TIMEOUT_MS, 3_000), 5_000);
    }
}
