//! Configuration of the dynamic dataflow director.

use serde::{Deserialize, Serialize};

/// Parameters of the dynamic dataflow director
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DdfConfig {
    iterations: u64,
    maximum_receiver_capacity: usize,
    run_until_deadlock: bool,
}

impl DdfConfig {
    /// Number of logical iterations to run; 0 means unbounded
    #[must_use]
    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Receiver capacity bound; 0 means unbounded
    #[must_use]
    pub const fn maximum_receiver_capacity(&self) -> usize {
        self.maximum_receiver_capacity
    }

    /// Whether one logical iteration repeats basic iterations until
    /// deadlock; only meaningful (and only permitted) when embedded
    #[must_use]
    pub const fn run_until_deadlock(&self) -> bool {
        self.run_until_deadlock
    }

    /// Set the logical iteration bound (0 = unbounded)
    pub fn set_iterations(&mut self, iterations: u64) {
        self.iterations = iterations;
    }

    /// Set the receiver capacity bound (0 = unbounded)
    pub fn set_maximum_receiver_capacity(&mut self, capacity: usize) {
        self.maximum_receiver_capacity = capacity;
    }

    /// Request repeated basic iterations per logical iteration
    pub fn set_run_until_deadlock(&mut self, value: bool) {
        self.run_until_deadlock = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unbounded() {
        let config = DdfConfig::default();
        assert_eq!(config.iterations(), 0);
        assert_eq!(config.maximum_receiver_capacity(), 0);
        assert!(!config.run_until_deadlock());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut config = DdfConfig::default();
        config.set_iterations(5);
        config.set_maximum_receiver_capacity(16);
        let json = serde_json::to_string(&config).unwrap();
        let back: DdfConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
