use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::completion::WaitStrategy;
use crate::provider::CompletionKind;
use crate::transfer::RmaOp;

pub const DEFAULT_DATA_PORT: &str = "9228";
pub const DEFAULT_MGMT_PORT: &str = "2710";

/// Wait bound for completion harvesting. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timeout(pub Option<Duration>);

impl Timeout {
    pub const INFINITE: Timeout = Timeout(None);
    pub const ZERO: Timeout = Timeout(Some(Duration::ZERO));

    /// Negative values mean infinite, as on the command line.
    pub fn from_millis(ms: i32) -> Timeout {
        if ms < 0 {
            Timeout::INFINITE
        } else {
            Timeout(Some(Duration::from_millis(ms as u64)))
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.0.is_none()
    }

    /// Milliseconds as poll(2) expects them.
    pub fn as_poll_millis(&self) -> i32 {
        match self.0 {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        }
    }
}

/// Iteration count scaled to the message size.
pub fn size_to_count(size: usize, bandwidth: bool) -> usize {
    let base = if size >= 1 << 20 {
        100
    } else if size >= 1 << 16 {
        1000
    } else {
        10000
    };
    if bandwidth { base * 2 } else { base }
}

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub transfer_size: usize,
    /// Zero derives the count from the transfer size.
    pub iterations: usize,
    pub warmup_iterations: usize,
    pub align: bool,
    pub verify_data: bool,
    pub skip_mr: bool,
    /// Receive side wait bound. Transmit waits are always infinite.
    pub timeout: Timeout,
    pub comp_method: WaitStrategy,
    pub comp_type: CompletionKind,
    pub rma_op: Option<RmaOp>,
    pub bandwidth: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        TestOptions {
            transfer_size: 1024,
            iterations: 0,
            warmup_iterations: 10,
            align: false,
            verify_data: false,
            skip_mr: false,
            timeout: Timeout::from_millis(-1),
            comp_method: WaitStrategy::Spin,
            comp_type: CompletionKind::Queue,
            rma_op: None,
            bandwidth: false,
        }
    }
}

impl TestOptions {
    pub fn with_transfer_size(mut self, size: usize) -> Self {
        self.transfer_size = size;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup_iterations = warmup;
        self
    }

    pub fn with_align(mut self, align: bool) -> Self {
        self.align = align;
        self
    }

    pub fn with_verify_data(mut self, verify: bool) -> Self {
        self.verify_data = verify;
        self
    }

    pub fn with_skip_mr(mut self, skip: bool) -> Self {
        self.skip_mr = skip;
        self
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_comp_method(mut self, method: WaitStrategy) -> Self {
        self.comp_method = method;
        self
    }

    pub fn with_comp_type(mut self, kind: CompletionKind) -> Self {
        self.comp_type = kind;
        self
    }

    pub fn with_rma_op(mut self, op: Option<RmaOp>) -> Self {
        self.rma_op = op;
        self
    }

    pub fn iteration_count(&self) -> usize {
        if self.iterations == 0 {
            size_to_count(self.transfer_size, self.bandwidth)
        } else {
            self.iterations
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_timeout_is_infinite() {
        assert!(Timeout::from_millis(-1).is_infinite());
        assert_eq!(Timeout::from_millis(-1).as_poll_millis(), -1);
        assert_eq!(Timeout::from_millis(250).as_poll_millis(), 250);
        assert_eq!(Timeout::ZERO.as_poll_millis(), 0);
    }

    #[test]
    fn iteration_count_follows_size() {
        let opts = TestOptions::default().with_transfer_size(1 << 20);
        assert_eq!(opts.iteration_count(), 100);
        let opts = opts.with_iterations(3);
        assert_eq!(opts.iteration_count(), 3);
        assert_eq!(size_to_count(64, true), 20000);
    }
}
