use crate::error::{FabtestError, Result};

pub const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const INTEG_SEED: u64 = 7;

fn start_index(iteration: u64) -> usize {
    (iteration.wrapping_mul(INTEG_SEED) % ALPHABET.len() as u64) as usize
}

/// Writes the pattern for `iteration` into `buf`.
pub fn fill_at(buf: &mut [u8], iteration: u64) {
    let start = start_index(iteration);
    for (i, b) in buf.iter_mut().enumerate() {
        *b = ALPHABET[(start + i) % ALPHABET.len()];
    }
}

/// Index of the first byte that differs from the pattern for `iteration`.
pub fn first_mismatch(buf: &[u8], iteration: u64) -> Option<usize> {
    let start = start_index(iteration);
    buf.iter()
        .enumerate()
        .find(|(i, b)| **b != ALPHABET[(start + i) % ALPHABET.len()])
        .map(|(i, _)| i)
}

/// Independent fill and check iteration counters for one session.
#[derive(Debug, Default, Clone)]
pub struct IntegrityPattern {
    fill_iteration: u64,
    check_iteration: u64,
}

impl IntegrityPattern {
    pub fn new() -> IntegrityPattern {
        IntegrityPattern::default()
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        fill_at(buf, self.fill_iteration);
        self.fill_iteration += 1;
    }

    pub fn check(&mut self, buf: &[u8]) -> Result<()> {
        let iteration = self.check_iteration;
        self.check_iteration += 1;
        match first_mismatch(buf, iteration) {
            None => Ok(()),
            Some(offset) => {
                log::error!("Error at iteration={} size={} byte={}", self.check_iteration, buf.len(), offset);
                Err(FabtestError::IntegrityMismatch { iteration, size: buf.len(), offset })
            }
        }
    }

    pub fn fill_iteration(&self) -> u64 {
        self.fill_iteration
    }

    pub fn check_iteration(&self) -> u64 {
        self.check_iteration
    }
}
