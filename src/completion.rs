use std::fmt::Display;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Timeout;
use crate::error::{FabtestError, Result};
use crate::provider::{self, CompletionQueue, CompletionSource, Counter, CqEntry, CqErrEntry, CqRead, Direction, WaitObj};

/// How a waiter blocks for completion queue events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WaitStrategy {
    #[default]
    #[serde(rename = "spin")]
    Spin,
    #[serde(rename = "sread")]
    BlockingRead,
    #[serde(rename = "fd")]
    DescriptorWait,
}

impl WaitStrategy {
    /// Wait object the completion queue must be opened with.
    pub fn wait_obj(&self) -> WaitObj {
        match self {
            WaitStrategy::Spin => WaitObj::None,
            WaitStrategy::BlockingRead => WaitObj::Unspec,
            WaitStrategy::DescriptorWait => WaitObj::Fd,
        }
    }
}

impl FromStr for WaitStrategy {
    type Err = FabtestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spin" => Ok(WaitStrategy::Spin),
            "sread" => Ok(WaitStrategy::BlockingRead),
            "fd" => Ok(WaitStrategy::DescriptorWait),
            other => Err(FabtestError::Config(format!("unknown completion method {}", other))),
        }
    }
}

impl Display for WaitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitStrategy::Spin => write!(f, "spin"),
            WaitStrategy::BlockingRead => write!(f, "sread"),
            WaitStrategy::DescriptorWait => write!(f, "fd"),
        }
    }
}

enum Harvest {
    Done,
    ErrorPending,
}

struct Lane {
    source: CompletionSource,
    issued: u64,
    completed: u64,
    counter_errors: u64,
    last: Option<CqEntry>,
}

impl Lane {
    fn new(source: CompletionSource) -> Lane {
        Lane { source, issued: 0, completed: 0, counter_errors: 0, last: None }
    }
}

/// Issue and completion sequence counters for both directions, each backed
/// by a completion queue or a counter.
pub struct CompletionTracker {
    tx: Lane,
    rx: Lane,
    strategy: WaitStrategy,
}

impl CompletionTracker {
    pub fn new(tx: CompletionSource, rx: CompletionSource, strategy: WaitStrategy) -> CompletionTracker {
        CompletionTracker { tx: Lane::new(tx), rx: Lane::new(rx), strategy }
    }

    fn lane(&self, dir: Direction) -> &Lane {
        match dir {
            Direction::Tx => &self.tx,
            Direction::Rx => &self.rx,
        }
    }

    fn lane_mut(&mut self, dir: Direction) -> &mut Lane {
        match dir {
            Direction::Tx => &mut self.tx,
            Direction::Rx => &mut self.rx,
        }
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Counts one successfully posted operation and returns its sequence number.
    pub fn issue(&mut self, dir: Direction) -> u64 {
        let lane = self.lane_mut(dir);
        lane.issued += 1;
        lane.issued
    }

    pub fn issued(&self, dir: Direction) -> u64 {
        self.lane(dir).issued
    }

    pub fn completed(&self, dir: Direction) -> u64 {
        self.lane(dir).completed
    }

    pub fn outstanding(&self, dir: Direction) -> u64 {
        let lane = self.lane(dir);
        lane.issued.saturating_sub(lane.completed)
    }

    /// Accounts for an operation that produces no completion entry.
    pub fn mark_completed(&mut self, dir: Direction) {
        self.lane_mut(dir).completed += 1;
    }

    pub fn last_completion(&self, dir: Direction) -> Option<&CqEntry> {
        self.lane(dir).last.as_ref()
    }

    pub fn has_source(&self, dir: Direction) -> bool {
        !matches!(self.lane(dir).source, CompletionSource::Absent)
    }

    /// Blocks until `target` completions were observed on `dir`.
    ///
    /// An error entry read off the queue counts as progress and is returned
    /// once as [`FabtestError::Completion`].
    pub fn await_through(&mut self, dir: Direction, target: u64, timeout: Timeout) -> Result<()> {
        let strategy = self.strategy;
        let lane = self.lane_mut(dir);
        if lane.completed >= target {
            return Ok(());
        }
        match &mut lane.source {
            CompletionSource::Queue(cq) => {
                let harvest = match strategy {
                    WaitStrategy::Spin => spin(cq.as_mut(), &mut lane.completed, &mut lane.last, target, timeout),
                    WaitStrategy::BlockingRead => blocking_read(cq.as_mut(), &mut lane.completed, &mut lane.last, target, timeout),
                    WaitStrategy::DescriptorWait => descriptor_wait(cq.as_mut(), &mut lane.completed, &mut lane.last, target, timeout),
                };
                match harvest {
                    Ok(Harvest::Done) => Ok(()),
                    Ok(Harvest::ErrorPending) => {
                        let entry = cq.readerr()?;
                        lane.completed += 1;
                        log::error!("{} completion error: {} ({}) {}", dir, entry.err, entry.prov_errno, entry.message);
                        Err(FabtestError::Completion(entry))
                    }
                    Err(FabtestError::Timeout) => {
                        if !timeout.0.is_some_and(|d| d.is_zero()) {
                            log::warn!("{} wait timed out at {}/{}", dir, lane.completed, target);
                        }
                        Err(FabtestError::Timeout)
                    }
                    Err(e) => Err(e),
                }
            }
            CompletionSource::Counter(cntr) => {
                counter_wait(cntr.as_mut(), &mut lane.completed, &mut lane.counter_errors, target, timeout)
            }
            CompletionSource::Absent => {
                log::error!("Trying to get a {} completion when no {} CQ or counter were opened", dir, dir);
                Err(FabtestError::NoCompletionSource(dir))
            }
        }
    }

    /// Reaps whatever already completed on `dir` without blocking.
    pub fn drain(&mut self, dir: Direction) -> Result<()> {
        let target = self.issued(dir);
        match self.await_through(dir, target, Timeout::ZERO) {
            Err(FabtestError::Timeout) => Ok(()),
            other => other,
        }
    }
}

// Expires once the full window passed without progress, with millisecond
// resolution rather than whole seconds.
fn expired(since: Instant, timeout: Timeout) -> bool {
    match timeout.0 {
        None => false,
        Some(window) => since.elapsed() >= window,
    }
}

fn remaining(since: Instant, timeout: Timeout) -> Timeout {
    match timeout.0 {
        None => Timeout::INFINITE,
        Some(window) => Timeout(Some(window.saturating_sub(since.elapsed()))),
    }
}

// Idle window restarts on every completion.
fn spin(cq: &mut dyn CompletionQueue, completed: &mut u64, last: &mut Option<CqEntry>, target: u64, timeout: Timeout) -> Result<Harvest> {
    let mut progress_at = Instant::now();
    while *completed < target {
        match cq.read()? {
            CqRead::Entry(entry) => {
                *completed += 1;
                *last = Some(entry);
                progress_at = Instant::now();
            }
            CqRead::ErrorAvailable => return Ok(Harvest::ErrorPending),
            CqRead::Empty => {
                if expired(progress_at, timeout) {
                    return Err(FabtestError::Timeout);
                }
                std::hint::spin_loop();
            }
        }
    }
    Ok(Harvest::Done)
}

fn blocking_read(cq: &mut dyn CompletionQueue, completed: &mut u64, last: &mut Option<CqEntry>, target: u64, timeout: Timeout) -> Result<Harvest> {
    while *completed < target {
        match cq.sread(timeout)? {
            CqRead::Entry(entry) => {
                *completed += 1;
                *last = Some(entry);
            }
            CqRead::ErrorAvailable => return Ok(Harvest::ErrorPending),
            CqRead::Empty => {
                if !timeout.is_infinite() {
                    return Err(FabtestError::Timeout);
                }
            }
        }
    }
    Ok(Harvest::Done)
}

fn descriptor_wait(cq: &mut dyn CompletionQueue, completed: &mut u64, last: &mut Option<CqEntry>, target: u64, timeout: Timeout) -> Result<Harvest> {
    let fd = cq
        .wait_fd()
        .ok_or_else(|| FabtestError::NotImplemented("completion queue has no wait fd".to_string()))?;
    let mut progress_at = Instant::now();
    while *completed < target {
        let mut poll_expired = false;
        if cq.trywait()? {
            poll_expired = !provider::poll_fd(fd, remaining(progress_at, timeout))?;
        }
        // The event may have landed between trywait and poll.
        match cq.read()? {
            CqRead::Entry(entry) => {
                *completed += 1;
                *last = Some(entry);
                progress_at = Instant::now();
            }
            CqRead::ErrorAvailable => return Ok(Harvest::ErrorPending),
            CqRead::Empty => {
                if poll_expired || expired(progress_at, timeout) {
                    return Err(FabtestError::Timeout);
                }
            }
        }
    }
    Ok(Harvest::Done)
}

// A counter error stands for one finished operation, so successes and
// errors together are measured against the target.
fn counter_wait(cntr: &mut dyn Counter, completed: &mut u64, errors: &mut u64, target: u64, timeout: Timeout) -> Result<()> {
    let mut value = cntr.read()?;
    let mut failed = cntr.read_err()?;
    if value + failed < target {
        let waited = cntr.wait(target.saturating_sub(failed), timeout);
        value = cntr.read()?;
        failed = cntr.read_err()?;
        if value + failed < target && failed == *errors {
            waited?;
        }
    }
    *completed = (*completed).max(value + failed);
    if failed > *errors {
        let new = failed - *errors;
        *errors = failed;
        log::error!("counter reported {} new errors", new);
        return Err(FabtestError::Completion(CqErrEntry {
            err: libc::EIO,
            message: format!("counter reported {} errors", failed),
            ..Default::default()
        }));
    }
    Ok(())
}

/// Wall time of a timed section, for throughput reporting.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Stopwatch {
        Stopwatch { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
