//! Runs one test case on a session: rendezvous, timed data loop, teardown.

use std::time::Duration;

use crate::completion::Stopwatch;
use crate::config::TestOptions;
use crate::control::{ClassFunction, TestDescriptor, TestRunner};
use crate::error::{FabtestError, Result};
use crate::get_hostname;
use crate::provider::{Caps, Direction, FabricInfo, Hints, InfoFlags, Provider};
use crate::session::{Role, Session};
use crate::transfer::RmaOp;

/// Upper bound on operations posted before waiting in bandwidth mode.
pub const BW_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Send,
    Inject,
    Rma(RmaOp),
}

impl Step {
    fn name(&self) -> String {
        match self {
            Step::Send => "send".to_string(),
            Step::Inject => "inject".to_string(),
            Step::Rma(op) => op.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerfStats {
    pub name: String,
    pub transfer_size: usize,
    pub iterations: usize,
    /// Transfers counted per iteration: two for ping-pong.
    pub transfers_per_iteration: usize,
    pub elapsed: Duration,
}

impl PerfStats {
    pub fn bytes(&self) -> u64 {
        (self.iterations * self.transfers_per_iteration * self.transfer_size) as u64
    }

    pub fn mb_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 { 0.0 } else { self.bytes() as f64 / secs / 1_000_000.0 }
    }

    pub fn usec_per_xfer(&self) -> f64 {
        let transfers = self.iterations * self.transfers_per_iteration;
        if transfers == 0 { 0.0 } else { self.elapsed.as_secs_f64() * 1_000_000.0 / transfers as f64 }
    }

    pub fn show(&self) {
        log::info!(
            "{} {:<10} bytes {:>8} iters {:>8} total {:>10} time {:>8.3}s {:>10.2} MB/sec {:>10.2} usec/xfer",
            get_hostname(),
            self.name,
            self.transfer_size,
            self.iterations,
            self.bytes(),
            self.elapsed.as_secs_f64(),
            self.mb_per_sec(),
            self.usec_per_xfer()
        );
    }
}

fn step_for(session: &Session, function: ClassFunction) -> Result<Step> {
    match function {
        ClassFunction::Send => Ok(Step::Send),
        ClassFunction::Inject => Ok(Step::Inject),
        ClassFunction::Rma => {
            let op = session
                .options()
                .rma_op
                .ok_or_else(|| FabtestError::Config("rma test without an rma op".to_string()))?;
            if !session.info().caps.contains(Caps::RMA) {
                return Err(FabtestError::NotImplemented(format!("{} without rma caps", op)));
            }
            // one-sided ops advance the transmit tag with no matching receive
            if op != RmaOp::WriteData && session.info().caps.contains(Caps::TAGGED) {
                return Err(FabtestError::NotImplemented(format!("tagged {}", op)));
            }
            Ok(Step::Rma(op))
        }
    }
}

fn send(session: &mut Session, step: Step, size: usize) -> Result<()> {
    match step {
        Step::Inject => session.inject(size),
        _ => session.tx(size),
    }
}

fn latency_loop(session: &mut Session, step: Step, size: usize, warmup: usize, iterations: usize) -> Result<Duration> {
    let mut timer = None;
    for i in 0..warmup + iterations {
        if i == warmup {
            timer = Some(Stopwatch::start());
        }
        match (step, session.role()) {
            (Step::Rma(op), _) => session.rma(op, size)?,
            (_, Role::Initiator) => {
                send(session, step, size)?;
                session.rx(size)?;
            }
            (_, Role::Responder) => {
                session.rx(size)?;
                send(session, step, size)?;
            }
        }
    }
    Ok(timer.map(|t| t.elapsed()).unwrap_or_default())
}

fn post_batch(session: &mut Session, step: Step, size: usize, batch: usize) -> Result<()> {
    for _ in 0..batch {
        match step {
            Step::Send => {
                session.fill_tx(size);
                session.post_tx(size)?;
            }
            Step::Inject => session.inject(size)?,
            Step::Rma(op) => {
                session.post_rma(op, size)?;
            }
        }
    }
    Ok(())
}

fn bandwidth_loop(session: &mut Session, step: Step, size: usize, warmup: usize, iterations: usize) -> Result<Duration> {
    let window = BW_WINDOW.min(session.info().tx_size.max(1));
    let total = warmup + iterations;
    let mut done = 0;
    let mut timer = None;
    while done < total {
        if done >= warmup && timer.is_none() {
            timer = Some(Stopwatch::start());
        }
        let batch = if done < warmup { warmup - done } else { total - done }.min(window);
        match (step, session.role()) {
            (Step::Rma(op), _) => {
                post_batch(session, step, size, batch)?;
                if op == RmaOp::WriteData {
                    for _ in 0..batch {
                        session.rx(0)?;
                    }
                }
                let issued = session.tracker().issued(Direction::Tx);
                session.get_tx_comp(issued)?;
            }
            (_, Role::Initiator) => {
                post_batch(session, step, size, batch)?;
                let issued = session.tracker().issued(Direction::Tx);
                session.get_tx_comp(issued)?;
                session.rx(0)?;
            }
            (_, Role::Responder) => {
                for _ in 0..batch {
                    session.rx(size)?;
                }
                session.tx(0)?;
            }
        }
        done += batch;
    }
    Ok(timer.map(|t| t.elapsed()).unwrap_or_default())
}

/// Full lifecycle of one case on an opened session.
pub fn run_test(session: &mut Session, function: ClassFunction) -> Result<PerfStats> {
    let opts = session.options().clone();
    let step = step_for(session, function)?;
    let size = opts.transfer_size.min(session.buffers().max_payload());
    if step == Step::Inject && size + session.buffers().tx_prefix() > session.info().inject_size {
        return Err(FabtestError::NoData(format!(
            "transfer size {} exceeds inject size {}",
            size,
            session.info().inject_size
        )));
    }

    session.exchange_addresses()?;
    if matches!(step, Step::Rma(_)) {
        session.exchange_keys()?;
    }
    session.sync()?;

    let iterations = opts.iteration_count();
    session.set_active(true);
    let elapsed = if opts.bandwidth {
        bandwidth_loop(session, step, size, opts.warmup_iterations, iterations)
    } else {
        latency_loop(session, step, size, opts.warmup_iterations, iterations)
    };
    session.set_active(false);
    let elapsed = elapsed?;

    session.sync()?;
    session.finalize()?;

    let pingpong = !opts.bandwidth && !matches!(step, Step::Rma(_));
    Ok(PerfStats {
        name: step.name(),
        transfer_size: size,
        iterations,
        transfers_per_iteration: if pingpong { 2 } else { 1 },
        elapsed,
    })
}

/// [`TestRunner`] that opens real sessions through a provider.
pub struct FabricTestRunner<P: Provider> {
    provider: P,
    base: TestOptions,
    source: Option<(String, String)>,
    last: Option<PerfStats>,
}

impl<P: Provider> FabricTestRunner<P> {
    pub fn new(provider: P, base: TestOptions) -> Self {
        FabricTestRunner { provider, base, source: None, last: None }
    }

    /// Binds initiator endpoints to `node:service` instead of the routed default.
    pub fn with_source(mut self, node: &str, service: &str) -> Self {
        self.source = Some((node.to_string(), service.to_string()));
        self
    }

    fn local_info(&self, info: &FabricInfo, role: Role) -> Result<FabricInfo> {
        let Some((node, service)) = &self.source else {
            return Ok(info.clone());
        };
        if role != Role::Initiator {
            return Ok(info.clone());
        }
        let local = self.provider.getinfo(Some(node), Some(service), InfoFlags::SOURCE, &info.hints())?;
        let src_addr = local.into_iter().find_map(|i| i.src_addr);
        Ok(FabricInfo { src_addr, ..info.clone() })
    }

    pub fn last_stats(&self) -> Option<&PerfStats> {
        self.last.as_ref()
    }
}

impl<P: Provider> TestRunner for FabricTestRunner<P> {
    fn getinfo(&self, node: Option<&str>, service: Option<&str>, flags: InfoFlags, hints: &Hints) -> Result<Vec<FabricInfo>> {
        self.provider.getinfo(node, service, flags, hints)
    }

    fn run(&mut self, info: &FabricInfo, desc: &TestDescriptor, role: Role) -> Result<()> {
        let opts = desc.options(&self.base);
        let info = self.local_info(info, role)?;
        let mut session = Session::open(&self.provider, &info, opts, role)?;
        log::debug!("{} session {} runs test {} as {}", get_hostname(), session.id(), desc.test_index, role);
        let stats = run_test(&mut session, desc.class_function)?;
        stats.show();
        self.last = Some(stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;

    fn session(caps: Caps, opts: TestOptions) -> Session {
        let mut info = MockEndpoint::default_info(caps);
        info.dest_addr = Some(b"peer".to_vec());
        let ep = MockEndpoint::loopback(info);
        Session::new(ep.into_resources(), opts, Role::Initiator).unwrap()
    }

    #[test]
    fn perf_stats_count_both_directions_of_a_pingpong() {
        let stats = PerfStats {
            name: "send".to_string(),
            transfer_size: 1000,
            iterations: 10,
            transfers_per_iteration: 2,
            elapsed: Duration::from_millis(20),
        };
        assert_eq!(stats.bytes(), 20_000);
        assert!((stats.mb_per_sec() - 1.0).abs() < 1e-9);
        assert!((stats.usec_per_xfer() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn loopback_send_test_runs_to_completion() {
        let opts = TestOptions::default().with_transfer_size(256).with_iterations(5).with_warmup(2).with_verify_data(true);
        let mut session = session(Caps::MSG, opts);
        let stats = run_test(&mut session, ClassFunction::Send).unwrap();
        assert_eq!(stats.iterations, 5);
        assert_eq!(stats.transfer_size, 256);
        assert_eq!(session.state(), crate::rendezvous::RendezvousState::Closed);
        assert_eq!(session.tracker().outstanding(Direction::Tx), 0);
    }

    #[test]
    fn inject_above_limit_reports_no_data() {
        let opts = TestOptions::default().with_transfer_size(1024).with_iterations(1);
        let mut session = session(Caps::MSG, opts);
        let err = run_test(&mut session, ClassFunction::Inject).unwrap_err();
        assert!(matches!(err, FabtestError::NoData(_)));
    }

    #[test]
    fn tagged_one_sided_rma_is_not_implemented() {
        let opts = TestOptions::default().with_rma_op(Some(RmaOp::Write));
        let mut session = session(Caps::TAGGED | Caps::RMA, opts);
        let err = run_test(&mut session, ClassFunction::Rma).unwrap_err();
        assert!(matches!(err, FabtestError::NotImplemented(_)));
    }

    #[test]
    fn rma_without_op_is_a_config_error() {
        let mut session = session(Caps::MSG | Caps::RMA, TestOptions::default());
        assert!(matches!(run_test(&mut session, ClassFunction::Rma), Err(FabtestError::Config(_))));
    }
}
