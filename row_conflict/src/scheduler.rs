//! Read Scheduler / Pacer.
//!
//! A [`ReadPlan`] fixes, once and for all, which remote address every read target of every
//! connection fetches. The plan is then either fired in bursts (one chain of reads per
//! connection, awaited together) by the [`Pacer`], or one read at a time by [`sample`].
//! Completions are drained by a dedicated poller thread in both cases, the issuing thread never
//! touches the completion queue.

use crate::address_selector::AddressSet;
use crate::connection::Connection;
use crate::error::ExperimentError;
use crate::samples::LatencyTrace;
use bit_field::BitField;
use dram_utils::affinity::pin_or_warn;
use dram_utils::clock::Clock;
use log::{debug, info, warn};
use rdma_channel::{CmId, Completion, CompletionQueue, ReadRequest, Transport, WcOpcode, WcStatus};
use spin_gate::{spin_until, SpinBudget};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_BATCH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPolicy {
    /// Only the last read of each connection's chain completes visibly.
    LastOnly,
    Every,
}

#[derive(Debug, Clone)]
struct Lane {
    id: CmId,
    reads: Vec<ReadRequest>,
}

#[derive(Debug, Clone)]
pub struct ReadPlan {
    lanes: Vec<Lane>,
    signaled_per_burst: usize,
}

impl ReadPlan {
    /// Pair the read targets of `connections`, in order, with consecutive entries of `addresses`.
    ///
    /// Reads are tagged with the index of the connection that issues them.
    pub fn build<T: Transport>(
        connections: &[Connection<T>],
        addresses: &AddressSet,
        rkey: u32,
        policy: SignalPolicy,
    ) -> Result<Self, ExperimentError> {
        let needed: usize = connections.iter().map(|c| c.read_target_count()).sum();
        if addresses.len() < needed {
            return Err(ExperimentError::NotEnoughAddresses {
                needed,
                available: addresses.len(),
            });
        }
        let mut remote = addresses.addresses().iter().copied();
        let lanes: Vec<Lane> = connections
            .iter()
            .map(|connection| {
                let last = connection.read_target_count().saturating_sub(1);
                let reads = connection
                    .read_targets()
                    .enumerate()
                    .zip(&mut remote)
                    .map(|((i, local), remote_addr)| ReadRequest {
                        wr_id: connection.index as u64,
                        remote_addr,
                        rkey,
                        local,
                        signaled: policy == SignalPolicy::Every || i == last,
                    })
                    .collect();
                Lane {
                    id: connection.id,
                    reads,
                }
            })
            .collect();
        let signaled_per_burst = lanes
            .iter()
            .map(|lane| lane.reads.iter().filter(|r| r.signaled).count())
            .sum();
        Ok(ReadPlan {
            lanes,
            signaled_per_burst,
        })
    }

    pub fn connections(&self) -> usize {
        self.lanes.len()
    }

    /// Completions one burst produces.
    pub fn signaled_per_burst(&self) -> usize {
        self.signaled_per_burst
    }

    /// Post every read of the plan, one chain per connection.
    pub fn post_burst<T: Transport>(&self, transport: &T) -> Result<(), ExperimentError> {
        for lane in &self.lanes {
            transport.post_reads(lane.id, &lane.reads)?;
        }
        Ok(())
    }

    /// Post the first read of connection `lane` alone, signaled and tagged `wr_id`.
    pub fn post_one<T: Transport>(
        &self,
        transport: &T,
        lane: usize,
        wr_id: u64,
    ) -> Result<(), ExperimentError> {
        let Some((lane, first)) = self
            .lanes
            .get(lane)
            .and_then(|lane| Some((lane, lane.reads.first()?)))
        else {
            return Err(ExperimentError::NotEnoughAddresses {
                needed: 1,
                available: 0,
            });
        };
        let read = ReadRequest {
            wr_id,
            signaled: true,
            ..*first
        };
        transport.post_reads(lane.id, std::slice::from_ref(&read))?;
        Ok(())
    }
}

fn check(wc: &Completion) -> Result<bool, ExperimentError> {
    if wc.status != WcStatus::Success {
        return Err(ExperimentError::CompletionFailed {
            wr_id: wc.wr_id,
            status: wc.status,
            opcode: wc.opcode,
        });
    }
    if wc.opcode != WcOpcode::RdmaRead {
        warn!("wrong completion opcode {:?} (wr_id {})", wc.opcode, wc.wr_id);
        return Ok(false);
    }
    Ok(true)
}

/// Poller thread counting read completions.
pub struct CountingPoller {
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<u64, ExperimentError>>>,
}

impl CountingPoller {
    pub fn spawn<Q: CompletionQueue>(cq: Q, core: Option<usize>) -> Self {
        let completed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let (completed, failed, stop) = (completed.clone(), failed.clone(), stop.clone());
            thread::spawn(move || {
                pin_or_warn(core, "completion poller");
                let mut batch = vec![Completion::default(); POLL_BATCH];
                let result = poll_counting(&cq, &mut batch, &completed, &stop);
                if result.is_err() {
                    failed.store(true, Ordering::Release);
                }
                result
            })
        };
        CountingPoller {
            completed,
            failed,
            stop,
            handle: Some(handle),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Spin until `target` reads have completed in total.
    pub fn wait_for(
        &mut self,
        target: u64,
        budget: Option<SpinBudget>,
    ) -> Result<(), ExperimentError> {
        spin_until(
            || self.completed() >= target || self.failed.load(Ordering::Acquire),
            budget,
        )?;
        if self.failed.load(Ordering::Acquire) {
            return match self.join() {
                Err(e) => Err(e),
                Ok(_) => Err(ExperimentError::PollerPanicked),
            };
        }
        Ok(())
    }

    /// Stop the thread and return the number of completions it saw.
    pub fn stop(mut self) -> Result<u64, ExperimentError> {
        self.stop.store(true, Ordering::Release);
        self.join()
    }

    fn join(&mut self) -> Result<u64, ExperimentError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ExperimentError::PollerPanicked)?,
            None => Ok(self.completed()),
        }
    }
}

impl Drop for CountingPoller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.join();
    }
}

fn poll_counting<Q: CompletionQueue>(
    cq: &Q,
    batch: &mut [Completion],
    completed: &AtomicU64,
    stop: &AtomicBool,
) -> Result<u64, ExperimentError> {
    while !stop.load(Ordering::Acquire) {
        let n = cq.poll(batch)?;
        for wc in &batch[..n] {
            if check(wc)? {
                completed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    Ok(completed.load(Ordering::Acquire))
}

/// Mean round trip time of the trials left once the first `warmup` ones are dropped.
///
/// With fewer trials than `warmup` every trial is kept.
pub fn tune_period(rtts: &[f64], warmup: usize) -> f64 {
    let window = if warmup < rtts.len() { &rtts[warmup..] } else { rtts };
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModulationReport {
    pub frames: u64,
    pub bursts: u64,
}

/// Fires bursts of the plan and waits for them, keeping time with `clock`.
pub struct Pacer<'a, T: Transport, C: Clock> {
    transport: &'a T,
    plan: &'a ReadPlan,
    clock: &'a C,
    poller: CountingPoller,
    budget: Option<SpinBudget>,
    expected: u64,
}

impl<'a, T: Transport, C: Clock> Pacer<'a, T, C> {
    pub fn new(
        transport: &'a T,
        plan: &'a ReadPlan,
        clock: &'a C,
        poller_core: Option<usize>,
        budget: Option<SpinBudget>,
    ) -> Self {
        Pacer {
            transport,
            plan,
            clock,
            poller: CountingPoller::spawn(transport.completion_queue(), poller_core),
            budget,
            expected: 0,
        }
    }

    /// One burst, returns its round trip time in nanoseconds.
    pub fn burst(&mut self) -> Result<u64, ExperimentError> {
        let start = self.clock.now_ns();
        self.plan.post_burst(self.transport)?;
        self.expected += self.plan.signaled_per_burst() as u64;
        self.poller.wait_for(self.expected, self.budget)?;
        Ok(self.clock.elapsed_ns(start))
    }

    /// Run `trials` bursts back to back and return the tuned period in nanoseconds.
    pub fn calibrate(&mut self, trials: usize, warmup: usize) -> Result<f64, ExperimentError> {
        let rtts = (0..trials)
            .map(|_| self.burst().map(|ns| ns as f64))
            .collect::<Result<Vec<f64>, _>>()?;
        let period = tune_period(&rtts, warmup);
        debug!("tuned over {} trials, {} warm-up", trials, warmup);
        Ok(period)
    }

    /// Repeat `message`, least significant bit first, for `duration`.
    ///
    /// A set bit is a burst followed by a wait until `period_ns` has passed since it started, a
    /// clear bit is the same wait without reads.
    pub fn modulate(
        &mut self,
        message: u64,
        bits: usize,
        period_ns: u64,
        duration: Duration,
    ) -> Result<ModulationReport, ExperimentError> {
        let bits = bits.min(u64::BIT_LENGTH);
        let started = self.clock.now_ns();
        let duration_ns = duration.as_nanos() as u64;
        let mut report = ModulationReport::default();
        while self.clock.elapsed_ns(started) < duration_ns {
            for bit in 0..bits {
                let start = self.clock.now_ns();
                if message.get_bit(bit) {
                    self.burst()?;
                    report.bursts += 1;
                }
                self.clock.spin_until_elapsed(start, period_ns);
            }
            report.frames += 1;
        }
        info!(
            "sent {} frames ({} bursts) in {:?}",
            report.frames, report.bursts, duration
        );
        Ok(report)
    }

    /// Stop the poller, returns the number of read completions seen.
    pub fn finish(self) -> Result<u64, ExperimentError> {
        self.poller.stop()
    }
}

/// Issue `samples` single reads, round robin over the connections of `plan`, one every
/// `probe_wait_ns`, and time each of them.
pub fn sample<T, C>(
    transport: &T,
    plan: &ReadPlan,
    clock: &C,
    samples: usize,
    probe_wait_ns: u64,
    poller_core: Option<usize>,
    budget: Option<SpinBudget>,
) -> Result<LatencyTrace, ExperimentError>
where
    T: Transport,
    C: Clock + Clone + 'static,
{
    let lanes = plan.connections();
    if lanes == 0 && samples > 0 {
        return Err(ExperimentError::NotEnoughAddresses {
            needed: 1,
            available: 0,
        });
    }
    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
        let (cq, clock, stop) = (transport.completion_queue(), clock.clone(), stop.clone());
        thread::spawn(move || {
            pin_or_warn(poller_core, "sampling poller");
            poll_sampling(&cq, &clock, samples, &stop, budget)
        })
    };

    let mut starts = vec![0u64; samples];
    let mut issued = Ok(());
    let mut last = clock.now_ns();
    for (i, start) in starts.iter_mut().enumerate() {
        clock.spin_until_elapsed(last, probe_wait_ns);
        last = clock.now_ns();
        *start = clock.ticks();
        issued = plan.post_one(transport, i % lanes, i as u64);
        if issued.is_err() {
            stop.store(true, Ordering::Release);
            break;
        }
    }

    let ends = poller
        .join()
        .map_err(|_| ExperimentError::PollerPanicked)?;
    issued?;
    Ok(LatencyTrace::new(starts, ends?, clock.ticks_per_ns()))
}

/// Drain `samples` read completions, stamping each with the time taken right before the poll
/// that returned it.
fn poll_sampling<Q: CompletionQueue, C: Clock>(
    cq: &Q,
    clock: &C,
    samples: usize,
    stop: &AtomicBool,
    budget: Option<SpinBudget>,
) -> Result<Vec<u64>, ExperimentError> {
    let mut ends = vec![0u64; samples];
    let mut batch = vec![Completion::default(); POLL_BATCH];
    let mut seen = 0;
    while seen < samples {
        let mut polled = Ok(0);
        let mut t = 0;
        spin_until(
            || {
                if stop.load(Ordering::Acquire) {
                    return true;
                }
                t = clock.ticks();
                polled = cq.poll(&mut batch);
                !matches!(polled, Ok(0))
            },
            budget,
        )?;
        if stop.load(Ordering::Acquire) {
            break;
        }
        for wc in &batch[..polled?] {
            if !check(wc)? {
                continue;
            }
            let end = ends
                .get_mut(wc.wr_id as usize)
                .ok_or(ExperimentError::UnknownWorkRequest(wc.wr_id))?;
            *end = t;
            seen += 1;
        }
    }
    Ok(ends)
}
