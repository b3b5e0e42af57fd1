use super::stopped_early;
use crate::address_selector::AddressSelector;
use crate::config::{ExperimentConfig, ReceiverArgs};
use crate::connection::{drive, ConnectionManager, ExperimentState, Progress};
use crate::error::ExperimentError;
use crate::exchange;
use crate::samples::LatencyTrace;
use crate::scheduler::{self, ReadPlan, SignalPolicy};
use dram_utils::affinity::pin_or_warn;
use dram_utils::clock::Clock;
use log::info;
use rdma_channel::Transport;
use std::io::Write;
use std::ops::ControlFlow;
use std::thread;

/// Connect, receive the receiver region, sample read latencies and write them to `out`.
///
/// One read target per connection. Returns `None` when the intermediary disconnects first.
pub fn run<T, C, W>(
    transport: &mut T,
    args: &ReceiverArgs,
    config: &ExperimentConfig,
    clock: &C,
    out: &mut W,
) -> Result<Option<LatencyTrace>, ExperimentError>
where
    T: Transport,
    C: Clock + Clone + 'static,
    W: Write,
{
    pin_or_warn(config.measurement_core, "receiver");
    let mut manager = ConnectionManager::client(&args.host, 1, config);
    let mut state = ExperimentState::configure(args.qps);
    manager.start(transport, &mut state)?;

    let mut trace = None;
    drive(transport, &mut manager, &mut state, |transport, state, progress| {
        match progress {
            Progress::HandshakeComplete { .. } => {
                trace = Some(measure(transport, state, args, config, clock)?);
                Ok(ControlFlow::Break(()))
            }
            Progress::Disconnected { .. } => Ok(ControlFlow::Break(())),
            _ => Ok(ControlFlow::Continue(())),
        }
    })?;
    let Some(trace) = trace else {
        return stopped_early(&state).map(|()| None);
    };

    trace.write_lines(out)?;
    match trace.summary(config.summary_warmup) {
        Some(s) => info!(
            "{} samples after warm-up: mean {:.2} ns, min {:.2} ns, max {:.2} ns",
            s.count, s.mean, s.min, s.max
        ),
        None => info!("no sample left after {} warm-up samples", config.summary_warmup),
    }
    if let Some(path) = &config.trace_path {
        trace.write_msgpack_zstd(path)?;
        info!("trace written to {}", path.display());
    }
    Ok(Some(trace))
}

fn measure<T, C>(
    transport: &T,
    state: &ExperimentState<T>,
    args: &ReceiverArgs,
    config: &ExperimentConfig,
    clock: &C,
) -> Result<LatencyTrace, ExperimentError>
where
    T: Transport,
    C: Clock + Clone + 'static,
{
    let region = exchange::receive(transport, state.connection(0), config.spin_budget)?;
    info!(
        "received region {:#x}+{:#x} (rkey {:#x})",
        region.addr, region.length, region.rkey
    );
    thread::sleep(config.settle_before_reads);

    let addresses = AddressSelector::new(&config.mapping, config.granularity).select(
        &mut config.rng(),
        region.addr,
        region.length,
        args.qps,
    )?;
    let plan = ReadPlan::build(&state.connections, &addresses, region.rkey, SignalPolicy::Every)?;
    thread::sleep(config.settle_before_sampling);

    info!("sampling {} reads", config.samples);
    scheduler::sample(
        transport,
        &plan,
        clock,
        config.samples,
        config.probe_wait_ns(),
        config.poller_core,
        config.spin_budget,
    )
}
