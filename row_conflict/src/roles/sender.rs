use super::stopped_early;
use crate::address_selector::AddressSelector;
use crate::config::{ExperimentConfig, SenderArgs};
use crate::connection::{drive, ConnectionManager, ExperimentState, Progress};
use crate::error::ExperimentError;
use crate::exchange;
use crate::scheduler::{ModulationReport, Pacer, ReadPlan, SignalPolicy};
use dram_utils::affinity::pin_or_warn;
use dram_utils::clock::Clock;
use log::info;
use rdma_channel::{RegionDescriptor, Transport};
use std::ops::ControlFlow;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenderReport {
    pub region: RegionDescriptor,
    pub period_ns: f64,
    pub modulation: ModulationReport,
    /// Read completions seen over tuning and modulation.
    pub completions: u64,
}

/// Connect, receive the sender region, tune the burst period and modulate the message.
///
/// Returns `None` when the intermediary disconnects first.
pub fn run<T: Transport, C: Clock>(
    transport: &mut T,
    args: &SenderArgs,
    config: &ExperimentConfig,
    clock: &C,
) -> Result<Option<SenderReport>, ExperimentError> {
    pin_or_warn(config.measurement_core, "sender");
    let mut manager = ConnectionManager::client(&args.host, args.reads_per_qp, config);
    let mut state = ExperimentState::configure(args.qps);
    manager.start(transport, &mut state)?;

    let mut report = None;
    drive(transport, &mut manager, &mut state, |transport, state, progress| {
        match progress {
            Progress::HandshakeComplete { .. } => {
                report = Some(transmit(transport, state, args, config, clock)?);
                Ok(ControlFlow::Break(()))
            }
            Progress::Disconnected { .. } => Ok(ControlFlow::Break(())),
            _ => Ok(ControlFlow::Continue(())),
        }
    })?;
    match report {
        Some(report) => Ok(Some(report)),
        None => stopped_early(&state).map(|()| None),
    }
}

fn transmit<T: Transport, C: Clock>(
    transport: &T,
    state: &ExperimentState<T>,
    args: &SenderArgs,
    config: &ExperimentConfig,
    clock: &C,
) -> Result<SenderReport, ExperimentError> {
    let region = exchange::receive(transport, state.connection(0), config.spin_budget)?;
    info!(
        "received region {:#x}+{:#x} (rkey {:#x})",
        region.addr, region.length, region.rkey
    );
    thread::sleep(config.sender_settle);

    let addresses = AddressSelector::new(&config.mapping, config.granularity).select_repeating(
        &mut config.rng(),
        region.addr,
        region.length,
        args.unique_addresses(),
        args.total_reads(),
    )?;
    let plan = ReadPlan::build(
        &state.connections,
        &addresses,
        region.rkey,
        SignalPolicy::LastOnly,
    )?;

    let mut pacer = Pacer::new(
        transport,
        &plan,
        clock,
        config.poller_core,
        config.spin_budget,
    );
    let period_ns = pacer.calibrate(config.tuning_trials, config.tuning_warmup)?;
    info!("Period is {:.2} ns", period_ns);
    let modulation = pacer.modulate(
        config.message,
        config.message_bits,
        period_ns as u64,
        config.modulation_duration,
    )?;
    let completions = pacer.finish()?;
    Ok(SenderReport {
        region,
        period_ns,
        modulation,
        completions,
    })
}
