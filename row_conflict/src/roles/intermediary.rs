use super::stopped_early;
use crate::config::{ExperimentConfig, IntermediaryArgs};
use crate::connection::{drive, ConnectionManager, ExperimentState, Progress};
use crate::error::ExperimentError;
use crate::exchange;
use dram_utils::affinity::pin_or_warn;
use dram_utils::mmap::{MMappedMemory, PageSize};
use dram_utils::thrash_cache;
use log::info;
use rdma_channel::{CmId, MemoryRegistration, RegionDescriptor, Transport};
use std::ops::ControlFlow;
use std::thread;

/// Memory the peers read from. The registration is released before the mapping.
struct HostedRegion<T: Transport> {
    registration: T::Registration,
    _memory: MMappedMemory,
}

impl<T: Transport> HostedRegion<T> {
    fn new(
        transport: &mut T,
        id: CmId,
        size: usize,
        pages: PageSize,
    ) -> Result<Self, ExperimentError> {
        let memory = MMappedMemory::new(size, pages)?;
        // SAFETY: the mapping is only unmapped after the registration is dropped.
        let registration = unsafe { transport.register(id, memory.as_ptr(), memory.len()) }?;
        Ok(HostedRegion {
            registration,
            _memory: memory,
        })
    }

    fn descriptor(&self) -> RegionDescriptor {
        self.registration.descriptor()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntermediaryReport {
    pub port: u16,
    pub sender_region: RegionDescriptor,
    pub receiver_region: RegionDescriptor,
}

/// Host one region for each client, publish it once all its connections are up, then keep the
/// regions alive for the service period.
///
/// Sender connections are expected first: the first `sender_qps` accepted connections are the
/// Sender's. Returns `None` when a peer disconnects before the exchanges are done.
pub fn run<T: Transport>(
    transport: &mut T,
    args: &IntermediaryArgs,
    config: &ExperimentConfig,
) -> Result<Option<IntermediaryReport>, ExperimentError> {
    pin_or_warn(config.measurement_core, "intermediary");
    let sender_slot = 0;
    let receiver_slot = args.sender_qps;
    let mut manager = ConnectionManager::server(vec![sender_slot, receiver_slot], config);
    let mut state = ExperimentState::configure(args.total_qps());
    manager.start(transport, &mut state)?;
    let port = manager.port();

    let mut hosted: Vec<HostedRegion<T>> = Vec::with_capacity(2);
    drive(transport, &mut manager, &mut state, |transport, state, progress| {
        match progress {
            Progress::Connected { connected, .. } if connected == args.sender_qps => {
                let size = config.region_size(args.sender_unique_addresses());
                let region = host_and_publish(transport, state, sender_slot, size, config)?;
                info!(
                    "sender region of {} bytes published on qp {}",
                    region.descriptor().length,
                    sender_slot
                );
                hosted.push(region);
                Ok(ControlFlow::Continue(()))
            }
            Progress::HandshakeComplete { .. } => {
                thrash_cache(config.thrash_size);
                let size = config.region_size(args.receiver_addresses());
                let region = host_and_publish(transport, state, receiver_slot, size, config)?;
                info!(
                    "receiver region of {} bytes published on qp {}",
                    region.descriptor().length,
                    receiver_slot
                );
                hosted.push(region);
                info!("serving for {:?}", config.service_period);
                thread::sleep(config.service_period);
                info!("service period over");
                Ok(ControlFlow::Break(()))
            }
            Progress::Disconnected { .. } => Ok(ControlFlow::Break(())),
            _ => Ok(ControlFlow::Continue(())),
        }
    })?;

    match hosted.as_slice() {
        [sender, receiver] => Ok(Some(IntermediaryReport {
            port,
            sender_region: sender.descriptor(),
            receiver_region: receiver.descriptor(),
        })),
        _ => stopped_early(&state).map(|()| None),
    }
}

fn host_and_publish<T: Transport>(
    transport: &mut T,
    state: &mut ExperimentState<T>,
    slot: usize,
    size: usize,
    config: &ExperimentConfig,
) -> Result<HostedRegion<T>, ExperimentError> {
    let id = state.connection(slot).id;
    let region = HostedRegion::new(transport, id, size, config.pages)?;
    exchange::publish(
        transport,
        &mut state.connections[slot],
        &region.descriptor(),
        config.spin_budget,
    )?;
    Ok(region)
}
