//! Role Drivers: the Intermediary hosts the memory, the Sender modulates row conflicts into it
//! and the Receiver times reads that collide with them.

pub mod intermediary;
pub mod receiver;
pub mod sender;

use crate::connection::{ConnectionState, ExperimentState};
use crate::error::ExperimentError;
use log::info;
use rdma_channel::Transport;

/// Sort out why an event loop returned before the role did its work: a disconnected peer is a
/// normal stop, a closed event channel is not.
fn stopped_early<T: Transport>(state: &ExperimentState<T>) -> Result<(), ExperimentError> {
    if state
        .connections
        .iter()
        .any(|c| c.state() == ConnectionState::Disconnected)
    {
        info!("peer disconnected, stopping");
        Ok(())
    } else {
        Err(ExperimentError::EventChannelClosed)
    }
}
