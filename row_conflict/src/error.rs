use crate::config::ConfigError;
use crate::connection::ConnectionState;
use dram_utils::mmap::MmapError;
use rdma_channel::{CmEventKind, CmId, TransportError, WcOpcode, WcStatus};
use spin_gate::SpinTimeout;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Mmap(#[from] MmapError),
    #[error(transparent)]
    Spin(#[from] SpinTimeout),
    #[error("unexpected {kind:?} event on connection {id:?} in state {state:?}")]
    UnexpectedEvent {
        id: CmId,
        kind: CmEventKind,
        state: Option<ConnectionState>,
    },
    #[error("event for unknown connection {0:?}")]
    UnknownConnection(CmId),
    #[error("connection request beyond the quota of {quota} connections")]
    QuotaExceeded { quota: usize },
    #[error("connection {0} has no exchange buffer")]
    NoExchangeBuffer(usize),
    #[error("work request {wr_id} completed with {status:?} ({opcode:?})")]
    CompletionFailed {
        wr_id: u64,
        status: WcStatus,
        opcode: WcOpcode,
    },
    #[error("completion for unknown work request {0}")]
    UnknownWorkRequest(u64),
    #[error("region of {length} bytes cannot hold a {granularity} byte granule")]
    RegionTooSmall { length: u64, granularity: u64 },
    #[error("{needed} read addresses needed, {available} selected")]
    NotEnoughAddresses { needed: usize, available: usize },
    #[error("the completion poller thread panicked")]
    PollerPanicked,
    #[error("event channel closed before the experiment finished")]
    EventChannelClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("trace encoding failed: {0}")]
    TraceEncode(#[from] rmp_serde::encode::Error),
    #[error("trace decoding failed: {0}")]
    TraceDecode(#[from] rmp_serde::decode::Error),
}
