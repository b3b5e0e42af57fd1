#![deny(unsafe_op_in_unsafe_fn)]

//! The reliable-connection transport the experiment runs on.
//!
//! The traits only cover what the three roles need: an rdma-cm style event stream to set up
//! connections, memory registration, one-sided reads, a one-shot send/receive pair and a
//! completion queue that can be polled from another thread.

use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

pub mod buffer;
pub mod descriptor;
pub mod loopback;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use buffer::PinnedBuffer;
pub use descriptor::{RegionDescriptor, DESCRIPTOR_SIZE};

/// Opaque identity of one transport connection (an rdma-cm id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    RouteResolved,
    ConnectRequest,
    Established,
    Disconnected,
    /// Anything else the event channel reports, with its raw event number.
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEvent {
    pub id: CmId,
    pub kind: CmEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaRead,
    Recv,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalProtectionError,
    RemoteAccessError,
    RnrRetryExceeded,
    Other(u32),
}

/// One completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

impl Default for Completion {
    fn default() -> Self {
        Completion {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Other(0),
            byte_len: 0,
        }
    }
}

/// Local side of a work request: registered address, length and local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBuffer {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// A one-sided read of `local.length` bytes at `remote_addr` into `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub wr_id: u64,
    pub remote_addr: u64,
    pub rkey: u32,
    pub local: LocalBuffer,
    /// Only signaled requests produce a completion entry.
    pub signaled: bool,
}

/// Connection establishment parameters, shared by connect and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub rnr_retry_count: u8,
}

impl Default for ConnParams {
    fn default() -> Self {
        ConnParams {
            initiator_depth: 16,
            responder_resources: 16,
            rnr_retry_count: 7,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        source: std::io::Error,
    },
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("unknown connection identity {0:?}")]
    UnknownId(CmId),
    #[error("connection {0:?} has no queue pair")]
    NoQueuePair(CmId),
    #[error("connection {0:?} is not connected")]
    NotConnected(CmId),
    #[error("no memory registered under key {0:#x}")]
    UnknownKey(u32),
    #[error("timed out after {0:?} waiting for a connection event")]
    Timeout(Duration),
}

impl TransportError {
    pub fn last_os_error(call: &'static str) -> Self {
        TransportError::Os {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// A registered memory region. Dropping it deregisters the memory.
pub trait MemoryRegistration: Send {
    fn descriptor(&self) -> RegionDescriptor;

    fn local(&self) -> LocalBuffer {
        let d = self.descriptor();
        LocalBuffer {
            addr: d.addr,
            length: d.length as u32,
            lkey: d.lkey,
        }
    }
}

/// Handle on a completion queue, shareable with a polling thread.
pub trait CompletionQueue: Clone + Send + 'static {
    /// Drain up to `out.len()` entries, returns how many were written.
    fn poll(&self, out: &mut [Completion]) -> Result<usize, TransportError>;
}

pub trait Transport {
    type Registration: MemoryRegistration;
    type Cq: CompletionQueue;

    /// Start accepting connection requests, returns the bound port.
    fn listen(&mut self, port: u16) -> Result<u16, TransportError>;

    fn create_id(&mut self) -> Result<CmId, TransportError>;

    fn resolve_addr(
        &mut self,
        id: CmId,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    fn resolve_route(&mut self, id: CmId, timeout: Duration) -> Result<(), TransportError>;

    /// Create the queue pair of a resolved or requested connection.
    fn create_qp(&mut self, id: CmId) -> Result<(), TransportError>;

    fn connect(&mut self, id: CmId, params: &ConnParams) -> Result<(), TransportError>;

    fn accept(&mut self, id: CmId, params: &ConnParams) -> Result<(), TransportError>;

    fn disconnect(&mut self, id: CmId) -> Result<(), TransportError>;

    /// Block for the next connection event, `None` once the event channel is closed.
    fn next_event(&mut self) -> Result<Option<CmEvent>, TransportError>;

    /// Register `length` bytes at `addr` for local write and remote read access.
    ///
    /// # Safety
    ///
    /// The memory must stay valid, and must not move, for as long as the registration lives.
    unsafe fn register(
        &mut self,
        id: CmId,
        addr: *mut u8,
        length: usize,
    ) -> Result<Self::Registration, TransportError>;

    fn post_recv(&mut self, id: CmId, wr_id: u64, buffer: LocalBuffer)
        -> Result<(), TransportError>;

    fn post_send(&self, id: CmId, wr_id: u64, buffer: LocalBuffer) -> Result<(), TransportError>;

    /// Post a chain of one-sided reads on one connection.
    fn post_reads(&self, id: CmId, reads: &[ReadRequest]) -> Result<(), TransportError>;

    fn completion_queue(&self) -> Self::Cq;
}
