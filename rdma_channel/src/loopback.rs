//! In-process fabric: every endpoint lives in the same address space, one-sided reads and
//! sends are plain memory copies and connection events are delivered through per endpoint
//! queues. Used to run the three roles against each other without RDMA hardware.

use crate::{
    CmEvent, CmEventKind, CmId, Completion, CompletionQueue, ConnParams, LocalBuffer,
    MemoryRegistration, ReadRequest, RegionDescriptor, Transport, TransportError, WcOpcode,
    WcStatus,
};
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

const EPHEMERAL_PORT_BASE: u16 = 50000;
const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct EventQueue {
    events: Mutex<VecDeque<CmEvent>>,
    available: Condvar,
}

impl EventQueue {
    fn push(&self, event: CmEvent) {
        lock(&self.events).push_back(event);
        self.available.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Result<CmEvent, TransportError> {
        let guard = lock(&self.events);
        let (mut guard, _) = self
            .available
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        guard.pop_front().ok_or(TransportError::Timeout(timeout))
    }
}

type SharedCq = Arc<Mutex<VecDeque<Completion>>>;

struct Endpoint {
    events: Arc<EventQueue>,
    cq: SharedCq,
}

struct IdRecord {
    endpoint: usize,
    target_port: Option<u16>,
    peer: Option<CmId>,
    has_qp: bool,
    connected: bool,
    recvs: VecDeque<(u64, LocalBuffer)>,
}

impl IdRecord {
    fn new(endpoint: usize) -> Self {
        IdRecord {
            endpoint,
            target_port: None,
            peer: None,
            has_qp: false,
            connected: false,
            recvs: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct FabricState {
    next_id: u64,
    next_key: u32,
    next_port: u16,
    endpoints: Vec<Endpoint>,
    listeners: HashMap<u16, usize>,
    ids: HashMap<CmId, IdRecord>,
    regions: HashMap<u32, RegionDescriptor>,
    established: usize,
}

impl FabricState {
    fn record(&self, id: CmId) -> Result<&IdRecord, TransportError> {
        self.ids.get(&id).ok_or(TransportError::UnknownId(id))
    }

    fn record_mut(&mut self, id: CmId) -> Result<&mut IdRecord, TransportError> {
        self.ids.get_mut(&id).ok_or(TransportError::UnknownId(id))
    }

    fn new_id(&mut self, endpoint: usize) -> CmId {
        self.next_id += 1;
        let id = CmId(self.next_id);
        self.ids.insert(id, IdRecord::new(endpoint));
        id
    }

    fn notify(&self, id: CmId, kind: CmEventKind) -> Result<(), TransportError> {
        let endpoint = self.record(id)?.endpoint;
        self.endpoints[endpoint].events.push(CmEvent { id, kind });
        Ok(())
    }

    fn complete(&self, id: CmId, completion: Completion) -> Result<(), TransportError> {
        let endpoint = self.record(id)?.endpoint;
        lock(&self.endpoints[endpoint].cq).push_back(completion);
        Ok(())
    }

    fn connected_peer(&self, id: CmId) -> Result<CmId, TransportError> {
        let record = self.record(id)?;
        match record.peer {
            Some(peer) if record.connected => Ok(peer),
            _ => Err(TransportError::NotConnected(id)),
        }
    }

    /// Whether `buffer` lies inside the region registered under its local key.
    fn local_is_registered(&self, buffer: &LocalBuffer) -> bool {
        self.regions
            .get(&buffer.lkey)
            .is_some_and(|r| r.contains(buffer.addr, buffer.length as u64))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared medium all loopback endpoints attach to.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new endpoint, with its own event channel and completion queue.
    pub fn endpoint(&self) -> LoopbackTransport {
        let mut state = lock(&self.state);
        let cq: SharedCq = Arc::default();
        let events: Arc<EventQueue> = Arc::default();
        state.endpoints.push(Endpoint {
            events: events.clone(),
            cq: cq.clone(),
        });
        LoopbackTransport {
            state: self.state.clone(),
            endpoint: state.endpoints.len() - 1,
            events,
            cq,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
        }
    }

    /// Number of connections that reached the established state so far.
    pub fn established(&self) -> usize {
        lock(&self.state).established
    }

    pub fn listening(&self, port: u16) -> bool {
        lock(&self.state).listeners.contains_key(&port)
    }

    /// Number of live memory registrations.
    pub fn registered_regions(&self) -> usize {
        lock(&self.state).regions.len()
    }
}

pub struct LoopbackTransport {
    state: Arc<Mutex<FabricState>>,
    endpoint: usize,
    events: Arc<EventQueue>,
    cq: SharedCq,
    event_timeout: Duration,
}

impl LoopbackTransport {
    /// How long `next_event` blocks before failing with a timeout.
    pub fn set_event_timeout(&mut self, timeout: Duration) {
        self.event_timeout = timeout;
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        lock(&self.state)
    }
}

pub struct LoopbackRegistration {
    state: Arc<Mutex<FabricState>>,
    descriptor: RegionDescriptor,
}

impl MemoryRegistration for LoopbackRegistration {
    fn descriptor(&self) -> RegionDescriptor {
        self.descriptor
    }
}

impl Drop for LoopbackRegistration {
    fn drop(&mut self) {
        lock(&self.state).regions.remove(&self.descriptor.rkey);
    }
}

#[derive(Clone)]
pub struct LoopbackCq {
    queue: SharedCq,
}

impl CompletionQueue for LoopbackCq {
    fn poll(&self, out: &mut [Completion]) -> Result<usize, TransportError> {
        let mut queue = lock(&self.queue);
        let n = out.len().min(queue.len());
        for (slot, completion) in out.iter_mut().zip(queue.drain(..n)) {
            *slot = completion;
        }
        Ok(n)
    }
}

impl Transport for LoopbackTransport {
    type Registration = LoopbackRegistration;
    type Cq = LoopbackCq;

    fn listen(&mut self, port: u16) -> Result<u16, TransportError> {
        let endpoint = self.endpoint;
        let mut state = self.state();
        let port = if port == 0 {
            state.next_port += 1;
            EPHEMERAL_PORT_BASE + state.next_port
        } else {
            port
        };
        if state.listeners.contains_key(&port) {
            return Err(TransportError::Os {
                call: "rdma_bind_addr",
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            });
        }
        state.listeners.insert(port, endpoint);
        debug!("loopback endpoint {} listening on port {}", endpoint, port);
        Ok(port)
    }

    fn create_id(&mut self) -> Result<CmId, TransportError> {
        let endpoint = self.endpoint;
        Ok(self.state().new_id(endpoint))
    }

    fn resolve_addr(
        &mut self,
        id: CmId,
        host: &str,
        port: u16,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if host.is_empty() {
            return Err(TransportError::Resolve(format!(":{}", port)));
        }
        let mut state = self.state();
        state.record_mut(id)?.target_port = Some(port);
        state.notify(id, CmEventKind::AddrResolved)
    }

    fn resolve_route(&mut self, id: CmId, _timeout: Duration) -> Result<(), TransportError> {
        let state = self.state();
        if state.record(id)?.target_port.is_none() {
            return Err(TransportError::Resolve(format!("route of {:?}", id)));
        }
        state.notify(id, CmEventKind::RouteResolved)
    }

    fn create_qp(&mut self, id: CmId) -> Result<(), TransportError> {
        self.state().record_mut(id)?.has_qp = true;
        Ok(())
    }

    fn connect(&mut self, id: CmId, _params: &ConnParams) -> Result<(), TransportError> {
        let mut state = self.state();
        let record = state.record(id)?;
        if !record.has_qp {
            return Err(TransportError::NoQueuePair(id));
        }
        let port = record
            .target_port
            .ok_or_else(|| TransportError::Resolve(format!("address of {:?}", id)))?;
        let listener = *state.listeners.get(&port).ok_or_else(|| TransportError::Os {
            call: "rdma_connect",
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        })?;
        let server_id = state.new_id(listener);
        state.record_mut(server_id)?.peer = Some(id);
        state.record_mut(id)?.peer = Some(server_id);
        trace!("{:?} requests a connection, server side {:?}", id, server_id);
        state.notify(server_id, CmEventKind::ConnectRequest)
    }

    fn accept(&mut self, id: CmId, _params: &ConnParams) -> Result<(), TransportError> {
        let mut state = self.state();
        let record = state.record(id)?;
        if !record.has_qp {
            return Err(TransportError::NoQueuePair(id));
        }
        let peer = record.peer.ok_or(TransportError::NotConnected(id))?;
        state.record_mut(id)?.connected = true;
        state.record_mut(peer)?.connected = true;
        state.established += 1;
        state.notify(id, CmEventKind::Established)?;
        state.notify(peer, CmEventKind::Established)
    }

    fn disconnect(&mut self, id: CmId) -> Result<(), TransportError> {
        let mut state = self.state();
        let Ok(peer) = state.connected_peer(id) else {
            return Ok(());
        };
        state.record_mut(id)?.connected = false;
        state.record_mut(peer)?.connected = false;
        state.notify(id, CmEventKind::Disconnected)?;
        state.notify(peer, CmEventKind::Disconnected)
    }

    fn next_event(&mut self) -> Result<Option<CmEvent>, TransportError> {
        self.events.pop(self.event_timeout).map(Some)
    }

    unsafe fn register(
        &mut self,
        id: CmId,
        addr: *mut u8,
        length: usize,
    ) -> Result<LoopbackRegistration, TransportError> {
        let mut state = self.state();
        state.record(id)?;
        state.next_key += 1;
        let descriptor = RegionDescriptor {
            addr: addr as u64,
            length: length as u64,
            rkey: state.next_key,
            lkey: state.next_key,
        };
        state.regions.insert(descriptor.rkey, descriptor);
        Ok(LoopbackRegistration {
            state: self.state.clone(),
            descriptor,
        })
    }

    fn post_recv(
        &mut self,
        id: CmId,
        wr_id: u64,
        buffer: LocalBuffer,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.local_is_registered(&buffer) {
            return Err(TransportError::UnknownKey(buffer.lkey));
        }
        state.record_mut(id)?.recvs.push_back((wr_id, buffer));
        Ok(())
    }

    fn post_send(&self, id: CmId, wr_id: u64, buffer: LocalBuffer) -> Result<(), TransportError> {
        let mut state = self.state();
        let peer = state.connected_peer(id)?;
        let mut send = Completion {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: buffer.length,
        };
        if !state.local_is_registered(&buffer) {
            send.status = WcStatus::LocalProtectionError;
            return state.complete(id, send);
        }
        let Some((recv_id, target)) = state.record_mut(peer)?.recvs.pop_front() else {
            send.status = WcStatus::RnrRetryExceeded;
            return state.complete(id, send);
        };
        if !state.local_is_registered(&target) {
            state.complete(
                peer,
                Completion {
                    wr_id: recv_id,
                    status: WcStatus::LocalProtectionError,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                },
            )?;
            send.status = WcStatus::RemoteAccessError;
            return state.complete(id, send);
        }
        let len = buffer.length.min(target.length);
        unsafe {
            std::ptr::copy(
                buffer.addr as *const u8,
                target.addr as *mut u8,
                len as usize,
            );
        }
        state.complete(
            peer,
            Completion {
                wr_id: recv_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Recv,
                byte_len: len,
            },
        )?;
        state.complete(id, send)
    }

    fn post_reads(&self, id: CmId, reads: &[ReadRequest]) -> Result<(), TransportError> {
        let state = self.state();
        state.connected_peer(id)?;
        for read in reads {
            let len = read.local.length as u64;
            let status = match state.regions.get(&read.rkey) {
                Some(region) if region.contains(read.remote_addr, len) => {
                    if state.local_is_registered(&read.local) {
                        WcStatus::Success
                    } else {
                        WcStatus::LocalProtectionError
                    }
                }
                _ => WcStatus::RemoteAccessError,
            };
            if status == WcStatus::Success {
                unsafe {
                    std::ptr::copy(
                        read.remote_addr as *const u8,
                        read.local.addr as *mut u8,
                        len as usize,
                    );
                }
            }
            // Failed requests complete even when unsignaled.
            if read.signaled || status != WcStatus::Success {
                state.complete(
                    id,
                    Completion {
                        wr_id: read.wr_id,
                        status,
                        opcode: WcOpcode::RdmaRead,
                        byte_len: read.local.length,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn completion_queue(&self) -> LoopbackCq {
        LoopbackCq {
            queue: self.cq.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LoopbackFabric;
    use crate::{
        CmEventKind, CmId, Completion, CompletionQueue, ConnParams, MemoryRegistration,
        PinnedBuffer, ReadRequest, Transport, WcOpcode, WcStatus,
    };
    use std::time::Duration;

    const T: Duration = Duration::from_secs(1);

    fn next_kind<Tr: Transport>(t: &mut Tr) -> (CmId, CmEventKind) {
        let e = t.next_event().unwrap().unwrap();
        (e.id, e.kind)
    }

    fn connected_pair() -> (
        LoopbackFabric,
        super::LoopbackTransport,
        CmId,
        super::LoopbackTransport,
        CmId,
    ) {
        let fabric = LoopbackFabric::new();
        let mut server = fabric.endpoint();
        let mut client = fabric.endpoint();
        let port = server.listen(0).unwrap();

        let c = client.create_id().unwrap();
        client.resolve_addr(c, "localhost", port, T).unwrap();
        assert_eq!(next_kind(&mut client), (c, CmEventKind::AddrResolved));
        client.resolve_route(c, T).unwrap();
        assert_eq!(next_kind(&mut client), (c, CmEventKind::RouteResolved));
        client.create_qp(c).unwrap();
        client.connect(c, &ConnParams::default()).unwrap();

        let (s, kind) = next_kind(&mut server);
        assert_eq!(kind, CmEventKind::ConnectRequest);
        server.create_qp(s).unwrap();
        server.accept(s, &ConnParams::default()).unwrap();
        assert_eq!(next_kind(&mut server), (s, CmEventKind::Established));
        assert_eq!(next_kind(&mut client), (c, CmEventKind::Established));
        assert_eq!(fabric.established(), 1);
        (fabric, server, s, client, c)
    }

    fn drain<Q: CompletionQueue>(cq: &Q) -> Vec<Completion> {
        let mut out = [Completion::default(); 16];
        let n = cq.poll(&mut out).unwrap();
        out[..n].to_vec()
    }

    #[test]
    fn send_lands_in_posted_receive() {
        let (_f, mut server, s, mut client, c) = connected_pair();
        let mut rx = PinnedBuffer::new(32);
        let rx_reg = unsafe { client.register(c, rx.as_ptr(), rx.len()) }.unwrap();
        client.post_recv(c, 0, rx_reg.local()).unwrap();

        let mut tx = PinnedBuffer::new(32);
        tx.as_mut_slice()[..4].copy_from_slice(b"ping");
        let tx_reg = unsafe { server.register(s, tx.as_ptr(), tx.len()) }.unwrap();
        server.post_send(s, 9, tx_reg.local()).unwrap();

        let sent = drain(&server.completion_queue());
        assert_eq!(sent.len(), 1);
        assert_eq!((sent[0].wr_id, sent[0].opcode), (9, WcOpcode::Send));
        let received = drain(&client.completion_queue());
        assert_eq!(received[0].opcode, WcOpcode::Recv);
        assert_eq!(received[0].byte_len, 32);
        assert_eq!(&rx.as_mut_slice()[..4], b"ping");
    }

    #[test]
    fn send_without_receive_fails() {
        let (_f, mut server, s, _client, _c) = connected_pair();
        let tx = PinnedBuffer::new(8);
        let tx_reg = unsafe { server.register(s, tx.as_ptr(), tx.len()) }.unwrap();
        server.post_send(s, 1, tx_reg.local()).unwrap();
        let sent = drain(&server.completion_queue());
        assert_eq!(sent[0].status, WcStatus::RnrRetryExceeded);
    }

    #[test]
    fn only_signaled_reads_complete() {
        let (fabric, mut server, s, mut client, c) = connected_pair();
        let mut remote = PinnedBuffer::new(4096);
        remote.as_mut_slice()[128] = 0xaa;
        let remote_reg = unsafe { server.register(s, remote.as_ptr(), remote.len()) }.unwrap();
        let d = remote_reg.descriptor();

        let local = PinnedBuffer::new(64);
        let local_reg = unsafe { client.register(c, local.as_ptr(), local.len()) }.unwrap();
        let read = |wr_id: u64, offset: u64, signaled: bool| ReadRequest {
            wr_id,
            remote_addr: d.addr + offset,
            rkey: d.rkey,
            local: local_reg.local(),
            signaled,
        };
        client
            .post_reads(c, &[read(0, 0, false), read(1, 128, true)])
            .unwrap();
        let done = drain(&client.completion_queue());
        assert_eq!(done.len(), 1);
        assert_eq!((done[0].wr_id, done[0].status), (1, WcStatus::Success));
        assert_eq!(local.as_slice()[0], 0xaa);

        client.post_reads(c, &[read(2, 4096, false)]).unwrap();
        let done = drain(&client.completion_queue());
        assert_eq!(done[0].status, WcStatus::RemoteAccessError);

        assert_eq!(fabric.registered_regions(), 2);
        drop(remote_reg);
        assert_eq!(fabric.registered_regions(), 1);
    }

    #[test]
    fn disconnect_notifies_both_sides() {
        let (_f, mut server, s, mut client, c) = connected_pair();
        client.disconnect(c).unwrap();
        assert_eq!(next_kind(&mut client), (c, CmEventKind::Disconnected));
        assert_eq!(next_kind(&mut server), (s, CmEventKind::Disconnected));
        assert!(client.post_reads(c, &[]).is_err());
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let fabric = LoopbackFabric::new();
        let mut client = fabric.endpoint();
        client.set_event_timeout(Duration::from_millis(10));
        let c = client.create_id().unwrap();
        client.resolve_addr(c, "localhost", 1, T).unwrap();
        client.create_qp(c).unwrap();
        assert!(client.connect(c, &ConnParams::default()).is_err());
        assert_eq!(next_kind(&mut client).1, CmEventKind::AddrResolved);
        assert!(client.next_event().is_err());
    }
}
