//! Connection Manager: drives the per connection rdma-cm state machine of one role.
//!
//! Clients open their connections one after the other, the next one is only started once the
//! previous one is established. The server accepts every request up to its quota. Either way
//! the manager reports handshake completion exactly once, when the configured number of
//! connections is established.

use crate::config::ExperimentConfig;
use crate::error::ExperimentError;
use crate::exchange;
use log::{debug, info};
use rdma_channel::{
    CmEvent, CmEventKind, CmId, ConnParams, LocalBuffer, MemoryRegistration, PinnedBuffer,
    Transport, DESCRIPTOR_SIZE,
};
use spin_gate::ReadyFlag;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    AddrResolved,
    RouteResolved,
    Connected,
    Disconnected,
}

/// A registered buffer. The registration is declared first so it is released before the memory.
struct Registered<T: Transport> {
    registration: T::Registration,
    buffer: PinnedBuffer,
}

impl<T: Transport> Registered<T> {
    fn new(transport: &mut T, id: CmId, len: usize) -> Result<Self, ExperimentError> {
        let buffer = PinnedBuffer::new(len);
        // SAFETY: the buffer is heap allocated, never moves, and outlives the registration.
        let registration = unsafe { transport.register(id, buffer.as_ptr(), buffer.len()) }?;
        Ok(Registered {
            registration,
            buffer,
        })
    }
}

pub struct Connection<T: Transport> {
    pub index: usize,
    pub id: CmId,
    state: ConnectionState,
    connected: ReadyFlag,
    exchange: Option<Registered<T>>,
    read_targets: Vec<Registered<T>>,
}

impl<T: Transport> Connection<T> {
    fn new(index: usize, id: CmId) -> Self {
        Connection {
            index,
            id,
            state: ConnectionState::Init,
            connected: ReadyFlag::new(),
            exchange: None,
            read_targets: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected_flag(&self) -> &ReadyFlag {
        &self.connected
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_set()
    }

    /// Register the buffer the Region Descriptor travels through.
    pub fn register_exchange(&mut self, transport: &mut T) -> Result<(), ExperimentError> {
        if self.exchange.is_none() {
            self.exchange = Some(Registered::new(transport, self.id, DESCRIPTOR_SIZE)?);
        }
        Ok(())
    }

    pub fn exchange_buffer(&self) -> Option<LocalBuffer> {
        self.exchange.as_ref().map(|e| e.registration.local())
    }

    pub fn exchange_bytes(&self) -> Option<&[u8]> {
        self.exchange.as_ref().map(|e| e.buffer.as_slice())
    }

    pub(crate) fn exchange_bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.exchange.as_mut().map(|e| e.buffer.as_mut_slice())
    }

    /// Register `count` zeroed buffers of `size` bytes, the local side of this connection's reads.
    pub fn register_read_targets(
        &mut self,
        transport: &mut T,
        count: usize,
        size: u32,
    ) -> Result<(), ExperimentError> {
        for _ in 0..count {
            let target = Registered::new(transport, self.id, size as usize)?;
            self.read_targets.push(target);
        }
        Ok(())
    }

    pub fn read_targets(&self) -> impl Iterator<Item = LocalBuffer> + '_ {
        self.read_targets.iter().map(|t| t.registration.local())
    }

    pub fn read_target_count(&self) -> usize {
        self.read_targets.len()
    }

    pub fn read_target_bytes(&self, i: usize) -> &[u8] {
        self.read_targets[i].buffer.as_slice()
    }
}

/// Per-process progress counters, only touched by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleState {
    pub connected: usize,
    pub target: usize,
    handshake_fired: bool,
}

impl RoleState {
    pub fn handshake_complete(&self) -> bool {
        self.handshake_fired
    }
}

pub struct ExperimentState<T: Transport> {
    pub connections: Vec<Connection<T>>,
    pub role: RoleState,
    slots: HashMap<CmId, usize>,
}

impl<T: Transport> ExperimentState<T> {
    /// Room for `total` connections, none created yet.
    pub fn configure(total: usize) -> Self {
        ExperimentState {
            connections: Vec::with_capacity(total),
            role: RoleState {
                connected: 0,
                target: total,
                handshake_fired: false,
            },
            slots: HashMap::with_capacity(total),
        }
    }

    fn add(&mut self, id: CmId) -> usize {
        let index = self.connections.len();
        self.connections.push(Connection::new(index, id));
        self.slots.insert(id, index);
        index
    }

    pub fn slot(&self, id: CmId) -> Option<usize> {
        self.slots.get(&id).copied()
    }

    pub fn connection(&self, index: usize) -> &Connection<T> {
        &self.connections[index]
    }
}

/// What an event changed, as far as the role driver is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Connected { index: usize, connected: usize },
    HandshakeComplete { index: usize },
    Disconnected { index: usize },
}

#[derive(Debug, Clone)]
enum Side {
    Client {
        host: String,
        port: u16,
        reads_per_qp: usize,
        read_size: u32,
    },
    Server {
        port: u16,
        /// Connections that carry a Region Descriptor to their peer.
        exchange_slots: Vec<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    side: Side,
    resolve_timeout: Duration,
    params: ConnParams,
}

impl ConnectionManager {
    /// Manager of a client role, every connection gets `reads_per_qp` read targets.
    pub fn client(host: &str, reads_per_qp: usize, config: &ExperimentConfig) -> Self {
        ConnectionManager {
            side: Side::Client {
                host: host.to_owned(),
                port: config.port,
                reads_per_qp,
                read_size: config.read_size,
            },
            resolve_timeout: config.resolve_timeout,
            params: config.conn_params,
        }
    }

    pub fn server(exchange_slots: Vec<usize>, config: &ExperimentConfig) -> Self {
        ConnectionManager {
            side: Side::Server {
                port: config.port,
                exchange_slots,
            },
            resolve_timeout: config.resolve_timeout,
            params: config.conn_params,
        }
    }

    /// Open the first connection (client) or start listening (server).
    pub fn start<T: Transport>(
        &mut self,
        transport: &mut T,
        state: &mut ExperimentState<T>,
    ) -> Result<(), ExperimentError> {
        if let Side::Server { port, .. } = &mut self.side {
            let bound = transport.listen(*port)?;
            *port = bound;
            info!("listening on port {}", bound);
            return Ok(());
        }
        self.open_next(transport, state)
    }

    /// Port the server listens on, once started.
    pub fn port(&self) -> u16 {
        match &self.side {
            Side::Client { port, .. } | Side::Server { port, .. } => *port,
        }
    }

    fn open_next<T: Transport>(
        &self,
        transport: &mut T,
        state: &mut ExperimentState<T>,
    ) -> Result<(), ExperimentError> {
        let Side::Client { host, port, .. } = &self.side else {
            return Ok(());
        };
        let id = transport.create_id()?;
        let index = state.add(id);
        debug!("connection {} resolving {}:{}", index, host, port);
        transport.resolve_addr(id, host, *port, self.resolve_timeout)?;
        Ok(())
    }

    pub fn handle_event<T: Transport>(
        &mut self,
        transport: &mut T,
        state: &mut ExperimentState<T>,
        event: CmEvent,
    ) -> Result<Progress, ExperimentError> {
        if let (Side::Server { .. }, CmEventKind::ConnectRequest) = (&self.side, event.kind) {
            return self.on_connect_request(transport, state, event.id);
        }
        let index = state
            .slot(event.id)
            .ok_or(ExperimentError::UnknownConnection(event.id))?;
        let current = state.connections[index].state;
        let unexpected = || ExperimentError::UnexpectedEvent {
            id: event.id,
            kind: event.kind,
            state: Some(current),
        };
        match (&self.side, event.kind, current) {
            (Side::Client { .. }, CmEventKind::AddrResolved, ConnectionState::Init) => {
                state.connections[index].state = ConnectionState::AddrResolved;
                self.on_addr_resolved(transport, state, index)?;
                Ok(Progress::Pending)
            }
            (Side::Client { .. }, CmEventKind::RouteResolved, ConnectionState::AddrResolved) => {
                state.connections[index].state = ConnectionState::RouteResolved;
                transport.connect(event.id, &self.params)?;
                Ok(Progress::Pending)
            }
            (Side::Client { .. }, CmEventKind::Established, ConnectionState::RouteResolved)
            | (Side::Server { .. }, CmEventKind::Established, ConnectionState::Init) => {
                self.on_established(transport, state, index)
            }
            (_, CmEventKind::Disconnected, _) => {
                let connection = &mut state.connections[index];
                connection.state = ConnectionState::Disconnected;
                connection.connected.clear();
                debug!("connection {} disconnected", index);
                Ok(Progress::Disconnected { index })
            }
            _ => Err(unexpected()),
        }
    }

    fn on_addr_resolved<T: Transport>(
        &self,
        transport: &mut T,
        state: &mut ExperimentState<T>,
        index: usize,
    ) -> Result<(), ExperimentError> {
        let Side::Client {
            reads_per_qp,
            read_size,
            ..
        } = &self.side
        else {
            return Ok(());
        };
        let connection = &mut state.connections[index];
        let id = connection.id;
        transport.create_qp(id)?;
        connection.register_read_targets(transport, *reads_per_qp, *read_size)?;
        if index == 0 {
            // The descriptor may be sent as soon as the connection is up, the receive must
            // already be there.
            connection.register_exchange(transport)?;
            exchange::prepost_subscription(transport, connection)?;
        }
        debug!("connection {} address resolved", index);
        transport.resolve_route(id, self.resolve_timeout)?;
        Ok(())
    }

    fn on_connect_request<T: Transport>(
        &self,
        transport: &mut T,
        state: &mut ExperimentState<T>,
        id: CmId,
    ) -> Result<Progress, ExperimentError> {
        let Side::Server { exchange_slots, .. } = &self.side else {
            return Ok(Progress::Pending);
        };
        if state.connections.len() >= state.role.target {
            return Err(ExperimentError::QuotaExceeded {
                quota: state.role.target,
            });
        }
        let index = state.add(id);
        transport.create_qp(id)?;
        if exchange_slots.contains(&index) {
            state.connections[index].register_exchange(transport)?;
        }
        debug!("accepting connection {}", index);
        transport.accept(id, &self.params)?;
        Ok(Progress::Pending)
    }

    fn on_established<T: Transport>(
        &self,
        transport: &mut T,
        state: &mut ExperimentState<T>,
        index: usize,
    ) -> Result<Progress, ExperimentError> {
        let connection = &mut state.connections[index];
        connection.state = ConnectionState::Connected;
        connection.connected.set();
        state.role.connected += 1;
        let connected = state.role.connected;
        info!("connected qp {} ({}/{})", index, connected, state.role.target);

        if connected < state.role.target {
            if let Side::Client { .. } = self.side {
                self.open_next(transport, state)?;
            }
            return Ok(Progress::Connected { index, connected });
        }
        if state.role.handshake_fired {
            return Ok(Progress::Connected { index, connected });
        }
        state.role.handshake_fired = true;
        Ok(Progress::HandshakeComplete { index })
    }
}

/// Run the event loop, handing every change to `hook` until it breaks.
///
/// A closed event channel ends the loop normally.
pub fn drive<T, F>(
    transport: &mut T,
    manager: &mut ConnectionManager,
    state: &mut ExperimentState<T>,
    mut hook: F,
) -> Result<(), ExperimentError>
where
    T: Transport,
    F: FnMut(&mut T, &mut ExperimentState<T>, Progress) -> Result<ControlFlow<()>, ExperimentError>,
{
    while let Some(event) = transport.next_event()? {
        let progress = manager.handle_event(transport, state, event)?;
        if progress == Progress::Pending {
            continue;
        }
        if hook(transport, state, progress)?.is_break() {
            return Ok(());
        }
    }
    Ok(())
}
