//! rdma-cm / ibverbs backend.
//!
//! One event channel per endpoint, TCP port space, RC queue pairs. The protection domain and
//! the completion queue are created on the first queue pair and shared by every connection of
//! the endpoint; they live until the process exits.

use crate::{
    CmEvent, CmEventKind, CmId, Completion, CompletionQueue, ConnParams, LocalBuffer,
    MemoryRegistration, ReadRequest, RegionDescriptor, Transport, TransportError, WcOpcode,
    WcStatus,
};
use log::{debug, warn};
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use rdma_sys::*;
use std::collections::HashMap;
use std::mem::zeroed;
use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::ptr::{null_mut, NonNull};
use std::time::Duration;

/// Queue sizes of the endpoint.
#[derive(Debug, Clone, Copy)]
pub struct VerbsConfig {
    pub cq_depth: i32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub listen_backlog: i32,
}

impl Default for VerbsConfig {
    fn default() -> Self {
        VerbsConfig {
            cq_depth: 1000,
            max_send_wr: 100,
            max_recv_wr: 100,
            listen_backlog: 10,
        }
    }
}

fn check(call: &'static str, ret: i32) -> Result<(), TransportError> {
    if ret == 0 {
        Ok(())
    } else {
        Err(TransportError::last_os_error(call))
    }
}

fn check_errno(call: &'static str, errno: i32) -> Result<(), TransportError> {
    if errno == 0 {
        Ok(())
    } else {
        Err(TransportError::Os {
            call,
            source: std::io::Error::from_raw_os_error(errno),
        })
    }
}

fn non_null<T>(call: &'static str, p: *mut T) -> Result<NonNull<T>, TransportError> {
    NonNull::new(p).ok_or_else(|| TransportError::last_os_error(call))
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

fn event_kind(event: rdma_cm_event_type::Type) -> CmEventKind {
    match event {
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        other => CmEventKind::Other(other as u32),
    }
}

fn wc_status(status: ibv_wc_status::Type) -> WcStatus {
    match status {
        ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
        ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocalProtectionError,
        ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemoteAccessError,
        ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExceeded,
        other => WcStatus::Other(other as u32),
    }
}

fn wc_opcode(opcode: ibv_wc_opcode::Type) -> WcOpcode {
    match opcode {
        ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
        other => WcOpcode::Other(other as u32),
    }
}

fn conn_param(params: &ConnParams) -> rdma_conn_param {
    let mut p: rdma_conn_param = unsafe { zeroed() };
    p.initiator_depth = params.initiator_depth;
    p.responder_resources = params.responder_resources;
    p.rnr_retry_count = params.rnr_retry_count;
    p
}

pub struct VerbsTransport {
    channel: NonNull<rdma_event_channel>,
    listener: Option<NonNull<rdma_cm_id>>,
    ids: HashMap<CmId, NonNull<rdma_cm_id>>,
    pd: *mut ibv_pd,
    cq: *mut ibv_cq,
    config: VerbsConfig,
}

impl VerbsTransport {
    pub fn new(config: VerbsConfig) -> Result<VerbsTransport, TransportError> {
        let channel = non_null("rdma_create_event_channel", unsafe {
            rdma_create_event_channel()
        })?;
        Ok(VerbsTransport {
            channel,
            listener: None,
            ids: HashMap::new(),
            pd: null_mut(),
            cq: null_mut(),
            config,
        })
    }

    fn id(&self, id: CmId) -> Result<*mut rdma_cm_id, TransportError> {
        self.ids
            .get(&id)
            .map(|p| p.as_ptr())
            .ok_or(TransportError::UnknownId(id))
    }

    fn qp(&self, id: CmId) -> Result<*mut ibv_qp, TransportError> {
        let qp = unsafe { (*self.id(id)?).qp };
        if qp.is_null() {
            Err(TransportError::NoQueuePair(id))
        } else {
            Ok(qp)
        }
    }

    fn new_raw_id(&mut self) -> Result<NonNull<rdma_cm_id>, TransportError> {
        let mut id: *mut rdma_cm_id = null_mut();
        check("rdma_create_id", unsafe {
            rdma_create_id(
                self.channel.as_ptr(),
                &mut id,
                null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        })?;
        non_null("rdma_create_id", id)
    }

    /// Protection domain and completion queue, from the device of the first connection.
    fn ensure_context(&mut self, verbs: *mut ibv_context) -> Result<(), TransportError> {
        if !self.pd.is_null() {
            if unsafe { (*self.pd).context } != verbs {
                warn!("connection on a second device, sharing the first protection domain");
            }
            return Ok(());
        }
        self.pd = non_null("ibv_alloc_pd", unsafe { ibv_alloc_pd(verbs) })?.as_ptr();
        self.cq = non_null("ibv_create_cq", unsafe {
            ibv_create_cq(verbs, self.config.cq_depth, null_mut(), null_mut(), 0)
        })?
        .as_ptr();
        debug!("allocated protection domain and a {} entry completion queue", self.config.cq_depth);
        Ok(())
    }
}

impl Drop for VerbsTransport {
    fn drop(&mut self) {
        for (_, id) in self.ids.drain() {
            unsafe {
                if !(*id.as_ptr()).qp.is_null() {
                    rdma_destroy_qp(id.as_ptr());
                }
                rdma_destroy_id(id.as_ptr());
            }
        }
        if let Some(listener) = self.listener.take() {
            unsafe { rdma_destroy_id(listener.as_ptr()) };
        }
        unsafe { rdma_destroy_event_channel(self.channel.as_ptr()) };
    }
}

pub struct VerbsRegistration {
    mr: NonNull<ibv_mr>,
}

unsafe impl Send for VerbsRegistration {}

impl MemoryRegistration for VerbsRegistration {
    fn descriptor(&self) -> RegionDescriptor {
        let mr = unsafe { self.mr.as_ref() };
        RegionDescriptor {
            addr: mr.addr as u64,
            length: mr.length as u64,
            rkey: mr.rkey,
            lkey: mr.lkey,
        }
    }
}

impl Drop for VerbsRegistration {
    fn drop(&mut self) {
        let errno = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if errno != 0 {
            warn!(
                "ibv_dereg_mr failed: {}",
                std::io::Error::from_raw_os_error(errno)
            );
        }
    }
}

#[derive(Clone)]
pub struct VerbsCq {
    cq: *mut ibv_cq,
}

// ibv_poll_cq is thread safe.
unsafe impl Send for VerbsCq {}

const POLL_BATCH: usize = 32;

impl CompletionQueue for VerbsCq {
    fn poll(&self, out: &mut [Completion]) -> Result<usize, TransportError> {
        let mut wc: [ibv_wc; POLL_BATCH] = unsafe { zeroed() };
        let n = out.len().min(POLL_BATCH);
        let r = unsafe { ibv_poll_cq(self.cq, n as i32, wc.as_mut_ptr()) };
        if r < 0 {
            return Err(TransportError::Os {
                call: "ibv_poll_cq",
                source: std::io::Error::from_raw_os_error(-r),
            });
        }
        let r = r as usize;
        for (slot, wc) in out.iter_mut().zip(&wc[..r]) {
            *slot = Completion {
                wr_id: wc.wr_id,
                status: wc_status(wc.status),
                opcode: wc_opcode(wc.opcode),
                byte_len: wc.byte_len,
            };
        }
        Ok(r)
    }
}

impl Transport for VerbsTransport {
    type Registration = VerbsRegistration;
    type Cq = VerbsCq;

    fn listen(&mut self, port: u16) -> Result<u16, TransportError> {
        let listener = self.new_raw_id()?;
        let addr = SockaddrStorage::from(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)));
        check("rdma_bind_addr", unsafe {
            rdma_bind_addr(listener.as_ptr(), addr.as_ptr() as *mut _)
        })?;
        check("rdma_listen", unsafe {
            rdma_listen(listener.as_ptr(), self.config.listen_backlog)
        })?;
        self.listener = Some(listener);
        Ok(u16::from_be(unsafe { rdma_get_src_port(listener.as_ptr()) }))
    }

    fn create_id(&mut self) -> Result<CmId, TransportError> {
        let id = self.new_raw_id()?;
        let cm_id = CmId(id.as_ptr() as u64);
        self.ids.insert(cm_id, id);
        Ok(cm_id)
    }

    fn resolve_addr(
        &mut self,
        id: CmId,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let target = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{}:{}", host, port)))?;
        let addr = SockaddrStorage::from(target);
        check("rdma_resolve_addr", unsafe {
            rdma_resolve_addr(
                self.id(id)?,
                null_mut(),
                addr.as_ptr() as *mut _,
                timeout_ms(timeout),
            )
        })
    }

    fn resolve_route(&mut self, id: CmId, timeout: Duration) -> Result<(), TransportError> {
        check("rdma_resolve_route", unsafe {
            rdma_resolve_route(self.id(id)?, timeout_ms(timeout))
        })
    }

    fn create_qp(&mut self, id: CmId) -> Result<(), TransportError> {
        let raw = self.id(id)?;
        self.ensure_context(unsafe { (*raw).verbs })?;
        let mut attr: ibv_qp_init_attr = unsafe { zeroed() };
        attr.send_cq = self.cq;
        attr.recv_cq = self.cq;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.cap.max_send_wr = self.config.max_send_wr;
        attr.cap.max_recv_wr = self.config.max_recv_wr;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;
        check("rdma_create_qp", unsafe { rdma_create_qp(raw, self.pd, &mut attr) })
    }

    fn connect(&mut self, id: CmId, params: &ConnParams) -> Result<(), TransportError> {
        let mut p = conn_param(params);
        check("rdma_connect", unsafe { rdma_connect(self.id(id)?, &mut p) })
    }

    fn accept(&mut self, id: CmId, params: &ConnParams) -> Result<(), TransportError> {
        let mut p = conn_param(params);
        check("rdma_accept", unsafe { rdma_accept(self.id(id)?, &mut p) })
    }

    fn disconnect(&mut self, id: CmId) -> Result<(), TransportError> {
        check("rdma_disconnect", unsafe { rdma_disconnect(self.id(id)?) })
    }

    fn next_event(&mut self) -> Result<Option<CmEvent>, TransportError> {
        let mut event: *mut rdma_cm_event = null_mut();
        if unsafe { rdma_get_cm_event(self.channel.as_ptr(), &mut event) } != 0 {
            return Ok(None);
        }
        let (raw, kind) = unsafe { ((*event).id, event_kind((*event).event)) };
        check("rdma_ack_cm_event", unsafe { rdma_ack_cm_event(event) })?;
        let raw = non_null("rdma_get_cm_event", raw)?;
        let id = CmId(raw.as_ptr() as u64);
        // Connect requests carry a fresh identity.
        self.ids.entry(id).or_insert(raw);
        Ok(Some(CmEvent { id, kind }))
    }

    unsafe fn register(
        &mut self,
        id: CmId,
        addr: *mut u8,
        length: usize,
    ) -> Result<VerbsRegistration, TransportError> {
        let raw = self.id(id)?;
        // SAFETY: the id is alive as long as the transport
        self.ensure_context(unsafe { (*raw).verbs })?;
        let access =
            (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE | ibv_access_flags::IBV_ACCESS_REMOTE_READ).0;
        let mr = unsafe { ibv_reg_mr(self.pd, addr as *mut _, length, access as i32) };
        Ok(VerbsRegistration {
            mr: non_null("ibv_reg_mr", mr)?,
        })
    }

    fn post_recv(
        &mut self,
        id: CmId,
        wr_id: u64,
        buffer: LocalBuffer,
    ) -> Result<(), TransportError> {
        let qp = self.qp(id)?;
        let mut sge = ibv_sge {
            addr: buffer.addr,
            length: buffer.length,
            lkey: buffer.lkey,
        };
        let mut wr: ibv_recv_wr = unsafe { zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        let mut bad: *mut ibv_recv_wr = null_mut();
        check_errno("ibv_post_recv", unsafe { ibv_post_recv(qp, &mut wr, &mut bad) })
    }

    fn post_send(&self, id: CmId, wr_id: u64, buffer: LocalBuffer) -> Result<(), TransportError> {
        let qp = self.qp(id)?;
        let mut sge = ibv_sge {
            addr: buffer.addr,
            length: buffer.length,
            lkey: buffer.lkey,
        };
        let mut wr: ibv_send_wr = unsafe { zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let mut bad: *mut ibv_send_wr = null_mut();
        check_errno("ibv_post_send", unsafe { ibv_post_send(qp, &mut wr, &mut bad) })
    }

    fn post_reads(&self, id: CmId, reads: &[ReadRequest]) -> Result<(), TransportError> {
        if reads.is_empty() {
            return Ok(());
        }
        let qp = self.qp(id)?;
        let mut sges: Vec<ibv_sge> = reads
            .iter()
            .map(|r| ibv_sge {
                addr: r.local.addr,
                length: r.local.length,
                lkey: r.local.lkey,
            })
            .collect();
        let mut wrs: Vec<ibv_send_wr> = Vec::with_capacity(reads.len());
        for (read, sge) in reads.iter().zip(sges.iter_mut()) {
            let mut wr: ibv_send_wr = unsafe { zeroed() };
            wr.wr_id = read.wr_id;
            wr.sg_list = sge;
            wr.num_sge = 1;
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            if read.signaled {
                wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            }
            unsafe {
                wr.wr.rdma.remote_addr = read.remote_addr;
                wr.wr.rdma.rkey = read.rkey;
            }
            wrs.push(wr);
        }
        // Chain the requests, the vector does not move from here on.
        let base = wrs.as_mut_ptr();
        for i in 1..wrs.len() {
            wrs[i - 1].next = unsafe { base.add(i) };
        }
        let mut bad: *mut ibv_send_wr = null_mut();
        check_errno("ibv_post_send", unsafe { ibv_post_send(qp, base, &mut bad) })
    }

    fn completion_queue(&self) -> VerbsCq {
        VerbsCq { cq: self.cq }
    }
}
