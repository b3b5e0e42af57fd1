//! Region Exchange: one Region Descriptor, sent over a connection with a plain send/receive pair.

use crate::connection::Connection;
use crate::error::ExperimentError;
use log::{debug, warn};
use rdma_channel::{Completion, CompletionQueue, RegionDescriptor, Transport, WcOpcode, WcStatus};
use spin_gate::{spin_until, SpinBudget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaited {
    Matched(Completion),
    /// A successful completion of another kind of operation.
    Unexpected(Completion),
}

/// Poll `cq` for the next completion and check it against `expected`.
///
/// A failed completion is an error. A completion of the wrong kind is only reported.
pub fn await_completion<Q: CompletionQueue>(
    cq: &Q,
    expected: WcOpcode,
    budget: Option<SpinBudget>,
) -> Result<Awaited, ExperimentError> {
    let mut slot = [Completion::default()];
    let mut failure = None;
    spin_until(
        || match cq.poll(&mut slot) {
            Ok(n) => n > 0,
            Err(e) => {
                failure = Some(e);
                true
            }
        },
        budget,
    )?;
    if let Some(e) = failure {
        return Err(e.into());
    }
    let wc = slot[0];
    if wc.status != WcStatus::Success {
        return Err(ExperimentError::CompletionFailed {
            wr_id: wc.wr_id,
            status: wc.status,
            opcode: wc.opcode,
        });
    }
    if wc.opcode != expected {
        warn!(
            "wrong completion opcode: expected {:?}, got {:?} (wr_id {})",
            expected, wc.opcode, wc.wr_id
        );
        return Ok(Awaited::Unexpected(wc));
    }
    Ok(Awaited::Matched(wc))
}

/// Poll until a completion of the `expected` kind shows up, skipping others.
pub fn await_opcode<Q: CompletionQueue>(
    cq: &Q,
    expected: WcOpcode,
    budget: Option<SpinBudget>,
) -> Result<Completion, ExperimentError> {
    loop {
        if let Awaited::Matched(wc) = await_completion(cq, expected, budget)? {
            return Ok(wc);
        }
    }
}

/// Send `descriptor` to the peer of `connection`, once the connection is up.
pub fn publish<T: Transport>(
    transport: &T,
    connection: &mut Connection<T>,
    descriptor: &RegionDescriptor,
    budget: Option<SpinBudget>,
) -> Result<(), ExperimentError> {
    let index = connection.index;
    connection.connected_flag().wait(budget)?;
    let buffer = connection
        .exchange_buffer()
        .ok_or(ExperimentError::NoExchangeBuffer(index))?;
    let bytes = connection
        .exchange_bytes_mut()
        .ok_or(ExperimentError::NoExchangeBuffer(index))?;
    bytes.copy_from_slice(&descriptor.to_bytes());
    transport.post_send(connection.id, index as u64, buffer)?;
    await_opcode(&transport.completion_queue(), WcOpcode::Send, budget)?;
    debug!("region {:#x}+{:#x} published on connection {}", descriptor.addr, descriptor.length, index);
    Ok(())
}

/// Post the receive a descriptor will land in. Must happen before the peer can send.
pub fn prepost_subscription<T: Transport>(
    transport: &mut T,
    connection: &Connection<T>,
) -> Result<(), ExperimentError> {
    let buffer = connection
        .exchange_buffer()
        .ok_or(ExperimentError::NoExchangeBuffer(connection.index))?;
    transport.post_recv(connection.id, connection.index as u64, buffer)?;
    Ok(())
}

/// Wait for the descriptor posted by `prepost_subscription` to arrive and decode it.
pub fn receive<T: Transport>(
    transport: &T,
    connection: &Connection<T>,
    budget: Option<SpinBudget>,
) -> Result<RegionDescriptor, ExperimentError> {
    await_opcode(&transport.completion_queue(), WcOpcode::Recv, budget)?;
    let bytes = connection
        .exchange_bytes()
        .ok_or(ExperimentError::NoExchangeBuffer(connection.index))?;
    RegionDescriptor::from_bytes(bytes).ok_or(ExperimentError::NoExchangeBuffer(connection.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::connected;
    use rdma_channel::loopback::LoopbackCq;
    use rdma_channel::{MemoryRegistration, PinnedBuffer};

    const BUDGET: Option<SpinBudget> = Some(SpinBudget(1 << 24));

    #[test]
    fn descriptor_round_trip() {
        let (_f, (mut st, _, mut ss), (ct, _, cs), _, _) = connected(2, vec![0], 1);
        let hosted = PinnedBuffer::new(1 << 16);
        let registration =
            unsafe { st.register(ss.connections[0].id, hosted.as_ptr(), hosted.len()) }.unwrap();
        let published = registration.descriptor();

        publish(&st, &mut ss.connections[0], &published, BUDGET).unwrap();
        let received = receive(&ct, &cs.connections[0], BUDGET).unwrap();
        assert_eq!(received, published);
        assert_eq!(
            cs.connections[0].exchange_bytes().unwrap(),
            &published.to_bytes()[..]
        );
    }

    #[test]
    fn receive_times_out_without_publisher() {
        let (_f, _, (ct, _, cs), _, _) = connected(1, vec![], 1);
        assert!(matches!(
            receive(&ct, &cs.connections[0], Some(SpinBudget(1000))),
            Err(ExperimentError::Spin(_))
        ));
    }

    #[test]
    fn wrong_opcode_is_skipped() {
        let (_f, (mut st, _, mut ss), (ct, _, cs), _, _) = connected(1, vec![0], 1);
        let remote = PinnedBuffer::new(4096);
        let remote_reg =
            unsafe { st.register(ss.connections[0].id, remote.as_ptr(), remote.len()) }.unwrap();
        let target = cs.connections[0].read_targets().next().unwrap();
        // A read completion lands in the client queue before the descriptor.
        ct.post_reads(
            cs.connections[0].id,
            &[rdma_channel::ReadRequest {
                wr_id: 77,
                remote_addr: remote_reg.descriptor().addr,
                rkey: remote_reg.descriptor().rkey,
                local: target,
                signaled: true,
            }],
        )
        .unwrap();
        let cq: LoopbackCq = ct.completion_queue();
        assert!(matches!(
            await_completion(&cq, WcOpcode::Recv, BUDGET),
            Ok(Awaited::Unexpected(Completion { wr_id: 77, .. }))
        ));

        ct.post_reads(
            cs.connections[0].id,
            &[rdma_channel::ReadRequest {
                wr_id: 78,
                remote_addr: remote_reg.descriptor().addr,
                rkey: remote_reg.descriptor().rkey,
                local: target,
                signaled: true,
            }],
        )
        .unwrap();
        let published = remote_reg.descriptor();
        publish(&st, &mut ss.connections[0], &published, BUDGET).unwrap();
        assert_eq!(receive(&ct, &cs.connections[0], BUDGET).unwrap(), published);
    }

    #[test]
    fn failed_completion_is_fatal() {
        let (_f, (st, _, mut ss), _client, _, _) = connected(1, vec![0], 1);
        // Nothing reposted on the client after its first receive is consumed.
        let d = RegionDescriptor::default();
        publish(&st, &mut ss.connections[0], &d, BUDGET).unwrap();
        assert!(matches!(
            publish(&st, &mut ss.connections[0], &d, BUDGET),
            Err(ExperimentError::CompletionFailed {
                status: WcStatus::RnrRetryExceeded,
                ..
            })
        ));
    }
}
