//! The peer group: broadcast, collective actions, and the receive
//! thread.
//!
//! A collective broadcast delivers the frame to every rank including the
//! initiator; each rank runs the delegate's collective handler on its
//! receive thread under a [`GroupComm`], then reports completion back to
//! the initiator, whose `broadcast_collective` call returns only when
//! all ranks have finished. Non-collective broadcasts are a plain
//! fan-out handled asynchronously.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::comm::message::{Frame, MessageClass};
use crate::comm::transport::{CollPacket, Transport};
use crate::errors::{NebulaError, Result};

/// Receiver side of the substrate. Handlers run on the receive thread
/// and should enqueue work and return; only collective handlers may
/// block, and then only on the [`GroupComm`] lanes.
pub trait MessageDelegate: Send + Sync {
    /// Handle a point-to-point or fan-out frame.
    fn handle(&self, frame: &Frame, group: &Arc<PeerGroup>) -> Result<()>;

    /// Handle a collective frame under the group communicator.
    fn handle_collective(
        &self,
        frame: &Frame,
        group: &Arc<PeerGroup>,
        comm: &GroupComm<'_>,
    ) -> Result<()>;
}

/// Group communicator handed to collective handlers. Reductions ride the
/// dedicated collective lane because the main lane's receive thread is
/// the one executing the handler.
pub struct GroupComm<'a> {
    transport: &'a dyn Transport,
    tag: u32,
}

impl GroupComm<'_> {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Element-wise sum of `vals` across all ranks; every rank receives
    /// the result. Gather at rank 0, then redistribute.
    pub fn reduce_sum(&self, vals: &[i64]) -> Result<Vec<i64>> {
        let size = self.size();
        if size == 1 {
            return Ok(vals.to_vec());
        }

        if self.rank() == 0 {
            let mut sums = vals.to_vec();
            for _ in 1..size {
                let packet = self.transport.collective_recv()?;
                if packet.tag != self.tag {
                    return Err(NebulaError::Protocol(format!(
                        "collective lane crosstalk: expected tag {}, got {}",
                        self.tag, packet.tag
                    )));
                }
                if packet.values.len() != sums.len() {
                    return Err(NebulaError::Protocol(
                        "collective reduction arity mismatch".into(),
                    ));
                }
                for (s, v) in sums.iter_mut().zip(&packet.values) {
                    *s += v;
                }
            }
            for dest in 1..size {
                self.transport.collective_send(
                    dest,
                    CollPacket {
                        source: 0,
                        tag: self.tag,
                        values: sums.clone(),
                    },
                )?;
            }
            Ok(sums)
        } else {
            self.transport.collective_send(
                0,
                CollPacket {
                    source: self.rank(),
                    tag: self.tag,
                    values: vals.to_vec(),
                },
            )?;
            let packet = self.transport.collective_recv()?;
            if packet.tag != self.tag {
                return Err(NebulaError::Protocol(format!(
                    "collective lane crosstalk: expected tag {}, got {}",
                    self.tag, packet.tag
                )));
            }
            Ok(packet.values)
        }
    }
}

/// One rank's handle on the peer group.
pub struct PeerGroup {
    transport: Arc<dyn Transport>,
    completions: Mutex<FxHashMap<u32, usize>>,
    completion_cv: Condvar,
    /// Serializes collectives initiated from this rank.
    collective_gate: Mutex<()>,
}

impl PeerGroup {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            completions: Mutex::new(FxHashMap::default()),
            completion_cv: Condvar::new(),
            collective_gate: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Point-to-point send on the main lane.
    pub fn send(&self, dest: usize, frame: &Frame) -> Result<()> {
        self.transport.send(dest, frame)
    }

    /// Fan-out to every rank including this one, handled asynchronously.
    pub fn broadcast(&self, frame: &Frame) -> Result<()> {
        for dest in 0..self.size() {
            self.transport.send(dest, frame)?;
        }
        Ok(())
    }

    /// Deliver to every rank, run each rank's collective handler, and
    /// return once all of them have completed.
    pub fn broadcast_collective(&self, frame: &Frame) -> Result<()> {
        debug_assert!(frame.class.is_collective());
        let _gate = self.collective_gate.lock();

        let tag = frame.class as u32;
        self.completions.lock().insert(tag, 0);

        for dest in 0..self.size() {
            self.transport.send(dest, frame)?;
        }

        let mut completions = self.completions.lock();
        while completions.get(&tag).copied().unwrap_or(0) < self.size() {
            self.completion_cv.wait(&mut completions);
        }
        completions.remove(&tag);
        Ok(())
    }

    /// Group barrier; every rank must call this.
    pub fn barrier(&self) -> Result<()> {
        self.transport.barrier()
    }

    /// Stop this rank's receive thread once the current frame drains.
    pub fn quit_local(&self) -> Result<()> {
        self.transport
            .send(self.rank(), &Frame::new(MessageClass::Quit, Vec::new()))
    }

    fn note_collective_done(&self, tag: u32) {
        let mut completions = self.completions.lock();
        if let Some(count) = completions.get_mut(&tag) {
            *count += 1;
            self.completion_cv.notify_all();
        } else {
            log::warn!("stray collective completion for tag {tag}");
        }
    }

    /// Spawn the receive thread. Returns its join handle; the thread
    /// exits on [`Self::quit_local`] or when the fabric closes.
    pub fn start(
        self: &Arc<Self>,
        delegate: Arc<dyn MessageDelegate>,
    ) -> std::thread::JoinHandle<()> {
        let group = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("msg-recv-{}", self.rank()))
            .spawn(move || group.receive_loop(&delegate))
            .expect("spawn receive thread")
    }

    fn receive_loop(self: Arc<Self>, delegate: &Arc<dyn MessageDelegate>) {
        loop {
            let frame = match self.transport.recv() {
                Ok(f) => f,
                Err(NebulaError::Disconnected(_)) => break,
                Err(e) => {
                    log::error!("rank {}: receive failed: {e}", self.rank());
                    break;
                }
            };

            match frame.class {
                MessageClass::Quit => break,
                MessageClass::CollectiveDone => {
                    let tag = u32::from_le_bytes(
                        frame.payload.get(0..4).and_then(|b| b.try_into().ok()).unwrap_or([0; 4]),
                    );
                    self.note_collective_done(tag);
                }
                class if class.is_collective() => {
                    let comm = GroupComm {
                        transport: &*self.transport,
                        tag: class as u32,
                    };
                    if let Err(e) = delegate.handle_collective(&frame, &self, &comm) {
                        // Collective failure desynchronizes the group
                        panic!("rank {}: collective {class:?} failed: {e}", self.rank());
                    }
                    let done = Frame::new(
                        MessageClass::CollectiveDone,
                        (class as u32).to_le_bytes().to_vec(),
                    );
                    if let Err(e) = self.transport.send(frame.source, &done) {
                        log::error!("rank {}: completion report failed: {e}", self.rank());
                        break;
                    }
                }
                _ => {
                    if let Err(e) = delegate.handle(&frame, &self) {
                        // Per-message problems are logged and dropped
                        log::warn!(
                            "rank {}: dropped {:?} from {}: {e}",
                            self.rank(),
                            frame.class,
                            frame.source
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::transport::ChannelTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        handled: AtomicUsize,
        collective: AtomicUsize,
    }

    impl MessageDelegate for Counting {
        fn handle(&self, _frame: &Frame, _group: &Arc<PeerGroup>) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handle_collective(
            &self,
            _frame: &Frame,
            _group: &Arc<PeerGroup>,
            comm: &GroupComm<'_>,
        ) -> Result<()> {
            let sums = comm.reduce_sum(&[1, comm.rank() as i64])?;
            assert_eq!(sums[0], comm.size() as i64);
            self.collective.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn start_group(n: usize) -> (Vec<Arc<PeerGroup>>, Vec<Arc<Counting>>, Vec<std::thread::JoinHandle<()>>) {
        let mut groups = Vec::new();
        let mut delegates = Vec::new();
        let mut threads = Vec::new();
        for t in ChannelTransport::group(n) {
            let group = PeerGroup::new(Arc::new(t));
            let delegate = Arc::new(Counting {
                handled: AtomicUsize::new(0),
                collective: AtomicUsize::new(0),
            });
            threads.push(group.start(delegate.clone() as Arc<dyn MessageDelegate>));
            groups.push(group);
            delegates.push(delegate);
        }
        (groups, delegates, threads)
    }

    fn stop(groups: &[Arc<PeerGroup>], threads: Vec<std::thread::JoinHandle<()>>) {
        for g in groups {
            g.quit_local().unwrap();
        }
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn collective_broadcast_blocks_until_all_complete() {
        let (groups, delegates, threads) = start_group(3);
        groups[0]
            .broadcast_collective(&Frame::new(MessageClass::Barrier, Vec::new()))
            .unwrap();
        // On return, every rank has executed the collective handler
        for d in &delegates {
            assert_eq!(d.collective.load(Ordering::SeqCst), 1);
        }
        stop(&groups, threads);
    }

    #[test]
    fn fanout_broadcast_reaches_every_rank() {
        let (groups, delegates, threads) = start_group(3);
        groups[1]
            .broadcast(&Frame::new(MessageClass::PropagateState, vec![0; 16]))
            .unwrap();
        // Fan-out is asynchronous; quit frames queue behind it per-source
        stop(&groups, threads);
        for d in &delegates {
            assert_eq!(d.handled.load(Ordering::SeqCst), 1);
        }
    }
}
