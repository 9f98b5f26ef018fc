//! Transport abstraction and the in-process channel fabric.
//!
//! A [`Transport`] moves encoded frames between ranks on three lanes:
//! the main lane feeding each rank's receive thread, a collective lane
//! used for reductions *inside* collective handlers (the receive thread
//! is blocked in the handler, so these bytes cannot ride the main lane),
//! and a barrier lane for the group barrier. Per-lane, per-peer ordering
//! is FIFO, which gives the (source, destination, class) ordering
//! guarantee the protocol relies on.

use flume::{Receiver, Sender};

use crate::comm::message::Frame;
use crate::errors::{NebulaError, Result};

/// A reduction packet exchanged on the collective lane. `tag` names the
/// collective class it belongs to so crosstalk is caught, not summed.
#[derive(Debug, Clone)]
pub struct CollPacket {
    pub source: usize,
    pub tag: u32,
    pub values: Vec<i64>,
}

/// Reliable framed transport between the ranks of one peer group.
/// Failure is fatal: any error out of here aborts the rank.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Send one frame to `dest` on the main lane.
    fn send(&self, dest: usize, frame: &Frame) -> Result<()>;

    /// Blocking receive on the main lane.
    fn recv(&self) -> Result<Frame>;

    /// Send a reduction packet on the collective lane.
    fn collective_send(&self, dest: usize, packet: CollPacket) -> Result<()>;

    /// Blocking receive on the collective lane.
    fn collective_recv(&self) -> Result<CollPacket>;

    /// Group barrier: blocks until every rank has entered.
    fn barrier(&self) -> Result<()>;
}

enum BarrierToken {
    Arrive(usize),
    Release,
}

/// In-process fabric: every rank is a set of threads in this process and
/// frames travel over `flume` channels as encoded bytes, exercising the
/// same wire form a socket transport would carry.
pub struct ChannelTransport {
    rank: usize,
    main_tx: Vec<Sender<(usize, Vec<u8>)>>,
    main_rx: Receiver<(usize, Vec<u8>)>,
    coll_tx: Vec<Sender<CollPacket>>,
    coll_rx: Receiver<CollPacket>,
    barrier_tx: Vec<Sender<BarrierToken>>,
    barrier_rx: Receiver<BarrierToken>,
}

impl ChannelTransport {
    /// Build the fabric for a group of `n` ranks.
    #[must_use]
    pub fn group(n: usize) -> Vec<ChannelTransport> {
        let mut main_tx = Vec::with_capacity(n);
        let mut main_rx = Vec::with_capacity(n);
        let mut coll_tx = Vec::with_capacity(n);
        let mut coll_rx = Vec::with_capacity(n);
        let mut barrier_tx = Vec::with_capacity(n);
        let mut barrier_rx = Vec::with_capacity(n);

        for _ in 0..n {
            let (tx, rx) = flume::unbounded();
            main_tx.push(tx);
            main_rx.push(rx);
            let (tx, rx) = flume::unbounded();
            coll_tx.push(tx);
            coll_rx.push(rx);
            let (tx, rx) = flume::unbounded();
            barrier_tx.push(tx);
            barrier_rx.push(rx);
        }

        main_rx
            .into_iter()
            .zip(coll_rx)
            .zip(barrier_rx)
            .enumerate()
            .map(|(rank, ((main_rx, coll_rx), barrier_rx))| ChannelTransport {
                rank,
                main_tx: main_tx.clone(),
                main_rx,
                coll_tx: coll_tx.clone(),
                coll_rx,
                barrier_tx: barrier_tx.clone(),
                barrier_rx,
            })
            .collect()
    }

    fn check_dest(&self, dest: usize) -> Result<()> {
        if dest >= self.size() {
            return Err(NebulaError::Protocol(format!(
                "destination rank {dest} out of range (group size {})",
                self.size()
            )));
        }
        Ok(())
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.main_tx.len()
    }

    fn send(&self, dest: usize, frame: &Frame) -> Result<()> {
        self.check_dest(dest)?;
        self.main_tx[dest]
            .send((self.rank, frame.encode()))
            .map_err(|_| NebulaError::Disconnected(format!("rank {dest} main lane closed")))
    }

    fn recv(&self) -> Result<Frame> {
        let (source, bytes) = self
            .main_rx
            .recv()
            .map_err(|_| NebulaError::Disconnected("main lane closed".into()))?;
        let mut frame = Frame::decode(&bytes)?;
        frame.source = source;
        Ok(frame)
    }

    fn collective_send(&self, dest: usize, packet: CollPacket) -> Result<()> {
        self.check_dest(dest)?;
        self.coll_tx[dest]
            .send(packet)
            .map_err(|_| NebulaError::Disconnected(format!("rank {dest} collective lane closed")))
    }

    fn collective_recv(&self) -> Result<CollPacket> {
        self.coll_rx
            .recv()
            .map_err(|_| NebulaError::Disconnected("collective lane closed".into()))
    }

    fn barrier(&self) -> Result<()> {
        fn closed<E>(_: E) -> NebulaError {
            NebulaError::Disconnected("barrier lane closed".into())
        }
        if self.rank == 0 {
            let mut seen = 1;
            while seen < self.size() {
                match self.barrier_rx.recv().map_err(closed)? {
                    BarrierToken::Arrive(_) => seen += 1,
                    BarrierToken::Release => {
                        return Err(NebulaError::Protocol(
                            "unexpected barrier release at root".into(),
                        ));
                    }
                }
            }
            for dest in 1..self.size() {
                self.barrier_tx[dest]
                    .send(BarrierToken::Release)
                    .map_err(closed)?;
            }
        } else {
            self.barrier_tx[0]
                .send(BarrierToken::Arrive(self.rank))
                .map_err(closed)?;
            match self.barrier_rx.recv().map_err(closed)? {
                BarrierToken::Release => {}
                BarrierToken::Arrive(r) => {
                    return Err(NebulaError::Protocol(format!(
                        "unexpected barrier arrival from rank {r}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::message::MessageClass;

    #[test]
    fn point_to_point_preserves_order_and_source() {
        let group = ChannelTransport::group(2);
        let a = &group[0];
        let b = &group[1];

        for i in 0..10u8 {
            a.send(1, &Frame::new(MessageClass::AckRays, vec![i; 8]))
                .unwrap();
        }
        for i in 0..10u8 {
            let f = b.recv().unwrap();
            assert_eq!(f.source, 0);
            assert_eq!(f.payload[0], i);
        }
    }

    #[test]
    fn barrier_releases_all_ranks() {
        let group = ChannelTransport::group(4);
        let mut handles = Vec::new();
        for t in group {
            handles.push(std::thread::spawn(move || t.barrier().unwrap()));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
