//! In-process transport: every rank is a thread, every channel an mpsc queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

use super::{check_peer, Tag, Transport};
use crate::error::{MatMulError, Result};

type Frame = Vec<u8>;

/// One rank's endpoint in a [`LocalTransport::cluster`].
///
/// Each ordered `(source, destination, tag)` triple owns a dedicated queue, so frames
/// on one channel are delivered in send order and never mixed with another channel.
/// Only the source endpoint holds the sending half of its queues: once it is dropped,
/// receivers blocked on it wake up with [`MatMulError::Disconnected`].
pub struct LocalTransport {
    rank: i32,
    size: i32,
    outboxes: HashMap<(i32, Tag), Sender<Frame>>,
    inboxes: HashMap<(i32, Tag), Mutex<Receiver<Frame>>>,
    sent: AtomicUsize,
}

impl LocalTransport {
    /// Build a fully connected set of `size` endpoints, indexed by rank.
    pub fn cluster(size: i32) -> Result<Vec<LocalTransport>> {
        if size <= 0 {
            return Err(MatMulError::InvalidConfiguration(format!(
                "cluster size must be positive, got {size}"
            )));
        }

        let mut endpoints: Vec<LocalTransport> = (0..size)
            .map(|rank| LocalTransport {
                rank,
                size,
                outboxes: HashMap::new(),
                inboxes: HashMap::new(),
                sent: AtomicUsize::new(0),
            })
            .collect();

        for src in 0..size {
            for dst in 0..size {
                if src == dst {
                    continue;
                }
                for tag in Tag::ALL {
                    let (tx, rx) = mpsc::channel();
                    endpoints[src as usize].outboxes.insert((dst, tag), tx);
                    endpoints[dst as usize].inboxes.insert((src, tag), Mutex::new(rx));
                }
            }
        }

        debug!("Built local cluster of {} ranks", size);
        Ok(endpoints)
    }

    /// Number of frames this endpoint has sent so far.
    pub fn messages_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn send(&self, dest: i32, tag: Tag, payload: &[u8]) -> Result<()> {
        check_peer(self.rank, self.size, dest)?;
        debug!(
            "Rank {} sending {} bytes to rank {} on {}",
            self.rank,
            payload.len(),
            dest,
            tag
        );

        let outbox = self
            .outboxes
            .get(&(dest, tag))
            .ok_or(MatMulError::InvalidRank(dest))?;
        outbox
            .send(payload.to_vec())
            .map_err(|_| MatMulError::Disconnected { peer: dest, tag })?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recv(&self, source: i32, tag: Tag, timeout: Option<Duration>) -> Result<Vec<u8>> {
        check_peer(self.rank, self.size, source)?;
        debug!("Rank {} receiving from rank {} on {}", self.rank, source, tag);

        let inbox = self
            .inboxes
            .get(&(source, tag))
            .ok_or(MatMulError::InvalidRank(source))?
            .lock()
            .map_err(|_| MatMulError::CommunicationError(format!("inbox for {source}/{tag} poisoned")))?;

        let frame = match timeout {
            Some(t) => inbox.recv_timeout(t).map_err(|e| match e {
                RecvTimeoutError::Timeout => MatMulError::Timeout { peer: source, tag },
                RecvTimeoutError::Disconnected => MatMulError::Disconnected { peer: source, tag },
            })?,
            None => inbox
                .recv()
                .map_err(|_| MatMulError::Disconnected { peer: source, tag })?,
        };

        debug!(
            "Rank {} completed receive of {} bytes from rank {}",
            self.rank,
            frame.len(),
            source
        );
        Ok(frame)
    }
}
