//! Point-to-point and broadcast messaging between ranks.
//!
//! A [`Transport`] is one participant's endpoint. Messages are opaque byte frames
//! addressed by peer rank and [`Tag`]; frames sent by one rank to another on the same
//! tag arrive in send order. Nothing is promised across tags or across senders.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{MatMulError, Result};

pub mod local;
pub mod shmem;

pub use local::LocalTransport;
pub use shmem::ShmemTransport;

/// Rank of the coordinator and the only valid broadcast origin.
pub const ROOT: i32 = 0;

/// Logical channel between two endpoints.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Shared right operand, coordinator to every worker.
    Broadcast = 0,
    /// A worker's row block of the left operand.
    RowBlock = 1,
    /// Row offset paired with `RowBlock`.
    Offset = 2,
    /// A worker's partial product (or its failure report).
    PartialBlock = 3,
    /// Row offset paired with `PartialBlock`.
    OffsetReturn = 4,
}

impl Tag {
    pub const ALL: [Tag; 5] = [
        Tag::Broadcast,
        Tag::RowBlock,
        Tag::Offset,
        Tag::PartialBlock,
        Tag::OffsetReturn,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(raw: i32) -> Option<Tag> {
        Tag::ALL.into_iter().find(|t| t.as_i32() == raw)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Broadcast => "broadcast",
            Tag::RowBlock => "row-block",
            Tag::Offset => "offset",
            Tag::PartialBlock => "partial-block",
            Tag::OffsetReturn => "offset-return",
        };
        f.write_str(name)
    }
}

pub trait Transport {
    /// This endpoint's rank, `0..size()`.
    fn rank(&self) -> i32;

    /// Number of participants, fixed for the transport's lifetime.
    fn size(&self) -> i32;

    /// Hand `payload` to `dest` on channel `tag`.
    ///
    /// May return as soon as the transport has taken the frame; it does not wait for
    /// the receiver unless the medium requires it.
    fn send(&self, dest: i32, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Block until the next frame from `source` on `tag` arrives.
    ///
    /// With `timeout: Some(_)` the wait is bounded and expiry yields
    /// [`MatMulError::Timeout`].
    fn recv(&self, source: i32, tag: Tag, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Deliver `payload` to every other rank on [`Tag::Broadcast`]. Root only.
    ///
    /// Returns once the frame has been handed to the transport for every worker, in
    /// increasing rank order. Because channels are FIFO, any later send to a worker is
    /// observed after the broadcast by a worker that receives in protocol order.
    fn broadcast(&self, payload: &[u8]) -> Result<()> {
        if self.rank() != ROOT {
            return Err(MatMulError::InvalidRank(self.rank()));
        }
        for dest in 1..self.size() {
            self.send(dest, Tag::Broadcast, payload)?;
        }
        Ok(())
    }

    /// Receive the root's broadcast frame.
    fn recv_broadcast(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.recv(ROOT, Tag::Broadcast, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn rank(&self) -> i32 {
        (**self).rank()
    }

    fn size(&self) -> i32 {
        (**self).size()
    }

    fn send(&self, dest: i32, tag: Tag, payload: &[u8]) -> Result<()> {
        (**self).send(dest, tag, payload)
    }

    fn recv(&self, source: i32, tag: Tag, timeout: Option<Duration>) -> Result<Vec<u8>> {
        (**self).recv(source, tag, timeout)
    }

    fn broadcast(&self, payload: &[u8]) -> Result<()> {
        (**self).broadcast(payload)
    }

    fn recv_broadcast(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        (**self).recv_broadcast(timeout)
    }
}

/// Reject ranks outside `0..size` and messages addressed to oneself.
pub(crate) fn check_peer(rank: i32, size: i32, peer: i32) -> Result<()> {
    if peer < 0 || peer >= size || peer == rank {
        return Err(MatMulError::InvalidRank(peer));
    }
    Ok(())
}

pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_through_i32() {
        for tag in Tag::ALL {
            assert_eq!(Tag::from_i32(tag.as_i32()), Some(tag));
        }
        assert_eq!(Tag::from_i32(-1), None);
        assert_eq!(Tag::from_i32(5), None);
    }

    #[test]
    fn peer_checks() {
        assert!(check_peer(0, 3, 2).is_ok());
        assert!(check_peer(0, 3, 0).is_err());
        assert!(check_peer(0, 3, 3).is_err());
        assert!(check_peer(1, 3, -1).is_err());
    }
}
