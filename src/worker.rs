//! Ranks `1..P`: receive the shared operand and a row block, return the partial product.

use std::time::Duration;

use log::{debug, info, warn};

use crate::codec::{self, Control, Payload};
use crate::error::{MatMulError, Result};
use crate::kernel::Kernel;
use crate::matrix::Matrix;
use crate::transport::{Tag, Transport, ROOT};

pub struct Worker<T, K> {
    transport: T,
    kernel: K,
    timeout: Option<Duration>,
}

impl<T: Transport, K: Kernel> Worker<T, K> {
    /// `timeout` bounds each receive from the coordinator; `None` waits indefinitely.
    pub fn new(transport: T, kernel: K, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            kernel,
            timeout,
        }
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Serve one job: broadcast operand, then row block and offset, then reply.
    ///
    /// If the kernel fails, the failure is reported to the coordinator on the
    /// partial-result channel in place of a block, and returned as
    /// [`MatMulError::ComputeFailure`].
    pub fn run(&self) -> Result<()> {
        let rank = self.transport.rank();
        if rank == ROOT || rank >= self.transport.size() {
            return Err(MatMulError::InvalidRank(rank));
        }

        let b = self.receive_matrix(Tag::Broadcast)?;
        debug!("Worker {} received {}x{} operand", rank, b.rows(), b.cols());

        let local_a = self.receive_matrix(Tag::RowBlock)?;
        let offset = match self.receive(Tag::Offset)? {
            Payload::Control(Control::Offset(offset)) => offset as usize,
            other => {
                return Err(MatMulError::CommunicationError(format!(
                    "worker {rank} expected an offset, got {}",
                    other.summary()
                )));
            }
        };
        debug!(
            "Worker {} assigned rows [{}, {})",
            rank,
            offset,
            offset + local_a.rows()
        );

        let local_c = match self.kernel.multiply(local_a.view(), &b) {
            Ok(c) => c,
            Err(e) => {
                let reason = e.to_string();
                warn!("Worker {} compute failed: {}", rank, reason);
                let report = codec::encode_control(&Control::Failure {
                    reason: reason.clone(),
                })?;
                self.transport.send(ROOT, Tag::PartialBlock, &report)?;
                return Err(MatMulError::ComputeFailure {
                    worker: rank,
                    reason,
                });
            }
        };

        self.transport
            .send(ROOT, Tag::PartialBlock, &codec::encode_block(local_c.view()))?;
        self.transport
            .send(ROOT, Tag::OffsetReturn, &codec::encode_offset(offset)?)?;

        info!("Worker {} returned {} rows at offset {}", rank, local_c.rows(), offset);
        Ok(())
    }

    fn receive(&self, tag: Tag) -> Result<Payload> {
        let frame = self.transport.recv(ROOT, tag, self.timeout)?;
        codec::decode(&frame)
    }

    fn receive_matrix(&self, tag: Tag) -> Result<Matrix> {
        match self.receive(tag)? {
            Payload::Matrix(m) => Ok(m),
            other => Err(MatMulError::CommunicationError(format!(
                "worker {} expected a matrix on {tag}, got {}",
                self.transport.rank(),
                other.summary()
            ))),
        }
    }
}
