//! Rank 0: partitions the left operand, distributes work and assembles the product.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::codec::{self, Control, Payload};
use crate::error::{MatMulError, Result};
use crate::kernel::Kernel;
use crate::matrix::Matrix;
use crate::partition::{Assignment, PartitionPlan};
use crate::transport::{Tag, Transport, ROOT};

/// The assembled product and the wall-clock time of the distributed phase
/// (broadcast through final assembly).
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub result: Matrix,
    pub elapsed: Duration,
}

pub struct Coordinator<T, K> {
    transport: T,
    kernel: K,
    timeout: Duration,
}

impl<T: Transport, K: Kernel> Coordinator<T, K> {
    /// `timeout` bounds each pending receive from a worker.
    pub fn new(transport: T, kernel: K, timeout: Duration) -> Self {
        Self {
            transport,
            kernel,
            timeout,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Compute `a x b` across every rank of the transport.
    pub fn run(&self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.run_timed(a, b).map(|out| out.result)
    }

    pub fn run_timed(&self, a: &Matrix, b: &Matrix) -> Result<JobOutput> {
        if self.transport.rank() != ROOT {
            return Err(MatMulError::InvalidConfiguration(format!(
                "coordinator must run on rank {ROOT}, not {}",
                self.transport.rank()
            )));
        }
        if a.cols() != b.rows() {
            return Err(MatMulError::DimensionMismatch {
                a_rows: a.rows(),
                a_cols: a.cols(),
                b_rows: b.rows(),
                b_cols: b.cols(),
            });
        }
        let rows = i64::try_from(a.rows()).map_err(|_| {
            MatMulError::InvalidConfiguration(format!("{} rows exceed i64", a.rows()))
        })?;
        let plan = PartitionPlan::compute(rows, self.transport.size())?;

        info!(
            "Multiplying {}x{} by {}x{} over {} processes",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols(),
            plan.participants()
        );
        let start = Instant::now();

        if !plan.workers().is_empty() {
            self.transport
                .broadcast(&codec::encode_block(b.view()))
                .map_err(MatMulError::unresponsive)?;
            debug!("Broadcast {}x{} operand to {} workers", b.rows(), b.cols(), plan.workers().len());

            for assignment in plan.workers() {
                self.distribute(a, assignment)?;
            }
        }

        let own = plan.entries()[0];
        let local_a = a.row_block(own.row_offset, own.row_count)?;
        let local_c = self
            .kernel
            .multiply(local_a, b)
            .map_err(|e| MatMulError::ComputeFailure {
                worker: ROOT,
                reason: e.to_string(),
            })?;

        let mut result = Matrix::zeros(a.rows(), b.cols());
        result.write_block(own.row_offset, local_c.view())?;

        for assignment in plan.workers() {
            if let Err(e) = self.collect(&mut result, assignment, b.cols()) {
                warn!("Aborting run: {}", e);
                return Err(e);
            }
        }

        let elapsed = start.elapsed();
        info!("Assembled {}x{} result in {:?}", result.rows(), result.cols(), elapsed);
        Ok(JobOutput { result, elapsed })
    }

    fn distribute(&self, a: &Matrix, assignment: &Assignment) -> Result<()> {
        let block = a.row_block(assignment.row_offset, assignment.row_count)?;
        let worker = assignment.worker_id;
        debug!(
            "Assigning rows [{}, {}) to worker {}",
            assignment.row_offset,
            assignment.row_offset + assignment.row_count,
            worker
        );
        let offset = codec::encode_offset(assignment.row_offset)?;
        self.transport
            .send(worker, Tag::RowBlock, &codec::encode_block(block))
            .and_then(|()| self.transport.send(worker, Tag::Offset, &offset))
            .map_err(MatMulError::unresponsive)
    }

    /// Receive one worker's partial product and its offset, then write it in place.
    fn collect(&self, result: &mut Matrix, assignment: &Assignment, cols: usize) -> Result<()> {
        let worker = assignment.worker_id;

        let block = match self.receive(worker, Tag::PartialBlock)? {
            Payload::Matrix(block) => block,
            Payload::Control(Control::Failure { reason }) => {
                return Err(MatMulError::ComputeFailure { worker, reason });
            }
            other => {
                return Err(MatMulError::CommunicationError(format!(
                    "worker {worker} sent {} on {}",
                    other.summary(),
                    Tag::PartialBlock
                )));
            }
        };
        let offset = match self.receive(worker, Tag::OffsetReturn)? {
            Payload::Control(Control::Offset(offset)) => offset as usize,
            other => {
                return Err(MatMulError::CommunicationError(format!(
                    "worker {worker} sent {} on {}",
                    other.summary(),
                    Tag::OffsetReturn
                )));
            }
        };

        if offset != assignment.row_offset
            || block.rows() != assignment.row_count
            || block.cols() != cols
        {
            return Err(MatMulError::CommunicationError(format!(
                "worker {worker} returned {}x{} at row {offset}, expected {}x{cols} at row {}",
                block.rows(),
                block.cols(),
                assignment.row_count,
                assignment.row_offset
            )));
        }

        result.write_block(offset, block.view())?;
        debug!("Integrated {} rows from worker {} at offset {}", block.rows(), worker, offset);
        Ok(())
    }

    fn receive(&self, worker: i32, tag: Tag) -> Result<Payload> {
        let frame = self
            .transport
            .recv(worker, tag, Some(self.timeout))
            .map_err(MatMulError::unresponsive)?;
        codec::decode(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::NaiveKernel;
    use crate::transport::LocalTransport;

    #[test]
    fn single_participant_runs_locally() {
        let mut cluster = LocalTransport::cluster(1).unwrap();
        let coordinator = Coordinator::new(cluster.remove(0), NaiveKernel, Duration::from_secs(1));
        let a = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap();

        let c = coordinator.run(&a, &b).unwrap();
        assert_eq!(c, Matrix::from_rows(vec![vec![19.0, 22.0], vec![43.0, 50.0]]).unwrap());
        assert_eq!(coordinator.transport().messages_sent(), 0);
    }

    #[test]
    fn dimension_mismatch_sends_nothing() {
        let mut cluster = LocalTransport::cluster(3).unwrap();
        let coordinator = Coordinator::new(cluster.remove(0), NaiveKernel, Duration::from_secs(1));
        let err = coordinator
            .run(&Matrix::zeros(4, 3), &Matrix::zeros(4, 4))
            .unwrap_err();
        assert!(matches!(
            err,
            MatMulError::DimensionMismatch { a_rows: 4, a_cols: 3, b_rows: 4, b_cols: 4 }
        ));
        assert_eq!(coordinator.transport().messages_sent(), 0);
    }

    #[test]
    fn refuses_to_run_on_a_worker_rank() {
        let mut cluster = LocalTransport::cluster(2).unwrap();
        let coordinator = Coordinator::new(cluster.remove(1), NaiveKernel, Duration::from_secs(1));
        let m = Matrix::zeros(2, 2);
        assert!(matches!(
            coordinator.run(&m, &m),
            Err(MatMulError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn silent_worker_is_reported_unresponsive() {
        // Keep the worker endpoint alive but never run it.
        let mut cluster = LocalTransport::cluster(2).unwrap();
        let _silent = cluster.pop().unwrap();
        let deadline = Duration::from_millis(100);
        let coordinator = Coordinator::new(cluster.remove(0), NaiveKernel, deadline);
        let m = Matrix::zeros(4, 4);

        let start = Instant::now();
        let err = coordinator.run(&m, &m).unwrap_err();
        assert!(matches!(
            err,
            MatMulError::WorkerUnresponsive { worker: 1, channel: Tag::PartialBlock }
        ));
        assert!(start.elapsed() < deadline * 20);
    }

    #[test]
    fn departed_worker_is_reported_on_the_broadcast() {
        let mut cluster = LocalTransport::cluster(3).unwrap();
        drop(cluster.pop());
        let coordinator = Coordinator::new(cluster.remove(0), NaiveKernel, Duration::from_secs(1));
        let m = Matrix::zeros(3, 3);

        let err = coordinator.run(&m, &m).unwrap_err();
        assert!(matches!(
            err,
            MatMulError::WorkerUnresponsive { worker: 2, channel: Tag::Broadcast }
        ));
    }

    #[test]
    fn misplaced_partial_result_is_rejected() {
        let mut cluster = LocalTransport::cluster(2).unwrap();
        let worker = cluster.pop().unwrap();
        let coordinator = Coordinator::new(cluster.remove(0), NaiveKernel, Duration::from_secs(5));
        let a = Matrix::zeros(4, 2);
        let b = Matrix::zeros(2, 3);

        // Answer with the right shape but the wrong offset.
        let fake = Matrix::zeros(2, 3);
        worker
            .send(0, Tag::PartialBlock, &codec::encode_block(fake.view()))
            .unwrap();
        worker
            .send(0, Tag::OffsetReturn, &codec::encode_offset(0).unwrap())
            .unwrap();

        let err = coordinator.run(&a, &b).unwrap_err();
        assert!(matches!(err, MatMulError::CommunicationError(_)));
    }
}
