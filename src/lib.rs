//! Row-block distributed dense matrix multiplication over MPI-style message passing.
//!
//! A coordinator (rank 0) and `P - 1` workers cooperate to compute `C = A x B`. The rows of
//! `A` are split into contiguous blocks, `B` is broadcast whole to every worker, each
//! participant multiplies its own block, and the coordinator writes the partial products
//! back into a single result matrix at their row offsets.
//!
//! # Features
//!
//! - **Partitioning**: [`PartitionPlan`] splits `N` rows over `P` participants, giving the
//!   remainder rows to the lowest ranks
//! - **Row-block views**: [`RowBlock`] borrows a row range of a [`Matrix`] without copying
//! - **Transports**: point-to-point, tagged, FIFO-per-channel messaging behind the
//!   [`Transport`] trait, with an in-process implementation ([`LocalTransport`]) and a
//!   multi-process shared-memory one ([`ShmemTransport`])
//! - **Deadlines**: the coordinator bounds every pending receive and reports a silent
//!   worker as [`MatMulError::WorkerUnresponsive`] instead of hanging
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use rowblock_matmul::{run_threaded, Matrix, NaiveKernel};
//!
//! let a = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
//! let b = Matrix::from_rows(vec![vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap();
//!
//! // Coordinator plus two workers, each on its own thread
//! let out = run_threaded(&a, &b, 3, NaiveKernel, Duration::from_secs(5)).unwrap();
//! assert_eq!(out.result.row(1), &[43.0, 50.0]);
//! ```
//!
//! Across processes, every process runs the same program and picks its role by rank:
//!
//! ```rust,no_run
//! use rowblock_matmul::{run_participant, JobConfig, NaiveKernel, ShmemTransport};
//! use rowblock_matmul::job::random_operands;
//!
//! let config = JobConfig::default();
//! let world = ShmemTransport::init(config.participants, config.slot_bytes, None).unwrap();
//! let output = run_participant(&world, NaiveKernel, &config, || random_operands(&config)).unwrap();
//! if let Some(output) = output {
//!     println!("Finished in {:?}", output.elapsed);
//! }
//! world.finalize().unwrap();
//! ```
//!
//! # Protocol
//!
//! 1. The coordinator validates `A.cols == B.rows` and computes the plan.
//! 2. `B` is broadcast to every worker.
//! 3. Each worker, in rank order, is sent its row block of `A` and then its row offset,
//!    on separate channels.
//! 4. The coordinator multiplies its own block locally.
//! 5. Each worker replies with its partial product and its offset; the coordinator writes
//!    the block at that offset.
//!
//! # Error Handling
//!
//! All operations return a `Result` type with detailed error variants through
//! [`MatMulError`]. None of them is recovered from inside a run: a missing or failed
//! block aborts the whole job.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod kernel;
pub mod matrix;
pub mod partition;
pub mod transport;
pub mod worker;

pub use config::{JobConfig, TransportKind};
pub use coordinator::{Coordinator, JobOutput};
pub use error::{MatMulError, Result};
pub use job::{run_participant, run_threaded, run_with};
pub use kernel::{multiply, Kernel, KernelError, NaiveKernel};
pub use matrix::{Matrix, RowBlock};
pub use partition::{Assignment, PartitionPlan};
pub use transport::{LocalTransport, ShmemTransport, Tag, Transport};
pub use worker::Worker;
