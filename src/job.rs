//! Whole-job drivers: pick a role by rank, or run every rank as a thread.

use std::time::Duration;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{JobConfig, TransportKind};
use crate::coordinator::{Coordinator, JobOutput};
use crate::error::{MatMulError, Result};
use crate::kernel::Kernel;
use crate::matrix::Matrix;
use crate::transport::{LocalTransport, ShmemTransport, Transport, ROOT};
use crate::worker::Worker;

/// Random `N x N` operands, reproducible when `config.seed` is set.
pub fn random_operands(config: &JobConfig) -> (Matrix, Matrix) {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let n = config.dimension;
    let a = Matrix::random(n, n, &mut rng);
    let b = Matrix::random(n, n, &mut rng);
    (a, b)
}

/// Play this rank's role in one job.
///
/// Rank 0 builds the operands with `operands` and coordinates, returning the assembled
/// product. Every other rank serves as a worker and returns `None`.
pub fn run_participant<T, K, F>(
    transport: &T,
    kernel: K,
    config: &JobConfig,
    operands: F,
) -> Result<Option<JobOutput>>
where
    T: Transport,
    K: Kernel,
    F: FnOnce() -> (Matrix, Matrix),
{
    if transport.rank() == ROOT {
        let (a, b) = operands();
        Coordinator::new(transport, kernel, config.timeout)
            .run_timed(&a, &b)
            .map(Some)
    } else {
        Worker::new(transport, kernel, config.worker_timeout)
            .run()
            .map(|()| None)
    }
}

/// Run a complete job inside this process, one thread per participant.
///
/// The coordinator runs on the calling thread. Its endpoint is dropped as soon as it
/// returns, so workers still waiting on it are released with a disconnect when the run
/// is aborted early. The coordinator's error takes precedence over any worker's.
pub fn run_threaded<K>(
    a: &Matrix,
    b: &Matrix,
    participants: i32,
    kernel: K,
    timeout: Duration,
) -> Result<JobOutput>
where
    K: Kernel + Clone,
{
    let mut endpoints = LocalTransport::cluster(participants)?;
    let root = endpoints.remove(0);

    std::thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let kernel = kernel.clone();
                scope.spawn(move || Worker::new(endpoint, kernel, None).run())
            })
            .collect();

        let outcome = Coordinator::new(root, kernel, timeout).run_timed(a, b);

        let mut worker_error = None;
        for (i, handle) in handles.into_iter().enumerate() {
            let rank = i + 1;
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Worker {} exited with: {}", rank, e);
                    worker_error.get_or_insert(e);
                }
                Err(_) => {
                    worker_error.get_or_insert(MatMulError::ProcessError(format!(
                        "worker thread {rank} panicked"
                    )));
                }
            }
        }

        match (outcome, worker_error) {
            (Err(e), _) | (Ok(_), Some(e)) => Err(e),
            (Ok(output), None) => Ok(output),
        }
    })
}

/// Run the job described by `config` on its configured transport.
///
/// Returns the product on the coordinator and `None` on spawned worker processes.
pub fn run<K>(config: &JobConfig, kernel: K) -> Result<Option<JobOutput>>
where
    K: Kernel + Clone,
{
    run_with(config, kernel, || random_operands(config))
}

/// Like [`run`], with the coordinator's operands supplied by `operands`.
///
/// `operands` is called at most once, and only on rank 0.
pub fn run_with<K, F>(config: &JobConfig, kernel: K, operands: F) -> Result<Option<JobOutput>>
where
    K: Kernel + Clone,
    F: FnOnce() -> (Matrix, Matrix),
{
    config.validate()?;
    match config.transport {
        TransportKind::Local => {
            let (a, b) = operands();
            run_threaded(&a, &b, config.participants, kernel, config.timeout).map(Some)
        }
        TransportKind::Shmem => {
            let world =
                ShmemTransport::init(config.participants, config.slot_bytes, Some(config.timeout))?;
            info!("Process {} of {} initialized", world.rank(), world.size());
            let output = run_participant(&world, kernel, config, operands)?;
            world.finalize()?;
            Ok(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{multiply, NaiveKernel};

    #[test]
    fn seeded_operands_are_reproducible() {
        let config = JobConfig {
            dimension: 5,
            seed: Some(42),
            ..JobConfig::default()
        };
        assert_eq!(random_operands(&config), random_operands(&config));
        let (a, _) = random_operands(&config);
        assert!(a.as_slice().iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn threaded_run_matches_reference() {
        let config = JobConfig {
            dimension: 23,
            seed: Some(1),
            ..JobConfig::default()
        };
        let (a, b) = random_operands(&config);
        let out = run_threaded(&a, &b, 4, NaiveKernel, Duration::from_secs(10)).unwrap();
        assert!(out.result.approx_eq(&multiply(&a, &b).unwrap(), 1e-9));
    }

    #[test]
    fn run_uses_local_transport() {
        let config = JobConfig {
            dimension: 9,
            participants: 3,
            seed: Some(3),
            ..JobConfig::default()
        };
        let out = run(&config, NaiveKernel).unwrap().unwrap();
        let (a, b) = random_operands(&config);
        assert!(out.result.approx_eq(&multiply(&a, &b).unwrap(), 1e-9));
    }

    #[test]
    fn run_with_uses_the_supplied_operands_once() {
        let config = JobConfig {
            participants: 2,
            ..JobConfig::default()
        };
        let a = Matrix::from_rows(vec![vec![1.0, 0.0], vec![0.0, 2.0], vec![3.0, 1.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![4.0], vec![5.0]]).unwrap();
        let mut calls = 0;

        let out = run_with(&config, NaiveKernel, || {
            calls += 1;
            (a.clone(), b.clone())
        })
        .unwrap()
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(out.result.as_slice(), &[4.0, 10.0, 17.0]);
    }

    #[test]
    fn run_rejects_invalid_configuration() {
        let config = JobConfig {
            participants: 0,
            ..JobConfig::default()
        };
        assert!(matches!(
            run(&config, NaiveKernel),
            Err(MatMulError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn aborted_run_releases_workers() {
        let a = Matrix::zeros(4, 3);
        let b = Matrix::zeros(4, 4);
        let err = run_threaded(&a, &b, 3, NaiveKernel, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, MatMulError::DimensionMismatch { .. }));
    }
}
