//! Job parameters, read from the environment and overridden by positional arguments.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MatMulError, Result};
use crate::transport::shmem::MAX_PROCS;

pub const ENV_DIMENSION: &str = "MATMUL_DIMENSION";
pub const ENV_PROCS: &str = "MATMUL_PROCS";
pub const ENV_TIMEOUT_MS: &str = "MATMUL_TIMEOUT_MS";
pub const ENV_WORKER_TIMEOUT_MS: &str = "MATMUL_WORKER_TIMEOUT_MS";
pub const ENV_SLOT_BYTES: &str = "MATMUL_SLOT_BYTES";
pub const ENV_SEED: &str = "MATMUL_SEED";
pub const ENV_TRANSPORT: &str = "MATMUL_TRANSPORT";

/// Which [`Transport`](crate::transport::Transport) carries the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Threads in this process.
    Local,
    /// Processes on this machine sharing a memory segment.
    Shmem,
}

impl FromStr for TransportKind {
    type Err = MatMulError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(TransportKind::Local),
            "shmem" => Ok(TransportKind::Shmem),
            other => Err(MatMulError::InvalidConfiguration(format!(
                "unknown transport {other:?}, expected \"local\" or \"shmem\""
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => f.write_str("local"),
            TransportKind::Shmem => f.write_str("shmem"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobConfig {
    /// `N` for the `N x N` operands.
    pub dimension: usize,
    /// `P`, including the coordinator.
    pub participants: i32,
    /// Coordinator's deadline for each pending receive from a worker.
    pub timeout: Duration,
    /// Worker's deadline for each receive; `None` waits for as long as it takes.
    pub worker_timeout: Option<Duration>,
    /// Payload capacity of a shared-memory slot.
    pub slot_bytes: usize,
    /// Seed for operand generation; `None` draws from entropy.
    pub seed: Option<u64>,
    pub transport: TransportKind,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            dimension: 4000,
            participants: 4,
            timeout: Duration::from_secs(60),
            worker_timeout: None,
            slot_bytes: 1024 * 1024,
            seed: None,
            transport: TransportKind::Local,
        }
    }
}

impl JobConfig {
    /// Defaults overridden by any `MATMUL_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_DIMENSION) {
            config.dimension = parse(ENV_DIMENSION, &v)?;
        }
        if let Some(v) = lookup(ENV_PROCS) {
            config.participants = parse(ENV_PROCS, &v)?;
        }
        if let Some(v) = lookup(ENV_TIMEOUT_MS) {
            config.timeout = Duration::from_millis(parse(ENV_TIMEOUT_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_WORKER_TIMEOUT_MS) {
            config.worker_timeout = Some(Duration::from_millis(parse(ENV_WORKER_TIMEOUT_MS, &v)?));
        }
        if let Some(v) = lookup(ENV_SLOT_BYTES) {
            config.slot_bytes = parse(ENV_SLOT_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_SEED) {
            config.seed = Some(parse(ENV_SEED, &v)?);
        }
        if let Some(v) = lookup(ENV_TRANSPORT) {
            config.transport = v.parse()?;
        }
        Ok(config)
    }

    /// Apply positional overrides `[transport] [N] [P]`, program name excluded.
    pub fn with_args<I, S>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        if let Some(transport) = args.next() {
            self.transport = transport.as_ref().parse()?;
        }
        if let Some(n) = args.next() {
            self.dimension = parse("N", n.as_ref())?;
        }
        if let Some(p) = args.next() {
            self.participants = parse("P", p.as_ref())?;
        }
        if let Some(extra) = args.next() {
            return Err(MatMulError::InvalidConfiguration(format!(
                "unexpected argument {:?}",
                extra.as_ref()
            )));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.participants <= 0 {
            return Err(MatMulError::InvalidConfiguration(format!(
                "participant count must be positive, got {}",
                self.participants
            )));
        }
        if self.transport == TransportKind::Shmem && self.participants as usize > MAX_PROCS {
            return Err(MatMulError::InvalidConfiguration(format!(
                "shared-memory transport supports at most {MAX_PROCS} processes, got {}",
                self.participants
            )));
        }
        if self.timeout.is_zero() || self.worker_timeout.is_some_and(|t| t.is_zero()) {
            return Err(MatMulError::InvalidConfiguration(
                "timeouts must be non-zero".into(),
            ));
        }
        if self.slot_bytes == 0 {
            return Err(MatMulError::InvalidConfiguration(
                "slot size must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| MatMulError::InvalidConfiguration(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_workload() {
        let config = JobConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, JobConfig::default());
        assert_eq!(config.dimension, 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let config = JobConfig::from_lookup(lookup(&[
            (ENV_DIMENSION, "12"),
            (ENV_PROCS, "3"),
            (ENV_TIMEOUT_MS, "250"),
            (ENV_WORKER_TIMEOUT_MS, "500"),
            (ENV_SEED, "7"),
            (ENV_TRANSPORT, "shmem"),
        ]))
        .unwrap();
        assert_eq!(config.dimension, 12);
        assert_eq!(config.participants, 3);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.worker_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.transport, TransportKind::Shmem);
    }

    #[test]
    fn malformed_env_is_rejected() {
        let err = JobConfig::from_lookup(lookup(&[(ENV_PROCS, "four")])).unwrap_err();
        assert!(matches!(err, MatMulError::InvalidConfiguration(_)));
        assert!(JobConfig::from_lookup(lookup(&[(ENV_TRANSPORT, "mpi")])).is_err());
    }

    #[test]
    fn positional_args() {
        let config = JobConfig::default().with_args(["shmem", "100", "5"]).unwrap();
        assert_eq!(config.transport, TransportKind::Shmem);
        assert_eq!(config.dimension, 100);
        assert_eq!(config.participants, 5);

        let partial = JobConfig::default().with_args(["local"]).unwrap();
        assert_eq!(partial.participants, 4);

        assert!(JobConfig::default().with_args(["local", "1", "2", "3"]).is_err());
    }

    #[test]
    fn validation() {
        let config = JobConfig::default().with_args(["local", "10", "0"]).unwrap();
        assert!(config.validate().is_err());

        let config = JobConfig::default().with_args(["local", "10", "-3"]).unwrap();
        assert!(config.validate().is_err());

        let config = JobConfig::default().with_args(["shmem", "10", "64"]).unwrap();
        assert!(config.validate().is_err());

        let config = JobConfig {
            timeout: Duration::ZERO,
            ..JobConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
