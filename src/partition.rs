//! Row-block decomposition of a matrix over a fixed set of participants.

use crate::error::{MatMulError, Result};

/// One participant's share of the rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: i32,
    pub row_offset: usize,
    pub row_count: usize,
}

/// Contiguous, non-overlapping row ranges covering `[0, rows)`, one per participant.
///
/// Every participant gets `rows / participants` rows; the first `rows % participants`
/// participants get one extra, so lower ranks absorb the remainder. The coordinator
/// (rank 0) is always the first entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionPlan {
    rows: usize,
    entries: Vec<Assignment>,
}

impl PartitionPlan {
    pub fn compute(rows: i64, participants: i32) -> Result<Self> {
        if participants <= 0 {
            return Err(MatMulError::InvalidConfiguration(format!(
                "participant count must be positive, got {participants}"
            )));
        }
        let rows = usize::try_from(rows).map_err(|_| {
            MatMulError::InvalidConfiguration(format!("row count must be non-negative, got {rows}"))
        })?;

        let p = participants as usize;
        let base = rows / p;
        let extra = rows % p;

        let mut offset = 0;
        let entries = (0..p)
            .map(|i| {
                let row_count = base + usize::from(i < extra);
                let entry = Assignment {
                    worker_id: i as i32,
                    row_offset: offset,
                    row_count,
                };
                offset += row_count;
                entry
            })
            .collect();

        Ok(Self { rows, entries })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn entries(&self) -> &[Assignment] {
        &self.entries
    }

    pub fn participants(&self) -> i32 {
        self.entries.len() as i32
    }

    pub fn get(&self, worker_id: i32) -> Option<&Assignment> {
        usize::try_from(worker_id)
            .ok()
            .and_then(|i| self.entries.get(i))
    }

    /// Entries for ranks `1..P`, i.e. everyone but the coordinator.
    pub fn workers(&self) -> &[Assignment] {
        &self.entries[1..]
    }
}
