//! Framing of the payloads that travel over a [`Transport`](crate::transport::Transport).
//!
//! Every frame starts with one kind byte. Matrix frames carry `rows` and `cols` as
//! little-endian `u64`, then the elements as raw native-endian `f64` bytes; control
//! frames carry a bincode-encoded [`Control`].

use serde::{Deserialize, Serialize};

use crate::error::{MatMulError, Result};
use crate::matrix::{Matrix, RowBlock};

const KIND_MATRIX: u8 = 0;
const KIND_CONTROL: u8 = 1;
const DIMS_SIZE: usize = 16;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Control {
    /// Row offset of the block sent (or returned) on the paired matrix channel.
    Offset(u64),
    /// The sender could not produce its block.
    Failure { reason: String },
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Matrix(Matrix),
    Control(Control),
}

impl Payload {
    /// Short description for diagnostics, without the element data.
    pub fn summary(&self) -> String {
        match self {
            Payload::Matrix(m) => format!("{}x{} matrix", m.rows(), m.cols()),
            Payload::Control(c) => format!("{c:?}"),
        }
    }
}

pub fn encode_block(block: RowBlock<'_>) -> Vec<u8> {
    let elements: &[u8] = bytemuck::cast_slice(block.as_slice());
    let mut frame = Vec::with_capacity(1 + DIMS_SIZE + elements.len());
    frame.push(KIND_MATRIX);
    frame.extend_from_slice(&(block.rows() as u64).to_le_bytes());
    frame.extend_from_slice(&(block.cols() as u64).to_le_bytes());
    frame.extend_from_slice(elements);
    frame
}

pub fn encode_control(control: &Control) -> Result<Vec<u8>> {
    let mut frame = vec![KIND_CONTROL];
    bincode::serialize_into(&mut frame, control)?;
    Ok(frame)
}

pub fn encode_offset(offset: usize) -> Result<Vec<u8>> {
    encode_control(&Control::Offset(offset as u64))
}

pub fn decode(frame: &[u8]) -> Result<Payload> {
    let (&kind, body) = frame
        .split_first()
        .ok_or_else(|| MatMulError::SerializationError("empty frame".into()))?;
    match kind {
        KIND_MATRIX => decode_matrix(body).map(Payload::Matrix),
        KIND_CONTROL => Ok(Payload::Control(bincode::deserialize(body)?)),
        other => Err(MatMulError::SerializationError(format!(
            "unknown frame kind {other}"
        ))),
    }
}

fn decode_matrix(body: &[u8]) -> Result<Matrix> {
    if body.len() < DIMS_SIZE {
        return Err(MatMulError::SerializationError(format!(
            "matrix frame too short: {} bytes",
            body.len()
        )));
    }
    let (dims, elements) = body.split_at(DIMS_SIZE);
    let rows = read_dim(&dims[..8])?;
    let cols = read_dim(&dims[8..])?;

    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(std::mem::size_of::<f64>()))
        .ok_or_else(|| MatMulError::SerializationError(format!("{rows}x{cols} overflows")))?;
    if elements.len() != expected {
        return Err(MatMulError::SerializationError(format!(
            "{rows}x{cols} matrix needs {expected} bytes, frame has {}",
            elements.len()
        )));
    }

    // The body is generally not 8-byte aligned, so copy into f64 storage rather than
    // casting the frame in place.
    let mut data = vec![0.0f64; rows * cols];
    bytemuck::cast_slice_mut::<f64, u8>(&mut data).copy_from_slice(elements);
    Matrix::from_vec(rows, cols, data)
}

fn read_dim(bytes: &[u8]) -> Result<usize> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    usize::try_from(u64::from_le_bytes(raw))
        .map_err(|_| MatMulError::SerializationError("dimension exceeds usize".into()))
}
