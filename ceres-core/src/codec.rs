//! Fixed-width datapoint codec
//!
//! Every slice record is a big-endian IEEE-754 double. There is no header or
//! framing; record `N` lives at byte `N * RECORD_SIZE`. A NaN record marks
//! an interval with no sample.

use crate::{CeresError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Size in bytes of one encoded value
pub const RECORD_SIZE: usize = 8;

/// Encoded NaN, used to fill gaps inside a slice
pub const PACKED_NAN: [u8; RECORD_SIZE] = [0x7f, 0xf8, 0, 0, 0, 0, 0, 0];

/// Encode a single value
pub fn encode_value(value: f64) -> [u8; RECORD_SIZE] {
    value.to_be_bytes()
}

/// Decode a single record
pub fn decode_value(bytes: [u8; RECORD_SIZE]) -> f64 {
    f64::from_be_bytes(bytes)
}

/// Encode a run of values back to back
pub fn encode_run<I>(values: I) -> BytesMut
where
    I: IntoIterator<Item = f64>,
{
    let values = values.into_iter();
    let mut buf = BytesMut::with_capacity(values.size_hint().0 * RECORD_SIZE);
    for value in values {
        buf.put_f64(value);
    }
    buf
}

/// `count` NaN records
pub fn encode_gap(count: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(count * RECORD_SIZE);
    for _ in 0..count {
        buf.put_slice(&PACKED_NAN);
    }
    buf
}

/// Decode a buffer of records. NaN is passed through untouched.
pub fn decode_run(mut bytes: &[u8]) -> Result<Vec<f64>> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(CeresError::CorruptData(format!(
            "{} bytes is not a multiple of the {} byte record size",
            bytes.len(),
            RECORD_SIZE
        )));
    }
    let mut values = Vec::with_capacity(bytes.len() / RECORD_SIZE);
    while bytes.has_remaining() {
        values.push(bytes.get_f64());
    }
    Ok(values)
}
