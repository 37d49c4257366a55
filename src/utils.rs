use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Decode the given bytes as a UUID key.
pub fn decode_uuid(val: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(val).with_context(|| format!("invalid byte array given to decode as uuid, invalid len {} needed 16", val.len()))
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(model).context("error serializing data model")
}

/// Decode an object from the given buffer.
pub fn decode_model<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding object from storage")
}

/// The current time as a unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
