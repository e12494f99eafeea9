//! Canonical binary encoding for job values, persisted records and error
//! envelopes.
//!
//! One deterministic encoder is used for everything that is hashed or
//! persisted: MessagePack with named struct fields. Struct fields serialize in
//! declaration order, which makes the byte image stable across processes
//! (invariant: the same logical value always produces the same bytes). Maps in
//! values that are fingerprinted or persisted must be `BTreeMap` so that key
//! order is defined.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// The value set jobs may produce or consume.
///
/// Blanket-implemented for every type that is deterministically serializable
/// and restorable. The unit type `()` is the value of executable jobs.
pub trait JobValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> JobValue for T {}

#[derive(Debug, Error)]
pub enum EncodingError {
	#[error("encode failed: {0}")]
	Encode(#[from] rmp_serde::encode::Error),

	#[error("decode failed: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a value with the canonical encoder.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodingError> {
	Ok(rmp_serde::to_vec_named(value)?)
}

/// Restore a value previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EncodingError> {
	Ok(rmp_serde::from_slice(bytes)?)
}
