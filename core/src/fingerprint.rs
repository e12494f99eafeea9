//! Deterministic content addresses for resolved job nodes.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const FINGERPRINT_LEN: usize = 32;

/// SHA-256 identity of a `(job type, resolved inputs)` pair.
///
/// Two instances of the same job type with byte-identical resolved inputs
/// produce the same fingerprint, in any process, on any run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

#[derive(Debug, Error)]
#[error("invalid fingerprint encoding: {0}")]
pub struct InvalidFingerprint(String);

impl Fingerprint {
	/// Digest a node identity.
	///
	/// Absorbs the job's type id, then each resolved input in descriptor
	/// order: the input's declared type name followed by its canonical byte
	/// image (the encoded value on success, the encoded error envelope on
	/// failure). Success and failure participate symmetrically so a failing
	/// dependency never collides with a successful one.
	pub fn digest<'a>(
		type_id: &str,
		inputs: impl IntoIterator<Item = (&'a str, &'a [u8])>,
	) -> Self {
		let mut hasher = Sha256::new();
		hasher.update(type_id.as_bytes());
		for (reported_type, canonical) in inputs {
			hasher.update(reported_type.as_bytes());
			hasher.update(canonical);
		}
		Self(hasher.finalize().into())
	}

	pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
		Self(bytes)
	}

	pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
		&self.0
	}

	/// URL-safe unpadded base64, as used in result file names and external
	/// keys.
	pub fn to_base64url(&self) -> String {
		URL_SAFE_NO_PAD.encode(self.0)
	}

	pub fn from_base64url(encoded: &str) -> Result<Self, InvalidFingerprint> {
		let bytes = URL_SAFE_NO_PAD
			.decode(encoded)
			.map_err(|e| InvalidFingerprint(e.to_string()))?;
		let bytes: [u8; FINGERPRINT_LEN] = bytes
			.try_into()
			.map_err(|_| InvalidFingerprint(format!("expected {FINGERPRINT_LEN} bytes")))?;
		Ok(Self(bytes))
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64url())
	}
}

impl fmt::Debug for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Fingerprint({})", hex::encode(self.0))
	}
}
