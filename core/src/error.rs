//! Error taxonomy for the job director and the serializable envelope that
//! carries failures across process boundaries.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoding::{self, EncodingError};

/// Result type for director operations.
pub type JobResult<T = ()> = Result<T, JobError>;

/// Domain under which the director's own failures are boxed.
pub const CORE_ERROR_DOMAIN: &str = "kubrick.core";

/// Failures produced while resolving or executing jobs.
///
/// Every variant is serializable so that persisted results can carry the
/// failure that terminated a node; user failures travel inside an
/// [`ErrorEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum JobError {
	/// The surrounding task was cancelled before the node terminated.
	#[error("job was cancelled")]
	Cancelled,

	/// A bug in binding plumbing; fatal to the node.
	#[error("invariant violation: {0}")]
	Invariant(InvariantViolation),

	/// A job reached execution with one or more unbound inputs.
	#[error("job `{job_type}` has unbound inputs: {input_types:?}")]
	UnboundInputs {
		job_type: String,
		input_types: Vec<String>,
	},

	/// Composite of sibling input failures. Ordering of the contained errors
	/// is not guaranteed.
	#[error("{} sibling inputs failed", .errors.len())]
	MultipleInputsFailed { errors: Vec<JobError> },

	/// An external operation was attempted while the director was not
	/// running.
	#[error("director is {actual}, operation requires {required}")]
	DirectorState { required: String, actual: String },

	/// Control signal raised by `transfer_to_principal` on an assistant
	/// director. Not a real failure: it bypasses result persistence and
	/// releases the package lock so the principal can take the job over.
	#[error("job transferred to the principal director")]
	TransferToPrincipal,

	/// Submission or result store failure.
	#[error("store failure: {0}")]
	Store(String),

	/// Canonical encoding failure.
	#[error("encoding failure: {0}")]
	Encoding(String),

	/// Filesystem failure.
	#[error("I/O failure: {0}")]
	Io(String),

	/// A failure raised by user code, boxed via the error envelope.
	#[error("{0}")]
	User(ErrorEnvelope),
}

/// Binding-plumbing bugs surfaced as node failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "kebab-case")]
pub enum InvariantViolation {
	#[error("input result missing")]
	InputResultMissing,

	#[error("input result invalid")]
	InputResultInvalid,

	#[error("execute invoked with failed input")]
	ExecuteInvokedWithFailedInput,
}

/// User error types that survive serialization.
///
/// Implementors pick a stable domain string; the value itself round-trips
/// through the canonical encoding.
pub trait UserJobError:
	std::error::Error + Serialize + serde::de::DeserializeOwned + Send + Sync + 'static
{
	const DOMAIN: &'static str;
}

impl JobError {
	pub fn store(message: impl fmt::Display) -> Self {
		Self::Store(message.to_string())
	}

	pub fn io(message: impl fmt::Display) -> Self {
		Self::Io(message.to_string())
	}

	/// Box a user error into its envelope.
	pub fn user<E: UserJobError>(error: &E) -> Self {
		match encoding::encode(error) {
			Ok(bytes) => Self::User(ErrorEnvelope {
				storage: ErrorStorage::Codable,
				domain: E::DOMAIN.to_owned(),
				error: ErrorValue::Codable(bytes),
			}),
			Err(_) => Self::native_in(E::DOMAIN, error, 0),
		}
	}

	/// Box an arbitrary failure as an opaque native error.
	pub fn native(message: impl fmt::Display) -> Self {
		Self::native_in("error", message, 0)
	}

	pub fn native_in(domain: impl Into<String>, message: impl fmt::Display, code: i64) -> Self {
		Self::User(ErrorEnvelope {
			storage: ErrorStorage::Native,
			domain: domain.into(),
			error: ErrorValue::Native { message: message.to_string(), code },
		})
	}

	/// Recover the original user error value, if this failure carries one in
	/// `E`'s domain.
	pub fn downcast_user<E: UserJobError>(&self) -> Option<E> {
		let Self::User(envelope) = self else { return None };
		if envelope.domain != E::DOMAIN {
			return None;
		}
		let ErrorValue::Codable(bytes) = &envelope.error else { return None };
		encoding::decode(bytes).ok()
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}

	/// The envelope image of this failure, used wherever failures must be
	/// absorbed into a fingerprint or shipped across processes.
	pub fn envelope(&self) -> ErrorEnvelope {
		match self {
			Self::User(envelope) => envelope.clone(),
			other => ErrorEnvelope {
				storage: ErrorStorage::Codable,
				domain: CORE_ERROR_DOMAIN.to_owned(),
				error: match encoding::encode(other) {
					Ok(bytes) => ErrorValue::Codable(bytes),
					Err(_) => ErrorValue::Native { message: other.to_string(), code: 0 },
				},
			},
		}
	}
}

impl From<std::io::Error> for JobError {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err.to_string())
	}
}

impl From<EncodingError> for JobError {
	fn from(err: EncodingError) -> Self {
		Self::Encoding(err.to_string())
	}
}

/// Serializable envelope for failures crossing process boundaries.
///
/// `codable` storage means a registered type resolver can restore the user
/// value from `error`; `native` carries only the platform-general message and
/// code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
	pub storage: ErrorStorage,
	pub domain: String,
	pub error: ErrorValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStorage {
	Codable,
	Native,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorValue {
	Codable(Vec<u8>),
	Native { message: String, code: i64 },
}

impl fmt::Display for ErrorEnvelope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.error {
			ErrorValue::Native { message, code } => {
				write!(f, "[{}] {message} (code {code})", self.domain)
			}
			ErrorValue::Codable(_) => write!(f, "[{}] user error", self.domain),
		}
	}
}

type ValidateFn = fn(&[u8]) -> bool;

/// Registry of user error domains known to this director.
///
/// Persisted failures pass through [`rehydrate`](Self::rehydrate) when read
/// back: codable envelopes in unknown domains are downgraded to opaque native
/// errors rather than surfacing undecodable payloads.
#[derive(Default)]
pub struct ErrorTypeRegistry {
	domains: HashMap<&'static str, ValidateFn>,
}

impl ErrorTypeRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<E: UserJobError>(&mut self) {
		self.domains.insert(E::DOMAIN, |bytes| encoding::decode::<E>(bytes).is_ok());
	}

	pub fn contains(&self, domain: &str) -> bool {
		self.domains.contains_key(domain)
	}

	pub(crate) fn rehydrate(&self, error: JobError) -> JobError {
		match error {
			JobError::User(envelope) => JobError::User(self.rehydrate_envelope(envelope)),
			JobError::MultipleInputsFailed { errors } => JobError::MultipleInputsFailed {
				errors: errors.into_iter().map(|e| self.rehydrate(e)).collect(),
			},
			other => other,
		}
	}

	fn rehydrate_envelope(&self, envelope: ErrorEnvelope) -> ErrorEnvelope {
		match (&envelope.storage, &envelope.error) {
			(ErrorStorage::Codable, ErrorValue::Codable(bytes)) => {
				let known = envelope.domain == CORE_ERROR_DOMAIN
					|| self.domains.get(envelope.domain.as_str()).is_some_and(|validate| validate(bytes));
				if known {
					envelope
				} else {
					ErrorEnvelope {
						storage: ErrorStorage::Native,
						error: ErrorValue::Native {
							message: format!("unrecognized error in domain `{}`", envelope.domain),
							code: 0,
						},
						domain: envelope.domain,
					}
				}
			}
			_ => envelope,
		}
	}
}
