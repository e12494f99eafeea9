//! Durable submission storage: one package per submission holding the
//! encoded root job and its result table.

mod lock;
mod package;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::JobError, keys::JobId};

pub use package::PackageStore;
pub(crate) use package::PACKAGE_EXT;

/// One live submission record.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
	pub job_id: JobId,
	pub type_id: String,
	pub encoded: Vec<u8>,
	pub dedup_expires_at: DateTime<Utc>,
}

/// On-disk image of the `_.job-submission` file.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SubmissionEnvelope {
	pub job: TypedJob,
	pub exp: DateTime<Utc>,
}

/// Typed wrapper keying the encoded job by its registered type id.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TypedJob {
	#[serde(rename = "@type")]
	pub type_id: String,
	pub value: Vec<u8>,
}

/// Terminal state of one node, as persisted in its result row.
///
/// A row exists iff `execute` ran to termination; caught failures are rows
/// too. Success carries the canonical encoding of the produced value.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum StoredResult {
	Success(Vec<u8>),
	Failure(JobError),
}
