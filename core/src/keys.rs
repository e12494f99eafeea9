//! Identifiers: submissions, directors, nodes and their cross-process string
//! forms.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
	#[error("invalid director id `{0}`: only [A-Za-z0-9_-] is allowed")]
	InvalidDirectorId(String),

	#[error("invalid job id: {0}")]
	InvalidJobId(String),

	#[error("invalid fingerprint: {0}")]
	InvalidFingerprint(String),

	#[error("invalid key format: {0}")]
	InvalidFormat(String),

	#[error("invalid tag `{0}`: tags must be non-empty and free of `,`, `#` and `/`")]
	InvalidTag(String),
}

/// 128-bit identifier of a submission; caller-provided or generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
	/// Generate a random id.
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub const fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for JobId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for JobId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for JobId {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| KeyError::InvalidJobId(e.to_string()))
	}
}

impl From<Uuid> for JobId {
	fn from(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

/// Identifier of a director instance; restricted to `[A-Za-z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectorId(String);

impl DirectorId {
	pub fn new(id: impl Into<String>) -> Result<Self, KeyError> {
		let id = id.into();
		if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
		{
			return Err(KeyError::InvalidDirectorId(id));
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DirectorId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for DirectorId {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

/// Identity of one node within a submission.
///
/// Printed as `job://{jobId}/{base64url-fingerprint}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
	pub id: JobId,
	pub fingerprint: Fingerprint,
}

const JOB_SCHEME: &str = "job://";

impl JobKey {
	pub const fn new(id: JobId, fingerprint: Fingerprint) -> Self {
		Self { id, fingerprint }
	}
}

impl fmt::Display for JobKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{JOB_SCHEME}{}/{}", self.id, self.fingerprint.to_base64url())
	}
}

impl FromStr for JobKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let rest = s
			.strip_prefix(JOB_SCHEME)
			.ok_or_else(|| KeyError::InvalidFormat(format!("expected `{JOB_SCHEME}` prefix in `{s}`")))?;
		let (id, fingerprint) = rest
			.split_once('/')
			.ok_or_else(|| KeyError::InvalidFormat(format!("missing fingerprint segment in `{s}`")))?;

		Ok(Self {
			id: id.parse()?,
			fingerprint: Fingerprint::from_base64url(fingerprint)
				.map_err(|e| KeyError::InvalidFingerprint(e.to_string()))?,
		})
	}
}

fn validate_tag(tag: &str) -> Result<(), KeyError> {
	if tag.is_empty() || tag.contains([',', '#', '/']) {
		return Err(KeyError::InvalidTag(tag.to_owned()));
	}
	Ok(())
}

/// Cross-process handle to a node owned by a specific director, with optional
/// opaque tags for external integrations.
///
/// Printed as `director://{directorId}#job://{jobId}/{fingerprint}[#t1,t2]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalJobKey {
	pub director: DirectorId,
	pub key: JobKey,
	pub tags: Vec<String>,
}

const DIRECTOR_SCHEME: &str = "director://";

impl ExternalJobKey {
	pub fn new(director: DirectorId, key: JobKey) -> Self {
		Self { director, key, tags: Vec::new() }
	}

	pub fn with_tags(
		director: DirectorId,
		key: JobKey,
		tags: impl IntoIterator<Item = impl Into<String>>,
	) -> Result<Self, KeyError> {
		let tags = tags.into_iter().map(Into::into).collect::<Vec<_>>();
		for tag in &tags {
			validate_tag(tag)?;
		}
		Ok(Self { director, key, tags })
	}
}

impl fmt::Display for ExternalJobKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{DIRECTOR_SCHEME}{}#{}", self.director, self.key)?;
		if !self.tags.is_empty() {
			write!(f, "#{}", self.tags.join(","))?;
		}
		Ok(())
	}
}

impl FromStr for ExternalJobKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let rest = s.strip_prefix(DIRECTOR_SCHEME).ok_or_else(|| {
			KeyError::InvalidFormat(format!("expected `{DIRECTOR_SCHEME}` prefix in `{s}`"))
		})?;
		let (director, key) = rest
			.split_once('#')
			.ok_or_else(|| KeyError::InvalidFormat(format!("missing job key fragment in `{s}`")))?;

		let (key, tags) = match key.split_once('#') {
			Some((key, tags)) => {
				let tags = tags.split(',').map(str::to_owned).collect::<Vec<_>>();
				for tag in &tags {
					validate_tag(tag)?;
				}
				(key, tags)
			}
			None => (key, Vec::new()),
		};

		Ok(Self {
			director: director.parse()?,
			key: key.parse()?,
			tags,
		})
	}
}
