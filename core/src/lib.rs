//! Kubrick: a persistent, idempotent, dependency-driven job director.
//!
//! A client submits a submittable root job; the director resolves its input
//! tree in parallel, fingerprints every node, executes each distinct
//! `(submission, fingerprint)` node at most once, and persists intermediate
//! results so completed work survives process restarts. Two directors sharing
//! a store — one principal, any number of assistants — coordinate through
//! advisory file locks so jobs started in an assistant can be completed by
//! the principal.

pub mod director;
pub mod dynamic;
pub mod encoding;
pub mod error;
pub mod fingerprint;
pub mod injection;
pub mod inputs;
pub mod jobs;
pub mod keys;
pub mod registry;
mod resolver;
pub mod scope;
pub mod store;
pub mod watcher;

// Re-export commonly used types
pub mod prelude {
	pub use crate::{
		director::{DirectorRole, DirectorState, JobDirector, JobDirectorBuilder},
		dynamic::DynamicJobDirector,
		encoding::JobValue,
		error::{ErrorEnvelope, JobError, JobResult, UserJobError},
		fingerprint::Fingerprint,
		injection::injected,
		inputs::{InputDescriptor, JobBuilder, JobInput},
		jobs::{max_attempts, AnyJob, IntoJob, Job, JobExt, SubmittableJob},
		keys::{DirectorId, ExternalJobKey, JobId, JobKey},
		scope::ExecutionScope,
	};

	pub use async_trait::async_trait;
}

pub use director::JobDirector;
pub use error::{JobError, JobResult};
