//! Dynamic jobs: resolving further jobs from inside an executing one, under
//! the same submission.

use crate::{
	director::JobDirector,
	encoding::JobValue,
	error::{JobError, JobResult},
	jobs::IntoJob,
	keys::JobId,
	scope::ExecutionScope,
};

/// Façade through which an executing job resolves additional jobs.
///
/// Resolution keys by fingerprint, so running the same job with identical
/// inputs twice executes it once; differing inputs run distinctly.
#[derive(Clone)]
pub struct DynamicJobDirector {
	director: JobDirector,
	submission: JobId,
}

impl DynamicJobDirector {
	/// The dynamic director of the currently executing job.
	///
	/// # Panics
	///
	/// Panics outside of a job execution scope.
	pub fn current() -> Self {
		let scope = ExecutionScope::current();
		Self {
			director: scope.director(),
			submission: scope.job_key().id,
		}
	}

	pub fn director(&self) -> &JobDirector {
		&self.director
	}

	/// Resolve `job` under the current submission, propagating its failure.
	pub async fn run<V: JobValue>(&self, job: impl IntoJob<V>) -> JobResult<V> {
		let (_, outcome) = job
			.into_job()
			.resolve(self.director.clone(), self.submission)
			.await;
		outcome.map(|resolved| resolved.value)
	}

	/// Resolve `job` and hand back its outcome as a value for branching,
	/// instead of propagating the failure.
	pub async fn result<V: JobValue>(&self, job: impl IntoJob<V>) -> Result<V, JobError> {
		self.run(job).await
	}
}
