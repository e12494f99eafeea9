//! The ambient execution scope: the task-local trio `{director, job key,
//! input results}` installed around every `execute`.

use std::{future::Future, sync::Arc};

use crate::{
	director::JobDirector,
	encoding::JobValue,
	error::{JobError, JobResult},
	inputs::{InputId, ResolvedInputs},
	keys::{ExternalJobKey, JobKey},
};

tokio::task_local! {
	static SCOPE: ExecutionScope;
}

/// Ambient state available to user code while a job executes.
///
/// Scopes nest LIFO around `execute`, `catch`, `map` and `retry` boundaries;
/// at most one is active on any logical thread of execution.
#[derive(Clone)]
pub struct ExecutionScope {
	director: JobDirector,
	job_key: JobKey,
	inputs: Arc<ResolvedInputs>,
}

impl ExecutionScope {
	pub(crate) fn new(director: JobDirector, job_key: JobKey, inputs: Arc<ResolvedInputs>) -> Self {
		Self { director, job_key, inputs }
	}

	/// Run `fut` with this scope installed.
	pub(crate) async fn enter<F: Future>(self, fut: F) -> F::Output {
		SCOPE.scope(self, fut).await
	}

	/// The active scope.
	///
	/// # Panics
	///
	/// Panics outside of a job execution scope; reading executing-job state
	/// anywhere else is a programming error.
	pub fn current() -> Self {
		Self::try_current()
			.expect("executing-job state accessed outside of a job execution scope")
	}

	pub fn try_current() -> Option<Self> {
		SCOPE.try_with(Clone::clone).ok()
	}

	/// The director executing the current job.
	pub fn director(&self) -> JobDirector {
		self.director.clone()
	}

	/// The key of the currently executing node.
	pub fn job_key(&self) -> JobKey {
		self.job_key
	}

	/// The resolved inputs of the currently executing node.
	pub fn input_results(&self) -> &ResolvedInputs {
		&self.inputs
	}

	/// Mint the cross-process handle for the current node, tagged for an
	/// external integration.
	///
	/// The tags are also recorded with the submission store, so the node's
	/// persisted result row is written under the tagged
	/// `<fingerprint>#<tags>.job-result` name and survives store round-trips
	/// (takeover included).
	pub fn external_key(
		&self,
		tags: impl IntoIterator<Item = impl Into<String>>,
	) -> JobResult<ExternalJobKey> {
		let key = ExternalJobKey::with_tags(self.director.id().clone(), self.job_key, tags)
			.map_err(JobError::store)?;

		self.director.store().set_result_tags(&self.job_key, &key.tags);
		Ok(key)
	}

	pub(crate) fn input_value<V: JobValue>(&self, id: InputId) -> JobResult<V> {
		self.inputs.value(id)
	}
}
