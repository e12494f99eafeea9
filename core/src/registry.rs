//! Registry mapping submittable type ids to restore functions, so persisted
//! submissions can be re-driven after a restart or a takeover.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use crate::{
	director::JobDirector,
	encoding,
	error::{JobError, JobResult},
	jobs::{Resolved, SubmittableJob},
	keys::{JobId, JobKey},
};

/// Object-safe handle to a submittable root job.
#[async_trait]
pub(crate) trait DynSubmittable: Send + Sync + 'static {
	fn type_id(&self) -> &'static str;

	fn encode_job(&self) -> JobResult<Vec<u8>>;

	async fn resolve_root(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<()>);
}

#[async_trait]
impl<J: SubmittableJob> DynSubmittable for J {
	fn type_id(&self) -> &'static str {
		J::TYPE_ID
	}

	fn encode_job(&self) -> JobResult<Vec<u8>> {
		Ok(encoding::encode(self)?)
	}

	async fn resolve_root(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<()>) {
		let (key, outcome) = director.resolve_node(self, J::TYPE_ID, submission).await;
		(key, outcome.map(|Resolved { value, .. }| value))
	}
}

type RestoreFn = fn(&[u8]) -> JobResult<Arc<dyn DynSubmittable>>;

fn restore<J: SubmittableJob>(bytes: &[u8]) -> JobResult<Arc<dyn DynSubmittable>> {
	let mut job: J = encoding::decode(bytes)?;
	job.rebind();
	Ok(Arc::new(job))
}

/// Registered submittable job types for one director.
#[derive(Default)]
pub struct SubmittableTypeRegistry {
	types: HashMap<&'static str, RestoreFn>,
}

impl SubmittableTypeRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<J: SubmittableJob>(&mut self) {
		debug!(type_id = J::TYPE_ID, "registered submittable job type");
		self.types.insert(J::TYPE_ID, restore::<J>);
	}

	pub fn contains(&self, type_id: &str) -> bool {
		self.types.contains_key(type_id)
	}

	pub fn type_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
		self.types.keys().copied()
	}

	pub(crate) fn restore(
		&self,
		type_id: &str,
		bytes: &[u8],
	) -> JobResult<Arc<dyn DynSubmittable>> {
		let restore = self
			.types
			.get(type_id)
			.ok_or_else(|| JobError::store(format!("unknown submittable job type `{type_id}`")))?;
		restore(bytes)
	}
}
