//! Parallel resolution of a job's input descriptors.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use crate::{
	director::JobDirector,
	error::{JobError, JobResult},
	inputs::{InputDescriptor, ResolvedInput, ResolvedInputs},
	keys::JobId,
};

/// Resolve every descriptor of one node concurrently and collect the results
/// in descriptor order.
///
/// Unbound descriptors fail the node up front. After the first sibling
/// failure the remaining siblings are aborted as an optimization, but every
/// slot is still collected before returning; aborted siblings report
/// cancellation. Cancelling the resolver itself propagates into all child
/// resolutions.
pub(crate) async fn resolve_inputs(
	director: &JobDirector,
	job_type: &str,
	descriptors: Vec<Arc<dyn InputDescriptor>>,
	submission: JobId,
) -> JobResult<ResolvedInputs> {
	let unbound = descriptors
		.iter()
		.filter(|descriptor| descriptor.is_unbound())
		.map(|descriptor| descriptor.reported_type().to_owned())
		.collect::<Vec<_>>();
	if !unbound.is_empty() {
		return Err(JobError::UnboundInputs {
			job_type: job_type.to_owned(),
			input_types: unbound,
		});
	}

	let mut tasks = JoinSet::new();
	for (index, descriptor) in descriptors.iter().enumerate() {
		let descriptor = Arc::clone(descriptor);
		let director = director.clone();
		tasks.spawn(async move { (index, descriptor.resolve(&director, submission).await) });
	}

	let mut slots: Vec<Option<ResolvedInput>> = descriptors.iter().map(|_| None).collect();
	let mut aborting = false;

	while let Some(joined) = tasks.join_next().await {
		match joined {
			Ok((index, resolved)) => {
				let failed = resolved.error().is_some();
				slots[index] = Some(resolved);

				if failed && !aborting {
					aborting = true;
					tasks.abort_all();
				}
			}
			Err(join_error) => {
				if !join_error.is_cancelled() {
					warn!(job_type, %join_error, "input resolution task failed");
				}
				// The slot stays empty and is reported as cancelled below.
			}
		}
	}

	let inputs = slots
		.into_iter()
		.zip(&descriptors)
		.map(|(slot, descriptor)| {
			slot.unwrap_or_else(|| {
				ResolvedInput::failure(
					descriptor.id(),
					descriptor.reported_type(),
					JobError::Cancelled,
				)
			})
		})
		.collect();

	Ok(ResolvedInputs::new(inputs))
}
