//! Job traits and the modifier combinators (`catch`, `map`, `map_to_result`,
//! `retry`).

use std::{any::type_name, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
	director::JobDirector,
	encoding::{self, JobValue},
	error::{JobError, JobResult},
	inputs::{InputDescriptor, ResolvedInputs},
	keys::{JobId, JobKey},
	scope::ExecutionScope,
};

/// A node in a dependency tree, producing a value of type `Value`.
///
/// Jobs whose `Value` is `()` are *executable*: they are run for their side
/// effects only.
#[async_trait]
pub trait Job: Send + Sync + 'static {
	type Value: JobValue;

	/// The ordered input bindings of this node. Order is part of the node's
	/// identity; report bindings in a fixed order.
	fn input_descriptors(&self) -> Vec<Arc<dyn InputDescriptor>> {
		Vec::new()
	}

	/// Execute the node. Runs inside an execution scope, so input bindings,
	/// dependency injection and dynamic jobs are available.
	async fn execute(&self) -> JobResult<Self::Value>;
}

/// A root job: restorable from persisted bytes and addressable by a stable
/// type id. Submittable jobs report no value.
pub trait SubmittableJob: Job<Value = ()> + Serialize + DeserializeOwned {
	/// Registered identifier; part of persisted submissions and of the root
	/// node's fingerprint.
	const TYPE_ID: &'static str;

	/// Reconstruct input bindings after restoration from persisted bytes.
	///
	/// Serialized jobs carry only their data fields (bindings are skipped);
	/// restore rebuilds the bindings from those fields, exactly as the
	/// constructor does.
	fn rebind(&mut self) {}
}

/// A resolved node value together with its canonical byte image.
pub(crate) struct Resolved<V> {
	pub value: V,
	pub canonical: Vec<u8>,
}

/// Object-safe resolution entry point. Plain jobs resolve through the
/// director (fingerprint, cache, execute); modifier wrappers intercept the
/// outcome of their wrapped job.
#[async_trait]
pub(crate) trait ResolvableJob<V: JobValue>: Send + Sync + 'static {
	async fn resolve(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<V>>);
}

#[async_trait]
impl<J: Job> ResolvableJob<J::Value> for J {
	async fn resolve(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<J::Value>>) {
		director.resolve_node(self, type_name::<J>(), submission).await
	}
}

/// A type-erased job producing `V`, possibly wrapped in modifiers.
pub struct AnyJob<V: JobValue> {
	inner: Arc<dyn ResolvableJob<V>>,
}

impl<V: JobValue> Clone for AnyJob<V> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<V: JobValue> AnyJob<V> {
	pub(crate) fn wrap(inner: Arc<dyn ResolvableJob<V>>) -> Self {
		Self { inner }
	}

	pub(crate) async fn resolve(
		&self,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<V>>) {
		Arc::clone(&self.inner).resolve(director, submission).await
	}

	/// Convert failures of this job into successes by invoking `handler`
	/// during resolution. A failing handler replaces the original failure
	/// with its own. Cancellation and transfer control signals pass through
	/// uncaught.
	pub fn catch<F>(self, handler: F) -> AnyJob<V>
	where
		F: Fn(JobError) -> JobResult<V> + Send + Sync + 'static,
	{
		AnyJob::wrap(Arc::new(CatchJob { inner: self, handler: Arc::new(handler) }))
	}

	/// Transform this job's successful value; failures pass through.
	pub fn map<U, F>(self, transform: F) -> AnyJob<U>
	where
		U: JobValue,
		F: Fn(V) -> JobResult<U> + Send + Sync + 'static,
	{
		AnyJob::wrap(Arc::new(MapJob { inner: self, transform: Arc::new(transform) }))
	}

	/// Reify this job's outcome as a value, so the parent resolves
	/// successfully either way.
	pub fn map_to_result(self) -> AnyJob<Result<V, JobError>> {
		AnyJob::wrap(Arc::new(MapToResultJob { inner: self }))
	}

	/// Re-resolve this job after a failure, as long as `policy(error,
	/// next_attempt)` holds. Each retry first deregisters the failed node's
	/// cache entry so the job actually runs again.
	pub fn retry<P>(self, policy: P) -> AnyJob<V>
	where
		P: Fn(&JobError, u32) -> bool + Send + Sync + 'static,
	{
		AnyJob::wrap(Arc::new(RetryJob { inner: self, policy: Arc::new(policy) }))
	}
}

/// Modifier entry points for concrete job types.
pub trait JobExt: Job + Sized {
	fn into_any(self) -> AnyJob<Self::Value> {
		AnyJob::wrap(Arc::new(self))
	}

	fn catch<F>(self, handler: F) -> AnyJob<Self::Value>
	where
		F: Fn(JobError) -> JobResult<Self::Value> + Send + Sync + 'static,
	{
		self.into_any().catch(handler)
	}

	fn map<U, F>(self, transform: F) -> AnyJob<U>
	where
		U: JobValue,
		F: Fn(Self::Value) -> JobResult<U> + Send + Sync + 'static,
	{
		self.into_any().map(transform)
	}

	fn map_to_result(self) -> AnyJob<Result<Self::Value, JobError>> {
		self.into_any().map_to_result()
	}

	fn retry<P>(self, policy: P) -> AnyJob<Self::Value>
	where
		P: Fn(&JobError, u32) -> bool + Send + Sync + 'static,
	{
		self.into_any().retry(policy)
	}
}

impl<J: Job> JobExt for J {}

/// Retry policy allowing up to `max` attempts in total.
pub fn max_attempts(max: u32) -> impl Fn(&JobError, u32) -> bool + Send + Sync + 'static {
	move |_, next_attempt| next_attempt <= max
}

/// Anything bindable as a job input producing `V`.
pub trait IntoJob<V: JobValue> {
	fn into_job(self) -> AnyJob<V>;
}

impl<V: JobValue> IntoJob<V> for AnyJob<V> {
	fn into_job(self) -> AnyJob<V> {
		self
	}
}

impl<J: Job> IntoJob<J::Value> for J {
	fn into_job(self) -> AnyJob<J::Value> {
		self.into_any()
	}
}

fn control_signal(error: &JobError) -> bool {
	matches!(error, JobError::TransferToPrincipal | JobError::Cancelled)
}

struct CatchJob<V: JobValue> {
	inner: AnyJob<V>,
	handler: Arc<dyn Fn(JobError) -> JobResult<V> + Send + Sync>,
}

#[async_trait]
impl<V: JobValue> ResolvableJob<V> for CatchJob<V> {
	async fn resolve(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<V>>) {
		let (key, outcome) = self.inner.resolve(director.clone(), submission).await;

		let error = match outcome {
			Ok(resolved) => return (key, Ok(resolved)),
			Err(error) if control_signal(&error) => return (key, Err(error)),
			Err(error) => error,
		};

		let handler = Arc::clone(&self.handler);
		let handled = match key {
			Some(key) => {
				// The handler runs scoped at the failed node, so injection
				// reads keep working inside it.
				let scope = ExecutionScope::new(director, key, Arc::new(ResolvedInputs::empty()));
				scope.enter(async move { handler(error) }).await
			}
			None => handler(error),
		};

		match handled {
			Ok(value) => (key, encode_resolved(value)),
			Err(error) => (key, Err(error)),
		}
	}
}

struct MapJob<V: JobValue, U: JobValue> {
	inner: AnyJob<V>,
	transform: Arc<dyn Fn(V) -> JobResult<U> + Send + Sync>,
}

#[async_trait]
impl<V: JobValue, U: JobValue> ResolvableJob<U> for MapJob<V, U> {
	async fn resolve(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<U>>) {
		let (key, outcome) = self.inner.resolve(director.clone(), submission).await;

		let value = match outcome {
			Ok(resolved) => resolved.value,
			Err(error) => return (key, Err(error)),
		};

		let transform = Arc::clone(&self.transform);
		let transformed = match key {
			Some(key) => {
				let scope = ExecutionScope::new(director, key, Arc::new(ResolvedInputs::empty()));
				scope.enter(async move { transform(value) }).await
			}
			None => transform(value),
		};

		match transformed {
			Ok(value) => (key, encode_resolved(value)),
			Err(error) => (key, Err(error)),
		}
	}
}

struct MapToResultJob<V: JobValue> {
	inner: AnyJob<V>,
}

#[async_trait]
impl<V: JobValue> ResolvableJob<Result<V, JobError>> for MapToResultJob<V> {
	async fn resolve(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<Result<V, JobError>>>) {
		let (key, outcome) = self.inner.resolve(director, submission).await;

		let reified = match outcome {
			Ok(resolved) => Ok(resolved.value),
			Err(error) if control_signal(&error) => return (key, Err(error)),
			Err(error) => Err(error),
		};

		(key, encode_resolved(reified))
	}
}

struct RetryJob<V: JobValue> {
	inner: AnyJob<V>,
	policy: Arc<dyn Fn(&JobError, u32) -> bool + Send + Sync>,
}

#[async_trait]
impl<V: JobValue> ResolvableJob<V> for RetryJob<V> {
	async fn resolve(
		self: Arc<Self>,
		director: JobDirector,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<V>>) {
		let mut attempt: u32 = 1;

		loop {
			let (key, outcome) = self.inner.resolve(director.clone(), submission).await;

			let error = match outcome {
				Ok(resolved) => return (key, Ok(resolved)),
				Err(error) if control_signal(&error) => return (key, Err(error)),
				Err(error) => error,
			};

			let next_attempt = attempt + 1;
			if !(self.policy)(&error, next_attempt) {
				return (key, Err(error));
			}

			// Clear the failed node so the next attempt actually re-executes.
			if let Some(key) = &key {
				if let Err(err) = director.unresolve(key).await {
					return (Some(*key), Err(err));
				}
			}

			attempt = next_attempt;
		}
	}
}

fn encode_resolved<V: JobValue>(value: V) -> JobResult<Resolved<V>> {
	let canonical = encoding::encode(&value)?;
	Ok(Resolved { value, canonical })
}
