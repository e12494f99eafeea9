//! Input bindings: the containers through which a job declares its
//! dependencies and reads their resolved values during execution.

use std::{
	any::{type_name, Any},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;

use crate::{
	director::JobDirector,
	encoding::{self, JobValue},
	error::{InvariantViolation, JobError, JobResult},
	jobs::{AnyJob, IntoJob},
	keys::JobId,
	scope::ExecutionScope,
};

/// Identifier of one input binding, injective within a job instance and
/// stable for the instance's lifetime.
pub type InputId = u64;

static NEXT_INPUT_ID: AtomicU64 = AtomicU64::new(1);

fn next_input_id() -> InputId {
	NEXT_INPUT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Type-erased view of one declared input, resolved in parallel with its
/// siblings.
#[async_trait]
pub trait InputDescriptor: Send + Sync + 'static {
	fn id(&self) -> InputId;

	/// Declared type name of the input's value; absorbed into fingerprints.
	fn reported_type(&self) -> &'static str;

	fn is_unbound(&self) -> bool;

	async fn resolve(&self, director: &JobDirector, submission: JobId) -> ResolvedInput;
}

/// One resolved input: the typed value handed to `execute` plus the canonical
/// byte image absorbed into the parent's fingerprint.
pub struct ResolvedInput {
	pub(crate) id: InputId,
	pub(crate) reported_type: &'static str,
	pub(crate) outcome: Result<Arc<dyn Any + Send + Sync>, JobError>,
	pub(crate) canonical: Vec<u8>,
}

impl ResolvedInput {
	pub(crate) fn success<V: JobValue>(
		id: InputId,
		reported_type: &'static str,
		value: V,
		canonical: Vec<u8>,
	) -> Self {
		Self { id, reported_type, outcome: Ok(Arc::new(value)), canonical }
	}

	pub(crate) fn failure(id: InputId, reported_type: &'static str, error: JobError) -> Self {
		// Failures are fingerprinted through their envelope image so a failed
		// dependency never collides with a successful one.
		let canonical = encoding::encode(&error.envelope())
			.unwrap_or_else(|_| error.to_string().into_bytes());
		Self { id, reported_type, outcome: Err(error), canonical }
	}

	pub fn error(&self) -> Option<&JobError> {
		self.outcome.as_ref().err()
	}
}

/// The complete resolved-input set of one node, in descriptor order.
pub struct ResolvedInputs {
	inputs: Vec<ResolvedInput>,
}

impl ResolvedInputs {
	pub(crate) fn new(inputs: Vec<ResolvedInput>) -> Self {
		Self { inputs }
	}

	pub(crate) fn empty() -> Self {
		Self { inputs: Vec::new() }
	}

	pub fn len(&self) -> usize {
		self.inputs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inputs.is_empty()
	}

	pub(crate) fn fingerprint_parts(&self) -> impl Iterator<Item = (&str, &[u8])> + '_ {
		self.inputs
			.iter()
			.map(|input| (input.reported_type, input.canonical.as_slice()))
	}

	/// The failure to surface for this input set, if any.
	///
	/// Exactly one non-cancellation failure surfaces as-is; several combine
	/// into a composite; if every failure is a cancellation, the first
	/// cancellation surfaces.
	pub fn failure(&self) -> Option<JobError> {
		let failures = self
			.inputs
			.iter()
			.filter_map(ResolvedInput::error)
			.collect::<Vec<_>>();
		if failures.is_empty() {
			return None;
		}

		let real = failures
			.iter()
			.filter(|error| !error.is_cancelled())
			.collect::<Vec<_>>();
		match real.as_slice() {
			[] => Some(failures[0].clone()),
			[single] => Some((**single).clone()),
			many => Some(JobError::MultipleInputsFailed {
				errors: many.iter().map(|error| (**error).clone()).collect(),
			}),
		}
	}

	pub(crate) fn value<V: JobValue>(&self, id: InputId) -> JobResult<V> {
		let input = self
			.inputs
			.iter()
			.find(|input| input.id == id)
			.ok_or(JobError::Invariant(InvariantViolation::InputResultMissing))?;

		match &input.outcome {
			Ok(value) => value
				.downcast_ref::<V>()
				.cloned()
				.ok_or(JobError::Invariant(InvariantViolation::InputResultInvalid)),
			Err(_) => Err(JobError::Invariant(InvariantViolation::ExecuteInvokedWithFailedInput)),
		}
	}
}

/// Binding state of one input.
enum Binding<V: JobValue> {
	Unbound,
	Constant(V),
	Job(AnyJob<V>),
}

impl<V: JobValue> Clone for Binding<V> {
	fn clone(&self) -> Self {
		match self {
			Self::Unbound => Self::Unbound,
			Self::Constant(value) => Self::Constant(value.clone()),
			Self::Job(job) => Self::Job(job.clone()),
		}
	}
}

struct InputCell<V: JobValue> {
	id: InputId,
	binding: Mutex<Binding<V>>,
}

/// A job's declared dependency on a value of type `V`.
///
/// A binding is either a constant or another job; executing a job with an
/// unbound input is an error. During execution, [`value`](JobInput::value)
/// reads the resolved entry out of the ambient execution scope.
pub struct JobInput<V: JobValue> {
	cell: Arc<InputCell<V>>,
}

impl<V: JobValue> Clone for JobInput<V> {
	fn clone(&self) -> Self {
		Self { cell: Arc::clone(&self.cell) }
	}
}

impl<V: JobValue> Default for JobInput<V> {
	fn default() -> Self {
		Self::unbound()
	}
}

impl<V: JobValue> JobInput<V> {
	pub fn unbound() -> Self {
		Self {
			cell: Arc::new(InputCell { id: next_input_id(), binding: Mutex::new(Binding::Unbound) }),
		}
	}

	pub fn constant(value: V) -> Self {
		let input = Self::unbound();
		input.bind_constant(value);
		input
	}

	pub fn job(job: impl IntoJob<V>) -> Self {
		let input = Self::unbound();
		input.bind_job(job);
		input
	}

	/// Bind through a builder, for conditional expressions that pick one job
	/// per branch.
	pub fn with(build: impl FnOnce(JobBuilder<V>) -> JobBuilder<V>) -> Self {
		let input = Self::unbound();
		input.bind_with(build);
		input
	}

	pub fn bind_constant(&self, value: V) {
		*self.cell.binding.lock().expect("input binding poisoned") = Binding::Constant(value);
	}

	pub fn bind_job(&self, job: impl IntoJob<V>) {
		*self.cell.binding.lock().expect("input binding poisoned") = Binding::Job(job.into_job());
	}

	pub fn bind_with(&self, build: impl FnOnce(JobBuilder<V>) -> JobBuilder<V>) {
		if let Some(job) = build(JobBuilder::new()).job {
			*self.cell.binding.lock().expect("input binding poisoned") = Binding::Job(job);
		}
	}

	/// The descriptor to report from `input_descriptors`.
	pub fn descriptor(&self) -> Arc<dyn InputDescriptor> {
		Arc::clone(&self.cell) as Arc<dyn InputDescriptor>
	}

	/// Read the resolved value from the ambient execution scope.
	///
	/// # Panics
	///
	/// Panics when called outside a job execution scope; that is a
	/// programming error, not a recoverable failure.
	pub fn value(&self) -> JobResult<V> {
		ExecutionScope::current().input_value(self.cell.id)
	}
}

#[async_trait]
impl<V: JobValue> InputDescriptor for InputCell<V> {
	fn id(&self) -> InputId {
		self.id
	}

	fn reported_type(&self) -> &'static str {
		type_name::<V>()
	}

	fn is_unbound(&self) -> bool {
		matches!(*self.binding.lock().expect("input binding poisoned"), Binding::Unbound)
	}

	async fn resolve(&self, director: &JobDirector, submission: JobId) -> ResolvedInput {
		let binding = self.binding.lock().expect("input binding poisoned").clone();

		match binding {
			Binding::Unbound => ResolvedInput::failure(
				self.id,
				self.reported_type(),
				JobError::UnboundInputs {
					job_type: String::new(),
					input_types: vec![self.reported_type().to_owned()],
				},
			),
			Binding::Constant(value) => match encoding::encode(&value) {
				Ok(canonical) => {
					ResolvedInput::success(self.id, self.reported_type(), value, canonical)
				}
				Err(err) => ResolvedInput::failure(self.id, self.reported_type(), err.into()),
			},
			Binding::Job(job) => {
				let (_, outcome) = job.resolve(director.clone(), submission).await;
				match outcome {
					Ok(resolved) => ResolvedInput::success(
						self.id,
						self.reported_type(),
						resolved.value,
						resolved.canonical,
					),
					Err(err) => ResolvedInput::failure(self.id, self.reported_type(), err),
				}
			}
		}
	}
}

/// Collects the single job chosen by a conditional binding expression.
pub struct JobBuilder<V: JobValue> {
	job: Option<AnyJob<V>>,
}

impl<V: JobValue> JobBuilder<V> {
	fn new() -> Self {
		Self { job: None }
	}

	/// Select `job`; the first selection wins.
	pub fn job(mut self, job: impl IntoJob<V>) -> Self {
		self.job.get_or_insert_with(|| job.into_job());
		self
	}
}
