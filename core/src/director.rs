//! The job director: submit → resolve → persist → complete.

use std::{
	collections::HashMap,
	fmt,
	path::PathBuf,
	sync::{Arc, Mutex},
	time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use kubrick_register_cache::{RegisterCache, RegisterFailure};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
	encoding,
	error::{ErrorTypeRegistry, JobError, JobResult, UserJobError},
	fingerprint::Fingerprint,
	injection::InjectionRegistry,
	jobs::{Job, Resolved, SubmittableJob},
	keys::{DirectorId, JobId, JobKey},
	registry::{DynSubmittable, SubmittableTypeRegistry},
	resolver,
	scope::ExecutionScope,
	store::{PackageStore, StoredResult, SubmittedJob},
	watcher::AssistantsWatcher,
};

/// Lifecycle state; external operations are rejected outside `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorState {
	Created,
	Running,
	Stopped,
}

impl fmt::Display for DirectorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Created => f.write_str("created"),
			Self::Running => f.write_str("running"),
			Self::Stopped => f.write_str("stopped"),
		}
	}
}

/// Which side of the shared store this director plays.
///
/// The principal owns the store's `jobs/` directory and may take over
/// orphaned assistant packages; each assistant owns a named subdirectory
/// under `assistants/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectorRole {
	Principal,
	Assistant { name: String },
}

struct DirectorShared {
	id: DirectorId,
	role: DirectorRole,
	store: Arc<PackageStore>,
	results: RegisterCache<JobKey, Vec<u8>, PackageStore>,
	types: SubmittableTypeRegistry,
	errors: ErrorTypeRegistry,
	injection: InjectionRegistry,
	state: Mutex<DirectorState>,
	tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
	watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Persistent, idempotent, dependency-driven job director.
///
/// Cheap to clone; all clones share one director instance.
#[derive(Clone)]
pub struct JobDirector {
	shared: Arc<DirectorShared>,
}

impl JobDirector {
	pub fn builder(id: DirectorId, base_dir: impl Into<PathBuf>) -> JobDirectorBuilder {
		JobDirectorBuilder {
			id,
			base_dir: base_dir.into(),
			role: DirectorRole::Principal,
			types: SubmittableTypeRegistry::new(),
			errors: ErrorTypeRegistry::new(),
		}
	}

	pub fn id(&self) -> &DirectorId {
		&self.shared.id
	}

	pub fn role(&self) -> &DirectorRole {
		&self.shared.role
	}

	pub fn is_principal(&self) -> bool {
		self.shared.role == DirectorRole::Principal
	}

	pub fn injection(&self) -> &InjectionRegistry {
		&self.shared.injection
	}

	pub(crate) fn store(&self) -> &Arc<PackageStore> {
		&self.shared.store
	}

	pub(crate) fn types(&self) -> &SubmittableTypeRegistry {
		&self.shared.types
	}

	/// Start the director: re-drives every persisted submission and, on the
	/// principal, begins watching for orphaned assistant packages. Returns
	/// the number of re-driven submissions.
	pub async fn start(&self) -> JobResult<usize> {
		{
			let mut state = self.shared.state.lock().expect("director state poisoned");
			if *state == DirectorState::Running {
				return Err(self.state_error(*state));
			}
			*state = DirectorState::Running;
		}

		let mut redriven = 0;
		for record in self.shared.store.load_jobs().await? {
			match self.shared.types.restore(&record.type_id, &record.encoded) {
				Ok(job) => {
					info!(job_id = %record.job_id, type_id = %record.type_id, "re-driving persisted submission");
					self.spawn_pipeline(job, record.job_id, record.dedup_expires_at);
					redriven += 1;
				}
				Err(err) => {
					error!(job_id = %record.job_id, type_id = %record.type_id, %err, "cannot restore persisted submission");
				}
			}
		}

		if self.is_principal() {
			let watcher = AssistantsWatcher::spawn(self.clone());
			*self.shared.watcher.lock().expect("watcher handle poisoned") = Some(watcher);
		}

		Ok(redriven)
	}

	/// Stop the director: cancels every in-flight submission task and waits
	/// up to `timeout` for them to unwind. Persisted state is untouched and
	/// will be re-driven by the next `start`.
	pub async fn stop(&self, timeout: Duration) {
		*self.shared.state.lock().expect("director state poisoned") = DirectorState::Stopped;

		if let Some(watcher) = self.shared.watcher.lock().expect("watcher handle poisoned").take()
		{
			watcher.abort();
		}

		let handles = {
			let mut tasks = self.shared.tasks.lock().expect("director tasks poisoned");
			tasks.drain().map(|(_, handle)| handle).collect::<Vec<_>>()
		};

		for handle in &handles {
			handle.abort();
		}

		if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
			warn!(director = %self.shared.id, "stop timed out awaiting submission tasks");
		}

		info!(director = %self.shared.id, "director stopped");
	}

	/// Submit a root job under a random id with no deduplication window.
	pub async fn submit<J: SubmittableJob>(&self, job: J) -> JobResult<bool> {
		self.submit_with(job, JobId::new(), Duration::ZERO).await
	}

	/// Submit a root job.
	///
	/// Returns `false` (dropping the job silently) when a submission with
	/// the same id is still inside its deduplication window.
	pub async fn submit_with<J: SubmittableJob>(
		&self,
		job: J,
		job_id: JobId,
		dedup_window: Duration,
	) -> JobResult<bool> {
		self.ensure_running()?;

		let expires = TimeDelta::from_std(dedup_window)
			.ok()
			.and_then(|window| Utc::now().checked_add_signed(window))
			.unwrap_or(DateTime::<Utc>::MAX_UTC);
		let record = SubmittedJob {
			job_id,
			type_id: J::TYPE_ID.to_owned(),
			encoded: encoding::encode(&job)?,
			dedup_expires_at: expires,
		};

		if !self.shared.store.save_job(&record).await? {
			debug!(job_id = %job_id, type_id = J::TYPE_ID, "duplicate submission dropped");
			return Ok(false);
		}

		self.spawn_pipeline(Arc::new(job), job_id, expires);
		Ok(true)
	}

	/// Count of live submitted jobs in the store.
	pub async fn submitted_job_count(&self) -> JobResult<usize> {
		self.shared.store.job_count().await
	}

	/// Persisted result rows of one submission, with the tags carried in
	/// their file names; diagnostics and tests.
	pub async fn load_job_results(
		&self,
		job_id: JobId,
	) -> JobResult<Vec<(Fingerprint, Vec<String>, Vec<u8>)>> {
		self.shared.store.load_job_results(&job_id).await
	}

	/// Hand the current submission to the principal director.
	///
	/// On an assistant this raises the `TransferToPrincipal` control signal,
	/// which unwinds execution without caching a result and leaves the
	/// submission package unlocked for the principal. On the principal it is
	/// a no-op.
	pub fn transfer_to_principal(&self) -> JobResult<()> {
		match &self.shared.role {
			DirectorRole::Principal => Ok(()),
			DirectorRole::Assistant { .. } => Err(JobError::TransferToPrincipal),
		}
	}

	/// Forget a node's cached result so it can run again; used by retry.
	pub(crate) async fn unresolve(&self, key: &JobKey) -> JobResult<()> {
		self.shared.results.deregister(key).await
	}

	pub(crate) fn spawn_pipeline(
		&self,
		job: Arc<dyn DynSubmittable>,
		job_id: JobId,
		expires: chrono::DateTime<Utc>,
	) {
		let task_id = Uuid::new_v4();
		let director = self.clone();

		let handle = tokio::spawn(async move {
			director.process_submission(job, job_id, expires).await;
			director
				.shared
				.tasks
				.lock()
				.expect("director tasks poisoned")
				.remove(&task_id);
		});

		let mut tasks = self.shared.tasks.lock().expect("director tasks poisoned");
		if !handle.is_finished() {
			tasks.insert(task_id, handle);
		}
	}

	async fn process_submission(
		&self,
		job: Arc<dyn DynSubmittable>,
		job_id: JobId,
		expires: chrono::DateTime<Utc>,
	) {
		let type_id = job.type_id();
		info!(job_id = %job_id, type_id, "processing submission");

		let (_, outcome) = job.resolve_root(self.clone(), job_id).await;
		match outcome {
			Ok(()) => debug!(job_id = %job_id, type_id, "submission completed"),
			Err(JobError::TransferToPrincipal) => {
				if !self.is_principal() {
					info!(job_id = %job_id, type_id, "submission transferred to principal");
					// The package stays on disk, unlocked, for takeover.
					self.shared.store.unlock_job(&job_id);
					return;
				}
				warn!(job_id = %job_id, type_id, "transfer signal on the principal; treating as terminal");
			}
			Err(err) => warn!(job_id = %job_id, type_id, %err, "submission failed"),
		}

		// The record outlives completion until its dedup window expires,
		// regardless of outcome.
		let remaining = (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO);
		if !remaining.is_zero() {
			tokio::time::sleep(remaining).await;
		}

		if let Err(err) = self.shared.store.remove_job(&job_id).await {
			warn!(job_id = %job_id, %err, "failed to remove expired submission");
		}
	}

	/// Resolve one node: resolve inputs, fingerprint, then run `execute` at
	/// most once per `(submission, fingerprint)` through the result cache.
	pub(crate) async fn resolve_node<J: Job>(
		&self,
		job: Arc<J>,
		type_id: &str,
		submission: JobId,
	) -> (Option<JobKey>, JobResult<Resolved<J::Value>>) {
		let inputs = match resolver::resolve_inputs(
			self,
			type_id,
			job.input_descriptors(),
			submission,
		)
		.await
		{
			Ok(inputs) => inputs,
			Err(err) => return (None, Err(err)),
		};

		let fingerprint = Fingerprint::digest(type_id, inputs.fingerprint_parts());
		let key = JobKey::new(submission, fingerprint);

		// Failed inputs terminate the node without executing it; the failure
		// itself was fingerprinted above.
		if let Some(failure) = inputs.failure() {
			return (Some(key), Err(failure));
		}

		let scope = ExecutionScope::new(self.clone(), key, Arc::new(inputs));
		let bytes = match self
			.shared
			.results
			.register(key, move || execute_node(job, scope))
			.await
		{
			Ok(bytes) => bytes,
			Err(RegisterFailure::Deregistered) => return (Some(key), Err(JobError::Cancelled)),
			Err(RegisterFailure::Failed(err)) => return (Some(key), Err((*err).clone())),
		};

		let stored: StoredResult = match encoding::decode(&bytes) {
			Ok(stored) => stored,
			Err(err) => return (Some(key), Err(err.into())),
		};

		match stored {
			StoredResult::Success(canonical) => match encoding::decode::<J::Value>(&canonical) {
				Ok(value) => (Some(key), Ok(Resolved { value, canonical })),
				Err(err) => (Some(key), Err(err.into())),
			},
			StoredResult::Failure(error) => {
				(Some(key), Err(self.shared.errors.rehydrate(error)))
			}
		}
	}

	fn ensure_running(&self) -> JobResult<()> {
		let state = *self.shared.state.lock().expect("director state poisoned");
		if state == DirectorState::Running {
			Ok(())
		} else {
			Err(self.state_error(state))
		}
	}

	fn state_error(&self, actual: DirectorState) -> JobError {
		JobError::DirectorState {
			required: DirectorState::Running.to_string(),
			actual: actual.to_string(),
		}
	}
}

/// Run one node's `execute` inside its scope and encode the terminal state.
///
/// User failures are caught and persisted as result rows; the transfer
/// control signal propagates without touching the store.
async fn execute_node<J: Job>(job: Arc<J>, scope: ExecutionScope) -> JobResult<Vec<u8>> {
	let outcome = scope.enter(async move { job.execute().await }).await;

	match outcome {
		Ok(value) => {
			let canonical = encoding::encode(&value)?;
			Ok(encoding::encode(&StoredResult::Success(canonical))?)
		}
		Err(JobError::TransferToPrincipal) => Err(JobError::TransferToPrincipal),
		Err(error) => Ok(encoding::encode(&StoredResult::Failure(error))?),
	}
}

/// Configures and opens a [`JobDirector`].
pub struct JobDirectorBuilder {
	id: DirectorId,
	base_dir: PathBuf,
	role: DirectorRole,
	types: SubmittableTypeRegistry,
	errors: ErrorTypeRegistry,
}

impl JobDirectorBuilder {
	/// Open the director as the named assistant of `id`'s store instead of
	/// the principal. Assistant names share the director-id alphabet.
	pub fn assistant(mut self, name: impl Into<String>) -> Self {
		self.role = DirectorRole::Assistant { name: name.into() };
		self
	}

	/// Register a submittable job type for submission and restoration.
	pub fn register_job<J: SubmittableJob>(mut self) -> Self {
		self.types.register::<J>();
		self
	}

	/// Register a user error domain so its values survive persistence.
	pub fn register_error<E: UserJobError>(mut self) -> Self {
		self.errors.register::<E>();
		self
	}

	pub fn build(self) -> JobResult<JobDirector> {
		if let DirectorRole::Assistant { name } = &self.role {
			DirectorId::new(name.clone())
				.map_err(|err| JobError::store(format!("invalid assistant name: {err}")))?;
		}

		let store = Arc::new(PackageStore::open(&self.base_dir, &self.id, &self.role)?);

		Ok(JobDirector {
			shared: Arc::new(DirectorShared {
				id: self.id,
				role: self.role,
				results: RegisterCache::new(Arc::clone(&store)),
				store,
				types: self.types,
				errors: self.errors,
				injection: InjectionRegistry::new(),
				state: Mutex::new(DirectorState::Created),
				tasks: Mutex::new(HashMap::new()),
				watcher: Mutex::new(None),
			}),
		})
	}
}
