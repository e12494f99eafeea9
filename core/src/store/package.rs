//! Filesystem package layout.
//!
//! `{base}/{directorId}.job-store/jobs/{jobId}.job/` holds one
//! `_.job-submission` file plus one `<base64url-fingerprint>[#tags].job-result`
//! file per completed node. Writers stage a temp file and hard-link it into
//! place, which yields file-exists semantics for cross-process deduplication;
//! package-directory advisory locks provide liveness.

use std::{
	collections::HashMap,
	io,
	path::{Path, PathBuf},
	sync::Mutex,
};

use async_trait::async_trait;
use chrono::Utc;
use kubrick_register_cache::RegisterStore;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{lock::PackageLock, SubmissionEnvelope, SubmittedJob, TypedJob};
use crate::{
	director::DirectorRole,
	encoding,
	error::{JobError, JobResult},
	fingerprint::Fingerprint,
	keys::{DirectorId, JobId, JobKey},
};

pub(crate) const SUBMISSION_FILE: &str = "_.job-submission";
pub(crate) const PACKAGE_EXT: &str = "job";
pub(crate) const RESULT_EXT: &str = "job-result";
const STORE_EXT: &str = "job-store";

/// Durable per-director submission store.
pub struct PackageStore {
	store_root: PathBuf,
	jobs_dir: PathBuf,
	locks: Mutex<HashMap<JobId, PackageLock>>,
	// Tags minted for in-flight nodes; cleared with their rows.
	result_tags: Mutex<HashMap<JobKey, Vec<String>>>,
}

impl PackageStore {
	/// Open (creating as needed) the store for `id` under `base_dir`.
	///
	/// The principal owns `{root}/jobs/`; an assistant owns
	/// `{root}/assistants/{name}/jobs/` inside the same store root.
	pub fn open(base_dir: &Path, id: &DirectorId, role: &DirectorRole) -> JobResult<Self> {
		let store_root = base_dir.join(format!("{id}.{STORE_EXT}"));
		let jobs_dir = match role {
			DirectorRole::Principal => store_root.join("jobs"),
			DirectorRole::Assistant { name } => {
				store_root.join("assistants").join(name).join("jobs")
			}
		};
		std::fs::create_dir_all(&jobs_dir)?;

		Ok(Self {
			store_root,
			jobs_dir,
			locks: Mutex::new(HashMap::new()),
			result_tags: Mutex::new(HashMap::new()),
		})
	}

	pub fn store_root(&self) -> &Path {
		&self.store_root
	}

	pub(crate) fn assistants_dir(&self) -> PathBuf {
		self.store_root.join("assistants")
	}

	fn package_dir(&self, job_id: &JobId) -> PathBuf {
		self.jobs_dir.join(format!("{job_id}.{PACKAGE_EXT}"))
	}

	/// Persist a submission. Returns `false` when a live record with the
	/// same id already exists (deduplication); an expired record is replaced
	/// together with its result rows.
	pub async fn save_job(&self, record: &SubmittedJob) -> JobResult<bool> {
		let dir = self.package_dir(&record.job_id);
		tokio::fs::create_dir_all(&dir).await?;
		let submission = dir.join(SUBMISSION_FILE);

		match read_envelope(&submission).await {
			Ok(Some(prior)) if prior.exp > Utc::now() => return Ok(false),
			Ok(Some(_)) => clear_package(&dir).await?,
			Ok(None) => {}
			Err(err) => {
				warn!(job_id = %record.job_id, %err, "replacing unreadable submission");
				clear_package(&dir).await?;
			}
		}

		let envelope = SubmissionEnvelope {
			job: TypedJob { type_id: record.type_id.clone(), value: record.encoded.clone() },
			exp: record.dedup_expires_at,
		};
		let bytes = encoding::encode(&envelope)?;

		match link_into_place(&dir, &submission, &bytes).await {
			Ok(()) => {}
			// Lost the race to a concurrent writer with a live record.
			Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
			Err(err) => return Err(err.into()),
		}

		self.lock_package(&record.job_id, &dir);
		debug!(job_id = %record.job_id, type_id = %record.type_id, "saved submission");
		Ok(true)
	}

	/// Record the tags under which a node's result row should be written.
	///
	/// External-key tags registered here before the node completes end up in
	/// the `<fingerprint>#<tags>.job-result` file name, so external
	/// integrations can recognize the row by name alone.
	pub(crate) fn set_result_tags(&self, key: &JobKey, tags: &[String]) {
		if tags.is_empty() {
			return;
		}
		self.result_tags
			.lock()
			.expect("result tags poisoned")
			.insert(*key, tags.to_vec());
	}

	/// Remove a submission package, cascading over its result rows.
	/// Idempotent.
	pub async fn remove_job(&self, job_id: &JobId) -> JobResult<()> {
		self.locks.lock().expect("package locks poisoned").remove(job_id);
		self.result_tags
			.lock()
			.expect("result tags poisoned")
			.retain(|key, _| key.id != *job_id);

		match tokio::fs::remove_dir_all(self.package_dir(job_id)).await {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	/// Release the package lock while leaving the package on disk, so another
	/// director can take the job over.
	pub fn unlock_job(&self, job_id: &JobId) {
		self.locks.lock().expect("package locks poisoned").remove(job_id);
	}

	/// Load every persisted submission for restart-time re-driving, taking
	/// this store's package locks along the way.
	pub async fn load_jobs(&self) -> JobResult<Vec<SubmittedJob>> {
		let mut jobs = Vec::new();

		for dir in read_package_dirs(&self.jobs_dir).await? {
			match read_package(&dir).await {
				Ok(Some(record)) => {
					self.lock_package(&record.job_id, &dir);
					jobs.push(record);
				}
				Ok(None) => {}
				Err(err) => warn!(path = %dir.display(), %err, "skipping unreadable package"),
			}
		}

		Ok(jobs)
	}

	/// Count of live submitted jobs.
	pub async fn job_count(&self) -> JobResult<usize> {
		let mut count = 0;
		for dir in read_package_dirs(&self.jobs_dir).await? {
			if tokio::fs::try_exists(dir.join(SUBMISSION_FILE)).await? {
				count += 1;
			}
		}
		Ok(count)
	}

	/// Every persisted result row of one submission, with the tags carried in
	/// its file name; diagnostics and tests.
	pub async fn load_job_results(
		&self,
		job_id: &JobId,
	) -> JobResult<Vec<(Fingerprint, Vec<String>, Vec<u8>)>> {
		let dir = self.package_dir(job_id);
		let mut results = Vec::new();

		for (path, fingerprint, tags) in read_result_files(&dir).await? {
			results.push((fingerprint, tags, tokio::fs::read(&path).await?));
		}

		Ok(results)
	}

	/// Attempt to take over an unlocked package owned by another director.
	///
	/// On success the submission (and any completed result rows) is imported
	/// into this store under the same job id and the foreign package is
	/// removed. Returns `None` when the package is still locked or empty, and
	/// also when the submission was dropped as a live duplicate.
	pub(crate) async fn try_claim_package(
		&self,
		package_dir: &Path,
	) -> JobResult<Option<SubmittedJob>> {
		let lock = match PackageLock::try_acquire(package_dir) {
			Ok(Some(lock)) => lock,
			Ok(None) => return Ok(None),
			Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};

		let Some(record) = read_package(lock.path()).await? else {
			// Nothing to claim; clear the husk.
			drop(lock);
			let _ = tokio::fs::remove_dir_all(package_dir).await;
			return Ok(None);
		};

		let accepted = self.save_job(&record).await?;
		if accepted {
			// Completed nodes carry over so finished work is not re-run.
			let own_dir = self.package_dir(&record.job_id);
			for (path, _, _) in read_result_files(package_dir).await? {
				if let Some(name) = path.file_name() {
					tokio::fs::copy(&path, own_dir.join(name)).await?;
				}
			}
		}

		drop(lock);
		tokio::fs::remove_dir_all(package_dir).await?;

		Ok(accepted.then_some(record))
	}

	fn lock_package(&self, job_id: &JobId, dir: &Path) {
		if self.locks.lock().expect("package locks poisoned").contains_key(job_id) {
			return;
		}
		match PackageLock::try_acquire(dir) {
			Ok(Some(lock)) => {
				self.locks.lock().expect("package locks poisoned").insert(*job_id, lock);
			}
			Ok(None) => warn!(job_id = %job_id, "package already locked elsewhere"),
			Err(err) => warn!(job_id = %job_id, %err, "failed to lock package"),
		}
	}
}

/// Result rows back the per-director register cache.
#[async_trait]
impl RegisterStore<JobKey, Vec<u8>> for PackageStore {
	type Error = JobError;

	async fn value(&self, key: &JobKey) -> Result<Option<Vec<u8>>, JobError> {
		let dir = self.package_dir(&key.id);

		for (path, fingerprint, _) in read_result_files(&dir).await? {
			if fingerprint == key.fingerprint {
				return Ok(Some(tokio::fs::read(&path).await?));
			}
		}

		Ok(None)
	}

	async fn update_value(&self, key: &JobKey, value: &Vec<u8>) -> Result<(), JobError> {
		let dir = self.package_dir(&key.id);
		tokio::fs::create_dir_all(&dir).await?;

		// A row may already exist under a differently tagged name; first
		// writer wins either way.
		if self.value(key).await?.is_some() {
			return Ok(());
		}

		let tags = self
			.result_tags
			.lock()
			.expect("result tags poisoned")
			.get(key)
			.cloned()
			.unwrap_or_default();
		let target = dir.join(result_file_name(&key.fingerprint, &tags));

		match link_into_place(&dir, &target, value).await {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	async fn remove_value(&self, key: &JobKey) -> Result<(), JobError> {
		self.result_tags.lock().expect("result tags poisoned").remove(key);
		let dir = self.package_dir(&key.id);

		for (path, fingerprint, _) in read_result_files(&dir).await? {
			if fingerprint == key.fingerprint {
				match tokio::fs::remove_file(&path).await {
					Ok(()) => {}
					Err(err) if err.kind() == io::ErrorKind::NotFound => {}
					Err(err) => return Err(err.into()),
				}
			}
		}

		Ok(())
	}
}

/// `<base64url-fingerprint>[#tag1,tag2].job-result`
pub(crate) fn result_file_name(fingerprint: &Fingerprint, tags: &[String]) -> String {
	if tags.is_empty() {
		format!("{}.{RESULT_EXT}", fingerprint.to_base64url())
	} else {
		format!("{}#{}.{RESULT_EXT}", fingerprint.to_base64url(), tags.join(","))
	}
}

pub(crate) fn parse_result_name(name: &str) -> Option<(Fingerprint, Vec<String>)> {
	let stem = name.strip_suffix(&format!(".{RESULT_EXT}"))?;
	let (fingerprint, tags) = match stem.split_once('#') {
		Some((fingerprint, tags)) => {
			(fingerprint, tags.split(',').map(str::to_owned).collect())
		}
		None => (stem, Vec::new()),
	};
	Some((Fingerprint::from_base64url(fingerprint).ok()?, tags))
}

/// Stage `bytes` in a temp file and hard-link it to `target`, so the final
/// name appears atomically and an existing name surfaces as `AlreadyExists`.
async fn link_into_place(dir: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
	let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
	tokio::fs::write(&temp, bytes).await?;

	let linked = tokio::fs::hard_link(&temp, target).await;
	let _ = tokio::fs::remove_file(&temp).await;
	linked
}

async fn read_envelope(path: &Path) -> JobResult<Option<SubmissionEnvelope>> {
	let bytes = match tokio::fs::read(path).await {
		Ok(bytes) => bytes,
		Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(err) => return Err(err.into()),
	};
	Ok(Some(encoding::decode(&bytes)?))
}

async fn read_package(dir: &Path) -> JobResult<Option<SubmittedJob>> {
	let Some(envelope) = read_envelope(&dir.join(SUBMISSION_FILE)).await? else {
		return Ok(None);
	};

	let job_id = dir
		.file_stem()
		.and_then(|stem| stem.to_str())
		.and_then(|stem| stem.parse::<JobId>().ok())
		.ok_or_else(|| JobError::store(format!("malformed package name `{}`", dir.display())))?;

	Ok(Some(SubmittedJob {
		job_id,
		type_id: envelope.job.type_id,
		encoded: envelope.job.value,
		dedup_expires_at: envelope.exp,
	}))
}

async fn read_package_dirs(jobs_dir: &Path) -> JobResult<Vec<PathBuf>> {
	let mut dirs = Vec::new();

	let mut entries = match tokio::fs::read_dir(jobs_dir).await {
		Ok(entries) => entries,
		Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(dirs),
		Err(err) => return Err(err.into()),
	};

	while let Some(entry) = entries.next_entry().await? {
		let path = entry.path();
		if path.is_dir() && path.extension().is_some_and(|ext| ext == PACKAGE_EXT) {
			dirs.push(path);
		}
	}

	Ok(dirs)
}

async fn read_result_files(dir: &Path) -> JobResult<Vec<(PathBuf, Fingerprint, Vec<String>)>> {
	let mut results = Vec::new();

	let mut entries = match tokio::fs::read_dir(dir).await {
		Ok(entries) => entries,
		Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(results),
		Err(err) => return Err(err.into()),
	};

	while let Some(entry) = entries.next_entry().await? {
		let path = entry.path();
		let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
			continue;
		};
		if let Some((fingerprint, tags)) = parse_result_name(name) {
			results.push((path, fingerprint, tags));
		}
	}

	Ok(results)
}

async fn clear_package(dir: &Path) -> JobResult<()> {
	let mut entries = tokio::fs::read_dir(dir).await?;
	while let Some(entry) = entries.next_entry().await? {
		if entry.file_type().await?.is_file() {
			tokio::fs::remove_file(entry.path()).await?;
		}
	}
	Ok(())
}
