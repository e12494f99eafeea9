//! The principal's watcher over assistant package directories.
//!
//! A package is claimable when it still holds a submission file and its
//! advisory lock is free, meaning the owning assistant released it (transfer)
//! or died (orphan). Takeover attempts are try-lock based and idempotent, so
//! over-triggering on noisy filesystem events is harmless.

mod directory;

use std::{path::Path, time::Duration};

use notify::EventKind;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use directory::DirectoryWatcher;

use crate::{director::JobDirector, error::JobResult, store::PACKAGE_EXT};

const JOBS_DIR: &str = "jobs";

pub(crate) struct AssistantsWatcher;

impl AssistantsWatcher {
	pub(crate) fn spawn(director: JobDirector) -> JoinHandle<()> {
		tokio::spawn(async move {
			if let Err(err) = run(director).await {
				error!(%err, "assistants watcher terminated");
			}
		})
	}
}

/// Lock releases do not surface as filesystem events on every platform, so a
/// slow rescan backs up the event-driven path.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

async fn run(director: JobDirector) -> JobResult<()> {
	let assistants_dir = director.store().assistants_dir();
	tokio::fs::create_dir_all(&assistants_dir).await?;

	let mut watcher = DirectoryWatcher::new()?;
	watcher.watch(&assistants_dir)?;

	// Catch up on assistants and already-orphaned packages that predate the
	// watch.
	sweep_assistants(&director, &assistants_dir, &mut watcher).await;

	let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
	rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			event = watcher.next() => {
				let Some(event) = event else { break };
				handle_event(&director, &assistants_dir, &mut watcher, &event).await;
			}
			_ = rescan.tick() => {
				sweep_assistants(&director, &assistants_dir, &mut watcher).await;
			}
		}
	}

	debug!("assistants watcher closed");
	Ok(())
}

async fn handle_event(
	director: &JobDirector,
	assistants_dir: &Path,
	watcher: &mut DirectoryWatcher,
	event: &notify::Event,
) {
	for path in &event.paths {
		let Ok(relative) = path.strip_prefix(assistants_dir) else {
			continue;
		};
		let depth = relative.components().count();

		match depth {
			0 => {}
			// assistants/<name>
			1 => match event.kind {
				EventKind::Create(_) => {
					watch_assistant(director, watcher, path).await;
				}
				EventKind::Remove(_) => {
					watcher.unwatch(path);
					watcher.unwatch(&path.join(JOBS_DIR));
				}
				_ => {}
			},
			// assistants/<name>/jobs: watch on create; any other activity
			// (including lock releases) re-checks its packages.
			2 => {
				if ends_with_jobs(relative) {
					if matches!(event.kind, EventKind::Create(_)) {
						if let Err(err) = watcher.watch(path) {
							warn!(path = %path.display(), %err, "cannot watch assistant jobs");
						}
					}
					if matches!(event.kind, EventKind::Remove(_)) {
						watcher.unwatch(path);
					} else {
						sweep_packages(director, path).await;
					}
				}
			}
			// Inside jobs/: attempt takeover of the touched package.
			_ => {
				let mut parts = relative.components();
				let (Some(assistant), Some(jobs), Some(package)) =
					(parts.next(), parts.next(), parts.next())
				else {
					continue;
				};
				let package = assistants_dir
					.join(assistant.as_os_str())
					.join(jobs.as_os_str())
					.join(package.as_os_str());
				if package.extension().is_some_and(|ext| ext == PACKAGE_EXT) {
					try_claim(director, &package).await;
				}
			}
		}
	}
}

async fn sweep_assistants(
	director: &JobDirector,
	assistants_dir: &Path,
	watcher: &mut DirectoryWatcher,
) {
	let mut entries = match tokio::fs::read_dir(assistants_dir).await {
		Ok(entries) => entries,
		Err(err) => {
			warn!(%err, "cannot enumerate assistants");
			return;
		}
	};

	while let Ok(Some(entry)) = entries.next_entry().await {
		let path = entry.path();
		if path.is_dir() {
			watch_assistant(director, watcher, &path).await;
		}
	}
}

async fn watch_assistant(director: &JobDirector, watcher: &mut DirectoryWatcher, dir: &Path) {
	debug!(assistant = %dir.display(), "watching assistant");
	if let Err(err) = watcher.watch(dir) {
		warn!(path = %dir.display(), %err, "cannot watch assistant");
	}

	let jobs_dir = dir.join(JOBS_DIR);
	if jobs_dir.is_dir() {
		if let Err(err) = watcher.watch(&jobs_dir) {
			warn!(path = %jobs_dir.display(), %err, "cannot watch assistant jobs");
		}
		sweep_packages(director, &jobs_dir).await;
	}
}

async fn sweep_packages(director: &JobDirector, jobs_dir: &Path) {
	let mut entries = match tokio::fs::read_dir(jobs_dir).await {
		Ok(entries) => entries,
		Err(_) => return,
	};

	while let Ok(Some(entry)) = entries.next_entry().await {
		let path = entry.path();
		if path.is_dir() && path.extension().is_some_and(|ext| ext == PACKAGE_EXT) {
			try_claim(director, &path).await;
		}
	}
}

async fn try_claim(director: &JobDirector, package_dir: &Path) {
	match director.store().try_claim_package(package_dir).await {
		Ok(Some(record)) => {
			info!(job_id = %record.job_id, type_id = %record.type_id, "took over assistant submission");
			match director.types().restore(&record.type_id, &record.encoded) {
				Ok(job) => {
					director.spawn_pipeline(job, record.job_id, record.dedup_expires_at);
				}
				Err(err) => {
					error!(job_id = %record.job_id, %err, "cannot restore claimed submission");
				}
			}
		}
		Ok(None) => {}
		Err(err) => warn!(path = %package_dir.display(), %err, "takeover attempt failed"),
	}
}

fn ends_with_jobs(relative: &Path) -> bool {
	relative
		.components()
		.nth(1)
		.is_some_and(|component| component.as_os_str() == JOBS_DIR)
}
