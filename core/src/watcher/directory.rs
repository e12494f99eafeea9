//! Thin async bridge over the OS file-event primitive.

use std::path::Path;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{JobError, JobResult};

/// Watches a set of directories (non-recursively) and surfaces their events
/// on an async channel.
pub struct DirectoryWatcher {
	watcher: RecommendedWatcher,
	events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl DirectoryWatcher {
	pub fn new() -> JobResult<Self> {
		let (tx, events) = mpsc::unbounded_channel();

		let watcher = notify::recommended_watcher(move |event| {
			let _ = tx.send(event);
		})
		.map_err(JobError::io)?;

		Ok(Self { watcher, events })
	}

	pub fn watch(&mut self, path: &Path) -> JobResult<()> {
		self.watcher
			.watch(path, RecursiveMode::NonRecursive)
			.map_err(JobError::io)
	}

	pub fn unwatch(&mut self, path: &Path) {
		let _ = self.watcher.unwatch(path);
	}

	/// The next filesystem event; `None` once the watcher is closed.
	pub async fn next(&mut self) -> Option<notify::Event> {
		while let Some(result) = self.events.recv().await {
			match result {
				Ok(event) => return Some(event),
				Err(err) => warn!(%err, "filesystem watch error"),
			}
		}
		None
	}
}
