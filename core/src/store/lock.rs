//! Advisory locks on package directories.
//!
//! A director holds the lock of every package it is processing; the lock
//! disappears with the process, which is what lets a principal detect
//! orphaned assistant packages with a simple try-lock.

use std::{
	fs::File,
	io,
	path::{Path, PathBuf},
};

use tracing::trace;

pub(crate) struct PackageLock {
	#[cfg_attr(not(unix), allow(dead_code))]
	file: File,
	path: PathBuf,
}

impl PackageLock {
	/// Try to take the exclusive advisory lock on `dir` without blocking.
	///
	/// Returns `None` when another open file description (any process,
	/// including this one) holds the lock.
	pub fn try_acquire(dir: &Path) -> io::Result<Option<Self>> {
		let file = File::open(dir)?;

		#[cfg(unix)]
		{
			use std::os::unix::io::AsRawFd;

			let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
			if ret != 0 {
				let err = io::Error::last_os_error();
				return if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
					Ok(None)
				} else {
					Err(err)
				};
			}
		}

		trace!(path = %dir.display(), "acquired package lock");
		Ok(Some(Self { file, path: dir.to_owned() }))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for PackageLock {
	fn drop(&mut self) {
		#[cfg(unix)]
		{
			use std::os::unix::io::AsRawFd;

			unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
		}
		trace!(path = %self.path.display(), "released package lock");
	}
}
