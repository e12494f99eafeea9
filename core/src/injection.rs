//! Dependency injection registry keyed by `(declared type name, tags)`.

use std::{
	any::{type_name, Any},
	collections::HashMap,
	sync::{Arc, RwLock},
};

use crate::scope::ExecutionScope;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InjectionKey {
	type_name: &'static str,
	tags: Vec<String>,
}

impl InjectionKey {
	pub fn of<T: Any>(tags: &[&str]) -> Self {
		let mut tags = tags.iter().map(|t| (*t).to_owned()).collect::<Vec<_>>();
		tags.sort_unstable();
		Self { type_name: type_name::<T>(), tags }
	}
}

/// Values a director makes available to executing jobs.
#[derive(Default)]
pub struct InjectionRegistry {
	values: RwLock<HashMap<InjectionKey, Arc<dyn Any + Send + Sync>>>,
}

impl InjectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn provide<T: Send + Sync + 'static>(&self, value: Arc<T>) {
		self.provide_tagged(&[], value)
	}

	pub fn provide_tagged<T: Send + Sync + 'static>(&self, tags: &[&str], value: Arc<T>) {
		self.values
			.write()
			.expect("injection registry poisoned")
			.insert(InjectionKey::of::<T>(tags), value);
	}

	pub fn try_resolve<T: Send + Sync + 'static>(&self, tags: &[&str]) -> Option<Arc<T>> {
		self.values
			.read()
			.expect("injection registry poisoned")
			.get(&InjectionKey::of::<T>(tags))
			.cloned()
			.and_then(|value| value.downcast::<T>().ok())
	}

	/// Resolve an injected value.
	///
	/// # Panics
	///
	/// Panics when no value was provided under the key; reading unknown
	/// injection keys is a programming error.
	pub fn resolve<T: Send + Sync + 'static>(&self, tags: &[&str]) -> Arc<T> {
		self.try_resolve(tags).unwrap_or_else(|| {
			panic!(
				"no injected value for type `{}` with tags {tags:?}",
				type_name::<T>()
			)
		})
	}
}

/// Read an injected value from the current execution scope's director.
///
/// # Panics
///
/// Panics outside of a job execution scope, or when the key is unknown.
pub fn injected<T: Send + Sync + 'static>(tags: &[&str]) -> Arc<T> {
	ExecutionScope::current().director().injection().resolve(tags)
}
