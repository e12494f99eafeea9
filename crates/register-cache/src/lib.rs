//! Single-flight register cache over a persistent backing store.
//!
//! A [`RegisterCache`] maps keys to values that are expensive to produce and
//! must be produced at most once. The first caller to [`RegisterCache::register`]
//! a key installs an initializer; every other caller, whether it arrived
//! before or after registration, shares the exact same outcome. Before the
//! initializer runs, the backing [`RegisterStore`] is consulted so values that
//! survived a previous process run are reused instead of recomputed.

use std::{
	collections::HashMap,
	fmt::Debug,
	future::Future,
	hash::Hash,
	sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{trace, warn};

/// Persistent backing store consulted before an initializer runs and updated
/// after it succeeds.
#[async_trait]
pub trait RegisterStore<K, V>: Send + Sync + 'static {
	type Error: std::error::Error + Send + Sync + 'static;

	/// Load a previously persisted value, if any.
	async fn value(&self, key: &K) -> Result<Option<V>, Self::Error>;

	/// Persist a freshly initialized value.
	async fn update_value(&self, key: &K, value: &V) -> Result<(), Self::Error>;

	/// Remove a persisted value. Must be idempotent.
	async fn remove_value(&self, key: &K) -> Result<(), Self::Error>;
}

/// Why a waiter did not receive a value.
#[derive(Debug, thiserror::Error)]
pub enum RegisterFailure<E> {
	/// The entry was deregistered (or its registering caller cancelled)
	/// before fulfillment.
	#[error("register entry was deregistered before fulfillment")]
	Deregistered,

	/// The initializer or the backing store failed. The same error instance
	/// is broadcast to every waiter.
	#[error("{0}")]
	Failed(Arc<E>),
}

impl<E> Clone for RegisterFailure<E> {
	fn clone(&self) -> Self {
		match self {
			Self::Deregistered => Self::Deregistered,
			Self::Failed(e) => Self::Failed(Arc::clone(e)),
		}
	}
}

pub type RegisterResult<V, E> = Result<V, RegisterFailure<E>>;

type Slot<V, E> = Arc<watch::Sender<Option<RegisterResult<V, E>>>>;

enum EntryState {
	/// Waiters arrived before anyone registered an initializer.
	Pending,
	/// An initializer (or persistent load) is in flight or has completed.
	Registered { task: JoinHandle<()> },
}

struct Entry<V, E> {
	slot: Slot<V, E>,
	state: EntryState,
}

struct Inner<K, V, S: RegisterStore<K, V>> {
	entries: Mutex<HashMap<K, Entry<V, S::Error>>>,
	store: Arc<S>,
}

/// Single-flight, broadcast-to-waiters, persistence-backed map.
///
/// All entry-map mutations happen under one serialized critical section;
/// initializers and store I/O always run outside of it.
pub struct RegisterCache<K, V, S: RegisterStore<K, V>> {
	inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S: RegisterStore<K, V>> Clone for RegisterCache<K, V, S> {
	fn clone(&self) -> Self {
		Self { inner: Arc::clone(&self.inner) }
	}
}

impl<K, V, S> RegisterCache<K, V, S>
where
	K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
	S: RegisterStore<K, V>,
{
	pub fn new(store: Arc<S>) -> Self {
		Self {
			inner: Arc::new(Inner { entries: Mutex::new(HashMap::new()), store }),
		}
	}

	pub fn store(&self) -> &Arc<S> {
		&self.inner.store
	}

	/// Register an initializer for `key` and await the shared outcome.
	///
	/// If the key is vacant or only has parked waiters, a task is spawned
	/// that first consults the store and only calls `init` on a miss; the
	/// produced value is persisted and then broadcast. If the key is already
	/// registered, `init` is dropped and the existing outcome is awaited.
	///
	/// Cancelling a caller of `register` triggers an asynchronous
	/// [`deregister`](Self::deregister) of the entry, which also aborts the
	/// in-flight initializer.
	pub async fn register<F, Fut>(&self, key: K, init: F) -> RegisterResult<V, S::Error>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<V, S::Error>> + Send + 'static,
	{
		let mut rx = {
			let mut entries = self.inner.entries.lock().expect("register cache entries poisoned");

			let entry = entries.entry(key.clone()).or_insert_with(|| {
				let (slot, _) = watch::channel(None);
				Entry { slot: Arc::new(slot), state: EntryState::Pending }
			});

			if let EntryState::Pending = entry.state {
				trace!(?key, "starting register initializer");
				let task = self.spawn_initializer(key.clone(), Arc::clone(&entry.slot), init);
				entry.state = EntryState::Registered { task };
			}

			entry.slot.subscribe()
		};

		let guard = DeregisterOnCancel::new(self.clone(), key);
		let outcome = Self::wait_fulfilled(&mut rx).await;
		guard.disarm();
		outcome
	}

	/// Park until `key` has been registered and fulfilled. Never times out.
	pub async fn value_when_available(&self, key: K) -> RegisterResult<V, S::Error> {
		let mut rx = {
			let mut entries = self.inner.entries.lock().expect("register cache entries poisoned");

			entries
				.entry(key)
				.or_insert_with(|| {
					let (slot, _) = watch::channel(None);
					Entry { slot: Arc::new(slot), state: EntryState::Pending }
				})
				.slot
				.subscribe()
		};

		Self::wait_fulfilled(&mut rx).await
	}

	/// Await the current entry's outcome if `key` is not vacant.
	pub async fn value_if_registered(&self, key: &K) -> Option<RegisterResult<V, S::Error>> {
		let mut rx = {
			let entries = self.inner.entries.lock().expect("register cache entries poisoned");
			entries.get(key).map(|entry| entry.slot.subscribe())?
		};

		Some(Self::wait_fulfilled(&mut rx).await)
	}

	/// Remove `key` from the backing store and then from memory, aborting any
	/// in-flight initializer and failing parked waiters with
	/// [`RegisterFailure::Deregistered`].
	pub async fn deregister(&self, key: &K) -> Result<(), S::Error> {
		self.inner.store.remove_value(key).await?;

		let entry = {
			let mut entries = self.inner.entries.lock().expect("register cache entries poisoned");
			entries.remove(key)
		};

		if let Some(entry) = entry {
			trace!(?key, "deregistered entry");
			if let EntryState::Registered { task } = entry.state {
				task.abort();
			}
			// Waiters that never saw a fulfillment are cancelled; an already
			// delivered outcome is left untouched.
			entry.slot.send_if_modified(|value| {
				if value.is_none() {
					*value = Some(Err(RegisterFailure::Deregistered));
					true
				} else {
					false
				}
			});
		}

		Ok(())
	}

	/// Whether `key` currently has an entry (pending or registered).
	pub fn is_registered(&self, key: &K) -> bool {
		self.inner
			.entries
			.lock()
			.expect("register cache entries poisoned")
			.contains_key(key)
	}

	fn spawn_initializer<F, Fut>(&self, key: K, slot: Slot<V, S::Error>, init: F) -> JoinHandle<()>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<V, S::Error>> + Send + 'static,
	{
		let store = Arc::clone(&self.inner.store);

		tokio::spawn(async move {
			let outcome = match store.value(&key).await {
				Ok(Some(value)) => Ok(value),
				Ok(None) => match init().await {
					Ok(value) => match store.update_value(&key, &value).await {
						Ok(()) => Ok(value),
						Err(err) => Err(RegisterFailure::Failed(Arc::new(err))),
					},
					Err(err) => Err(RegisterFailure::Failed(Arc::new(err))),
				},
				Err(err) => Err(RegisterFailure::Failed(Arc::new(err))),
			};

			// Waiters may all have gone away; the outcome stays cached for
			// future callers regardless.
			let _ = slot.send(Some(outcome));
		})
	}

	async fn wait_fulfilled(
		rx: &mut watch::Receiver<Option<RegisterResult<V, S::Error>>>,
	) -> RegisterResult<V, S::Error> {
		match rx.wait_for(Option::is_some).await {
			Ok(fulfilled) => fulfilled.clone().expect("watch fulfilled with value"),
			// Sender dropped without fulfillment: the entry was torn down.
			Err(_) => Err(RegisterFailure::Deregistered),
		}
	}
}

/// Deregisters the guarded key when the owning `register` future is dropped
/// before fulfillment.
struct DeregisterOnCancel<K, V, S>
where
	K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
	S: RegisterStore<K, V>,
{
	cache: RegisterCache<K, V, S>,
	key: Option<K>,
}

impl<K, V, S> DeregisterOnCancel<K, V, S>
where
	K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
	S: RegisterStore<K, V>,
{
	fn new(cache: RegisterCache<K, V, S>, key: K) -> Self {
		Self { cache, key: Some(key) }
	}

	fn disarm(mut self) {
		self.key = None;
	}
}

impl<K, V, S> Drop for DeregisterOnCancel<K, V, S>
where
	K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
	S: RegisterStore<K, V>,
{
	fn drop(&mut self) {
		let Some(key) = self.key.take() else { return };
		let cache = self.cache.clone();

		let Ok(handle) = tokio::runtime::Handle::try_current() else { return };
		handle.spawn(async move {
			if let Err(err) = cache.deregister(&key).await {
				warn!(?key, %err, "failed to deregister cancelled entry");
			}
		});
	}
}
