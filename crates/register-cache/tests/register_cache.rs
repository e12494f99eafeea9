use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use kubrick_register_cache::{RegisterCache, RegisterFailure, RegisterStore};
use tokio::{sync::oneshot, time::sleep};

#[derive(Debug, thiserror::Error)]
enum MemoryStoreError {
	#[error("initializer failed: {0}")]
	Init(String),
}

#[derive(Default)]
struct MemoryStore {
	rows: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
	fn preloaded(key: &str, value: u64) -> Self {
		let store = Self::default();
		store.rows.lock().unwrap().insert(key.to_owned(), value);
		store
	}

	fn row(&self, key: &str) -> Option<u64> {
		self.rows.lock().unwrap().get(key).copied()
	}
}

#[async_trait]
impl RegisterStore<String, u64> for MemoryStore {
	type Error = MemoryStoreError;

	async fn value(&self, key: &String) -> Result<Option<u64>, Self::Error> {
		Ok(self.rows.lock().unwrap().get(key).copied())
	}

	async fn update_value(&self, key: &String, value: &u64) -> Result<(), Self::Error> {
		self.rows.lock().unwrap().insert(key.clone(), *value);
		Ok(())
	}

	async fn remove_value(&self, key: &String) -> Result<(), Self::Error> {
		self.rows.lock().unwrap().remove(key);
		Ok(())
	}
}

fn cache() -> (RegisterCache<String, u64, MemoryStore>, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::default());
	(RegisterCache::new(Arc::clone(&store)), store)
}

#[tokio::test]
async fn initializer_runs_once_across_concurrent_registers() -> Result<()> {
	let (cache, store) = cache();
	let runs = Arc::new(AtomicUsize::new(0));

	let handles = (0..16)
		.map(|_| {
			let cache = cache.clone();
			let runs = Arc::clone(&runs);
			tokio::spawn(async move {
				cache
					.register("answer".to_owned(), move || async move {
						runs.fetch_add(1, Ordering::SeqCst);
						sleep(Duration::from_millis(20)).await;
						Ok(42)
					})
					.await
			})
		})
		.collect::<Vec<_>>();

	for handle in handles {
		assert_eq!(handle.await??, 42);
	}

	assert_eq!(runs.load(Ordering::SeqCst), 1);
	assert_eq!(store.row("answer"), Some(42));
	Ok(())
}

#[tokio::test]
async fn parked_waiters_observe_later_registration() -> Result<()> {
	let (cache, _) = cache();

	let waiter = {
		let cache = cache.clone();
		tokio::spawn(async move { cache.value_when_available("slow".to_owned()).await })
	};

	// Let the waiter park before anything is registered.
	sleep(Duration::from_millis(10)).await;

	let registered = cache.register("slow".to_owned(), || async { Ok(7) }).await?;

	assert_eq!(registered, 7);
	assert_eq!(waiter.await??, 7);
	Ok(())
}

#[tokio::test]
async fn persisted_value_short_circuits_initializer() -> Result<()> {
	let store = Arc::new(MemoryStore::preloaded("cached", 99));
	let cache = RegisterCache::new(Arc::clone(&store));

	let value = cache
		.register("cached".to_owned(), || async {
			panic!("initializer must not run for persisted values")
		})
		.await?;

	assert_eq!(value, 99);
	Ok(())
}

#[tokio::test]
async fn failed_initializer_broadcasts_same_error_to_all_waiters() -> Result<()> {
	let (cache, store) = cache();

	let waiter = {
		let cache = cache.clone();
		tokio::spawn(async move { cache.value_when_available("bad".to_owned()).await })
	};

	let registered = cache
		.register("bad".to_owned(), || async {
			Err(MemoryStoreError::Init("boom".to_owned()))
		})
		.await;

	let failure = registered.unwrap_err();
	assert!(matches!(&failure, RegisterFailure::Failed(err) if err.to_string().contains("boom")));
	assert!(matches!(waiter.await?.unwrap_err(), RegisterFailure::Failed(_)));

	// Failures are never persisted.
	assert_eq!(store.row("bad"), None);
	Ok(())
}

#[tokio::test]
async fn failure_stays_cached_until_deregistered() -> Result<()> {
	let (cache, _) = cache();
	let runs = Arc::new(AtomicUsize::new(0));

	for attempt in 0..2 {
		let runs = Arc::clone(&runs);
		let outcome = cache
			.register("flaky".to_owned(), move || async move {
				runs.fetch_add(1, Ordering::SeqCst);
				Err(MemoryStoreError::Init(format!("attempt {attempt}")))
			})
			.await;
		assert!(outcome.is_err());
	}

	// Second register reused the cached failure.
	assert_eq!(runs.load(Ordering::SeqCst), 1);

	cache.deregister(&"flaky".to_owned()).await?;

	let value = cache.register("flaky".to_owned(), || async { Ok(5) }).await?;
	assert_eq!(value, 5);
	assert_eq!(runs.load(Ordering::SeqCst), 1);
	Ok(())
}

#[tokio::test]
async fn cancelled_register_caller_deregisters_and_aborts_initializer() -> Result<()> {
	let (cache, store) = cache();
	let (started_tx, started_rx) = oneshot::channel();
	let finished = Arc::new(AtomicUsize::new(0));

	let register = {
		let cache = cache.clone();
		let finished = Arc::clone(&finished);
		tokio::spawn(async move {
			cache
				.register("doomed".to_owned(), move || async move {
					let _ = started_tx.send(());
					sleep(Duration::from_secs(60)).await;
					finished.fetch_add(1, Ordering::SeqCst);
					Ok(1)
				})
				.await
		})
	};

	started_rx.await?;
	register.abort();
	let _ = register.await;

	// The drop guard deregisters asynchronously.
	for _ in 0..50 {
		if !cache.is_registered(&"doomed".to_owned()) {
			break;
		}
		sleep(Duration::from_millis(10)).await;
	}

	assert!(!cache.is_registered(&"doomed".to_owned()));
	assert_eq!(finished.load(Ordering::SeqCst), 0);
	assert_eq!(store.row("doomed"), None);
	Ok(())
}

#[tokio::test]
async fn deregister_cancels_parked_waiters() -> Result<()> {
	let (cache, _) = cache();

	let waiter = {
		let cache = cache.clone();
		tokio::spawn(async move { cache.value_when_available("orphan".to_owned()).await })
	};

	sleep(Duration::from_millis(10)).await;
	cache.deregister(&"orphan".to_owned()).await?;

	assert!(matches!(
		waiter.await?.unwrap_err(),
		RegisterFailure::Deregistered
	));
	Ok(())
}

#[tokio::test]
async fn deregister_removes_persisted_row() -> Result<()> {
	let store = Arc::new(MemoryStore::preloaded("row", 3));
	let cache = RegisterCache::new(Arc::clone(&store));

	cache.register("row".to_owned(), || async { Ok(3) }).await?;
	cache.deregister(&"row".to_owned()).await?;

	assert_eq!(store.row("row"), None);
	assert!(!cache.is_registered(&"row".to_owned()));
	Ok(())
}

#[tokio::test]
async fn value_if_registered_distinguishes_vacant_keys() -> Result<()> {
	let (cache, _) = cache();

	assert!(cache.value_if_registered(&"missing".to_owned()).await.is_none());

	cache.register("present".to_owned(), || async { Ok(11) }).await?;

	let value = cache
		.value_if_registered(&"present".to_owned())
		.await
		.expect("registered key")?;
	assert_eq!(value, 11);
	Ok(())
}
