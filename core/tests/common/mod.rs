//! Shared fixtures for director integration tests.
#![allow(dead_code)]

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use kubrick_core::prelude::*;
use serde::{Deserialize, Serialize};

/// Observable side-effect target injected into test jobs.
#[derive(Default)]
pub struct Sink {
	lines: Mutex<Vec<String>>,
	executions: AtomicUsize,
	attempts: Mutex<BTreeMap<u64, u32>>,
}

impl Sink {
	pub fn record(&self, line: impl Into<String>) {
		self.lines.lock().unwrap().push(line.into());
	}

	pub fn lines(&self) -> Vec<String> {
		self.lines.lock().unwrap().clone()
	}

	pub fn bump_executions(&self) -> usize {
		self.executions.fetch_add(1, Ordering::SeqCst) + 1
	}

	pub fn executions(&self) -> usize {
		self.executions.load(Ordering::SeqCst)
	}

	pub fn bump_attempt(&self, id: u64) -> u32 {
		let mut attempts = self.attempts.lock().unwrap();
		let count = attempts.entry(id).or_insert(0);
		*count += 1;
		*count
	}
}

/// Route director tracing through the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Poll `check` until it holds or `deadline` elapses.
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
	let start = std::time::Instant::now();
	while start.elapsed() < deadline {
		if check() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	check()
}

pub fn sink_of(director: &JobDirector) -> Arc<Sink> {
	director.injection().resolve::<Sink>(&[])
}

/// Records its text once per distinct execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Print {
	pub text: String,
}

#[async_trait]
impl Job for Print {
	type Value = ();

	async fn execute(&self) -> JobResult<()> {
		let sink = injected::<Sink>(&[]);
		sink.bump_executions();
		sink.record(self.text.clone());
		Ok(())
	}
}

/// Runs `Print("A")` twice and `Print("B")` once dynamically.
#[derive(Debug, Serialize, Deserialize)]
pub struct DynamicMain;

#[async_trait]
impl Job for DynamicMain {
	type Value = ();

	async fn execute(&self) -> JobResult<()> {
		let dynamic = DynamicJobDirector::current();
		dynamic.run(Print { text: "A".into() }).await?;
		dynamic.run(Print { text: "A".into() }).await?;
		dynamic.run(Print { text: "B".into() }).await?;
		Ok(())
	}
}

impl SubmittableJob for DynamicMain {
	const TYPE_ID: &'static str = "test.dynamic-main";
}

/// Produces a derived value from its bound source.
pub struct Fetch {
	pub source: JobInput<String>,
}

impl Fetch {
	pub fn new(url: impl Into<String>) -> Self {
		Self { source: JobInput::constant(url.into()) }
	}
}

#[async_trait]
impl Job for Fetch {
	type Value = String;

	fn input_descriptors(&self) -> Vec<std::sync::Arc<dyn InputDescriptor>> {
		vec![self.source.descriptor()]
	}

	async fn execute(&self) -> JobResult<String> {
		injected::<Sink>(&[]).bump_executions();
		Ok(format!("fetched:{}", self.source.value()?))
	}
}

/// Fans a name→source mapping out over `Fetch` jobs and records the
/// collected mapping.
#[derive(Debug, Serialize, Deserialize)]
pub struct Batch {
	pub sources: BTreeMap<String, String>,
}

#[async_trait]
impl Job for Batch {
	type Value = ();

	async fn execute(&self) -> JobResult<()> {
		let dynamic = DynamicJobDirector::current();

		let mut collected = BTreeMap::new();
		for (name, source) in &self.sources {
			collected.insert(name.clone(), dynamic.run(Fetch::new(source)).await?);
		}

		let sink = injected::<Sink>(&[]);
		for (name, value) in collected {
			sink.record(format!("{name}={value}"));
		}
		Ok(())
	}
}

impl SubmittableJob for Batch {
	const TYPE_ID: &'static str = "test.batch";
}

/// Counts global executions; used for dedup and restart assertions.
#[derive(Debug, Serialize, Deserialize)]
pub struct Counting;

#[async_trait]
impl Job for Counting {
	type Value = ();

	async fn execute(&self) -> JobResult<()> {
		let sink = injected::<Sink>(&[]);
		sink.bump_executions();
		sink.record("counted");
		Ok(())
	}
}

impl SubmittableJob for Counting {
	const TYPE_ID: &'static str = "test.counting";
}

/// Fails while the sink-global execution count is below `fail_under`;
/// succeeds with the per-`unique` attempt number.
pub struct Flaky {
	pub fail_under: u32,
	pub unique: JobInput<u64>,
}

impl Flaky {
	pub fn new(fail_under: u32, unique: u64) -> Self {
		Self { fail_under, unique: JobInput::constant(unique) }
	}
}

#[async_trait]
impl Job for Flaky {
	type Value = u32;

	fn input_descriptors(&self) -> Vec<std::sync::Arc<dyn InputDescriptor>> {
		vec![self.unique.descriptor()]
	}

	async fn execute(&self) -> JobResult<u32> {
		let sink = injected::<Sink>(&[]);
		let unique = self.unique.value()?;
		let total = sink.bump_executions() as u32;
		let attempt = sink.bump_attempt(unique);

		if total < self.fail_under {
			Err(JobError::native(format!("attempt {total} failed")))
		} else {
			Ok(attempt)
		}
	}
}

/// Always fails with a native error carrying its label.
pub struct FailJob {
	pub label: String,
}

#[async_trait]
impl Job for FailJob {
	type Value = u32;

	async fn execute(&self) -> JobResult<u32> {
		Err(JobError::native(self.label.clone()))
	}
}

/// Sums two bound inputs.
pub struct Combine {
	pub a: JobInput<u32>,
	pub b: JobInput<u32>,
}

#[async_trait]
impl Job for Combine {
	type Value = u32;

	fn input_descriptors(&self) -> Vec<std::sync::Arc<dyn InputDescriptor>> {
		vec![self.a.descriptor(), self.b.descriptor()]
	}

	async fn execute(&self) -> JobResult<u32> {
		Ok(self.a.value()? + self.b.value()?)
	}
}

/// Slow leaf used to exercise single-flight execution.
pub struct Slow;

#[async_trait]
impl Job for Slow {
	type Value = u64;

	async fn execute(&self) -> JobResult<u64> {
		injected::<Sink>(&[]).bump_executions();
		tokio::time::sleep(Duration::from_millis(100)).await;
		Ok(7)
	}
}
