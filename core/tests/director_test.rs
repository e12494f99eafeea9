//! End-to-end director behavior over a real filesystem store.

mod common;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Result;
use common::*;
use kubrick_core::prelude::*;
use serde::{Deserialize, Serialize};

fn director(base: &std::path::Path) -> Result<JobDirector> {
	init_tracing();
	let director = JobDirector::builder(DirectorId::new("main")?, base)
		.register_job::<DynamicMain>()
		.register_job::<Batch>()
		.register_job::<Counting>()
		.register_job::<ScenarioMain>()
		.build()?;
	director.injection().provide(Arc::new(Sink::default()));
	Ok(director)
}

/// Runs the scenario picked by `scenario` and records observations; root
/// jobs report nothing, so assertions go through the injected sink.
#[derive(Debug, Serialize, Deserialize)]
struct ScenarioMain {
	scenario: String,
}

#[async_trait]
impl Job for ScenarioMain {
	type Value = ();

	async fn execute(&self) -> JobResult<()> {
		let dynamic = DynamicJobDirector::current();
		let sink = injected::<Sink>(&[]);

		match self.scenario.as_str() {
			"parallel" => {
				let (a, b) = tokio::join!(dynamic.run(Slow), dynamic.run(Slow));
				sink.record(format!("parallel:{},{}", a?, b?));
			}
			"retry" => {
				let a = dynamic
					.run(Flaky::new(4, 1).retry(max_attempts(10)))
					.await?;
				let b = dynamic
					.run(Flaky::new(4, 2).retry(max_attempts(10)))
					.await?;
				sink.record(format!("retry-sum:{}", a + b));
			}
			"retry-exhausted" => {
				let outcome = dynamic
					.result(Flaky::new(10, 3).retry(max_attempts(3)))
					.await;
				sink.record(format!("retry-exhausted:{}", outcome.is_err()));
			}
			"catch" => {
				let caught = dynamic
					.run(FailJob { label: "boom".into() }.catch(|_| Ok(u32::MAX)))
					.await?;
				sink.record(format!("caught:{caught}"));

				let replaced = dynamic
					.result(
						FailJob { label: "boom".into() }
							.catch(|_| Err(JobError::native("replacement"))),
					)
					.await;
				sink.record(format!(
					"replaced:{}",
					replaced.unwrap_err().to_string().contains("replacement")
				));
			}
			"map" => {
				let mapped = dynamic
					.run(Fetch::new("src").map(|value| Ok(value.len() as u64)))
					.await?;
				sink.record(format!("mapped:{mapped}"));
			}
			"map-to-result" => {
				let reified = dynamic
					.run(FailJob { label: "boom".into() }.map_to_result())
					.await?;
				sink.record(format!("reified-err:{}", reified.is_err()));
			}
			"combine" => {
				let value = dynamic
					.run(Combine {
						a: JobInput::constant(2),
						b: JobInput::job(Fetch::new("xy").map(|v| Ok(v.len() as u32))),
					})
					.await?;
				sink.record(format!("combined:{value}"));
			}
			"combine-failures" => {
				let error = dynamic
					.result(Combine {
						a: JobInput::job(FailJob { label: "left".into() }),
						b: JobInput::job(FailJob { label: "right".into() }),
					})
					.await
					.unwrap_err();

				let shape = match &error {
					JobError::MultipleInputsFailed { errors } => format!("composite:{}", errors.len()),
					JobError::Cancelled => "cancelled".to_owned(),
					_ => "single".to_owned(),
				};
				sink.record(format!("combine-failures:{shape}"));
			}
			"unbound" => {
				let error = dynamic
					.result(Combine {
						a: JobInput::constant(1),
						b: JobInput::unbound(),
					})
					.await
					.unwrap_err();
				sink.record(format!(
					"unbound:{}",
					matches!(error, JobError::UnboundInputs { .. })
				));
			}
			"builder" => {
				let value = dynamic
					.run(Combine {
						a: JobInput::with(|b| b.job(Fetch::new("ab").map(|v| Ok(v.len() as u32)))),
						b: JobInput::constant(1),
					})
					.await?;
				sink.record(format!("built:{value}"));
			}
			"external-key" => {
				let key = ExecutionScope::current().external_key(["transfer", "large"])?;
				sink.record(format!("external-key:{key}"));
			}
			other => sink.record(format!("unknown-scenario:{other}")),
		}

		Ok(())
	}
}

impl SubmittableJob for ScenarioMain {
	const TYPE_ID: &'static str = "test.scenario-main";
}

async fn run_scenario(scenario: &str, expected_lines: usize) -> Result<Arc<Sink>> {
	let base = tempfile::tempdir()?;
	let director = director(base.path())?;
	director.start().await?;
	let sink = sink_of(&director);

	assert!(
		director
			.submit(ScenarioMain { scenario: scenario.into() })
			.await?
	);

	let observed = wait_until(Duration::from_secs(10), || {
		sink.lines().len() >= expected_lines
	})
	.await;
	assert!(
		observed,
		"scenario `{scenario}` observed only {:?}",
		sink.lines()
	);

	director.stop(Duration::from_secs(2)).await;
	Ok(sink)
}

#[tokio::test]
async fn submit_is_rejected_before_start() -> Result<()> {
	let base = tempfile::tempdir()?;
	let director = director(base.path())?;

	let error = director.submit(DynamicMain).await.unwrap_err();
	assert!(matches!(error, JobError::DirectorState { .. }));
	Ok(())
}

#[tokio::test]
async fn dynamic_jobs_deduplicate_identical_invocations() -> Result<()> {
	let base = tempfile::tempdir()?;
	let director = director(base.path())?;
	director.start().await?;
	let sink = sink_of(&director);

	assert!(director.submit(DynamicMain).await?);

	assert!(wait_until(Duration::from_secs(10), || sink.lines().len() == 2).await);
	assert_eq!(sink.lines(), vec!["A".to_owned(), "B".to_owned()]);
	assert_eq!(sink.executions(), 2);

	director.stop(Duration::from_secs(2)).await;
	Ok(())
}

#[tokio::test]
async fn batch_collects_every_entry() -> Result<()> {
	let base = tempfile::tempdir()?;
	let director = director(base.path())?;
	director.start().await?;
	let sink = sink_of(&director);

	let sources = BTreeMap::from([
		("fast".to_owned(), "url-a".to_owned()),
		("slow".to_owned(), "url-b".to_owned()),
	]);
	assert!(director.submit(Batch { sources }).await?);

	assert!(wait_until(Duration::from_secs(10), || sink.lines().len() == 2).await);
	assert_eq!(
		sink.lines(),
		vec!["fast=fetched:url-a".to_owned(), "slow=fetched:url-b".to_owned()]
	);

	director.stop(Duration::from_secs(2)).await;
	Ok(())
}

#[tokio::test]
async fn identical_concurrent_nodes_execute_once() -> Result<()> {
	let sink = run_scenario("parallel", 1).await?;
	assert_eq!(sink.lines(), vec!["parallel:7,7".to_owned()]);
	assert_eq!(sink.executions(), 1);
	Ok(())
}

#[tokio::test]
async fn retry_reexecutes_until_success() -> Result<()> {
	let sink = run_scenario("retry", 1).await?;
	// First invocation needs four attempts, the second then succeeds at once.
	assert_eq!(sink.lines(), vec!["retry-sum:5".to_owned()]);
	Ok(())
}

#[tokio::test]
async fn retry_surfaces_the_last_error_when_exhausted() -> Result<()> {
	let sink = run_scenario("retry-exhausted", 1).await?;
	assert_eq!(sink.lines(), vec!["retry-exhausted:true".to_owned()]);
	// max_attempts(3) allows exactly three executions.
	assert_eq!(sink.executions(), 3);
	Ok(())
}

#[tokio::test]
async fn catch_converts_failures_and_failing_handlers_replace_them() -> Result<()> {
	let sink = run_scenario("catch", 2).await?;
	assert_eq!(
		sink.lines(),
		vec![format!("caught:{}", u32::MAX), "replaced:true".to_owned()]
	);
	Ok(())
}

#[tokio::test]
async fn map_transforms_successes() -> Result<()> {
	let sink = run_scenario("map", 1).await?;
	// "fetched:src" is eleven characters.
	assert_eq!(sink.lines(), vec!["mapped:11".to_owned()]);
	Ok(())
}

#[tokio::test]
async fn map_to_result_reifies_failures() -> Result<()> {
	let sink = run_scenario("map-to-result", 1).await?;
	assert_eq!(sink.lines(), vec!["reified-err:true".to_owned()]);
	Ok(())
}

#[tokio::test]
async fn job_inputs_resolve_in_parallel_and_feed_execute() -> Result<()> {
	let sink = run_scenario("combine", 1).await?;
	// 2 + len("fetched:xy")
	assert_eq!(sink.lines(), vec!["combined:12".to_owned()]);
	Ok(())
}

#[tokio::test]
async fn sibling_failures_combine_or_surface_alone() -> Result<()> {
	let sink = run_scenario("combine-failures", 1).await?;
	let line = sink.lines().pop().unwrap();
	// Sibling cancellation may reduce the composite to the first failure.
	assert!(
		line == "combine-failures:composite:2" || line == "combine-failures:single",
		"unexpected failure shape: {line}"
	);
	Ok(())
}

#[tokio::test]
async fn unbound_inputs_fail_the_node() -> Result<()> {
	let sink = run_scenario("unbound", 1).await?;
	assert_eq!(sink.lines(), vec!["unbound:true".to_owned()]);
	Ok(())
}

#[tokio::test]
async fn builder_bindings_pick_one_branch() -> Result<()> {
	let sink = run_scenario("builder", 1).await?;
	// len("fetched:ab") + 1
	assert_eq!(sink.lines(), vec!["built:11".to_owned()]);
	Ok(())
}

#[tokio::test]
async fn external_key_tags_survive_into_result_rows() -> Result<()> {
	let base = tempfile::tempdir()?;
	let director = director(base.path())?;
	director.start().await?;
	let sink = sink_of(&director);

	let job_id = JobId::new();
	assert!(
		director
			.submit_with(
				ScenarioMain { scenario: "external-key".into() },
				job_id,
				Duration::from_secs(30),
			)
			.await?
	);
	assert!(wait_until(Duration::from_secs(10), || !sink.lines().is_empty()).await);

	let line = sink.lines().pop().unwrap();
	let printed = line.strip_prefix("external-key:").unwrap().to_owned();
	let key: ExternalJobKey = printed.parse()?;
	assert_eq!(key.tags, vec!["transfer".to_owned(), "large".to_owned()]);
	assert_eq!(key.key.id, job_id);

	// The node's result row lands under the tagged file name.
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	loop {
		let results = director.load_job_results(job_id).await?;
		if results
			.iter()
			.any(|(fp, tags, _)| *fp == key.key.fingerprint && *tags == key.tags)
		{
			break;
		}
		assert!(
			std::time::Instant::now() < deadline,
			"no tagged result row: {results:?}"
		);
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	director.stop(Duration::from_secs(2)).await;
	Ok(())
}

#[tokio::test]
async fn duplicate_submissions_inside_the_window_are_dropped() -> Result<()> {
	let base = tempfile::tempdir()?;
	let director = director(base.path())?;
	director.start().await?;
	let sink = sink_of(&director);

	let job_id = JobId::new();
	let mut accepted = 0;
	for _ in 0..10 {
		if director
			.submit_with(Counting, job_id, Duration::from_millis(500))
			.await?
		{
			accepted += 1;
		}
	}

	assert_eq!(accepted, 1);
	assert!(wait_until(Duration::from_secs(5), || sink.executions() == 1).await);

	// The record disappears once its dedup window expires.
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	loop {
		if director.submitted_job_count().await? == 0 {
			break;
		}
		assert!(std::time::Instant::now() < deadline, "submission never expired");
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	director.stop(Duration::from_secs(2)).await;
	Ok(())
}

#[tokio::test]
async fn completed_work_is_not_rerun_after_restart() -> Result<()> {
	let base = tempfile::tempdir()?;
	let job_id = JobId::new();
	let sink = Arc::new(Sink::default());

	{
		let director = director(base.path())?;
		director.injection().provide(Arc::clone(&sink));
		director.start().await?;

		assert!(
			director
				.submit_with(Counting, job_id, Duration::from_secs(30))
				.await?
		);
		assert!(wait_until(Duration::from_secs(5), || sink.executions() == 1).await);

		director.stop(Duration::from_secs(2)).await;
	}

	let director = director(base.path())?;
	director.injection().provide(Arc::clone(&sink));

	// The persisted submission is re-driven, but its result row short-circuits
	// execution.
	assert_eq!(director.start().await?, 1);
	tokio::time::sleep(Duration::from_millis(500)).await;
	assert_eq!(sink.executions(), 1);

	director.stop(Duration::from_secs(2)).await;
	Ok(())
}

#[tokio::test]
async fn result_rows_exist_for_terminated_nodes() -> Result<()> {
	let base = tempfile::tempdir()?;
	let director = director(base.path())?;
	director.start().await?;
	let sink = sink_of(&director);

	let job_id = JobId::new();
	assert!(
		director
			.submit_with(DynamicMain, job_id, Duration::from_secs(30))
			.await?
	);
	assert!(wait_until(Duration::from_secs(10), || sink.lines().len() == 2).await);

	// Root plus the two distinct dynamic children; the root's own row lands
	// just after the last observation.
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	loop {
		let results = director.load_job_results(job_id).await?;
		if results.len() == 3 {
			break;
		}
		assert!(
			std::time::Instant::now() < deadline,
			"expected 3 result rows, found {}",
			results.len()
		);
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	director.stop(Duration::from_secs(2)).await;
	Ok(())
}
