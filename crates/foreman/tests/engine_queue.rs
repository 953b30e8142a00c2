use foreman_core::{
    names, params, CommandError, ConfigDefaults, ExecuteResponse, ExecutionMode, ExecutionStatus,
    Payload,
};
use foreman_testing::{FailingHandler, Harness, RecordingHandler, SlowHandler};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn background_executions_run_in_submission_order() {
    let harness = Harness::new();
    let slow = SlowHandler::new(Duration::from_millis(10));
    harness.engine.register_command("job.run", slow.clone());
    harness.engine.start().unwrap();

    let mut ids = Vec::new();
    for tag in ["first", "second", "third"] {
        match harness
            .engine
            .execute("job.run", params! { "tag" => tag }, ExecutionMode::Background)
            .await
        {
            ExecuteResponse::Queued(id) => ids.push(id),
            other => panic!("expected a queued execution, got {other:?}"),
        }
    }

    assert!(harness.wait_for_history(3, WAIT).await);
    assert_eq!(slow.started(), vec!["first", "second", "third"]);
    assert_eq!(slow.peak_concurrency(), 1);

    let finished: Vec<_> = harness.engine.get_history(10).iter().map(|r| r.id).collect();
    assert_eq!(finished, ids);
    harness.engine.shutdown().await;
}

#[tokio::test]
async fn queued_execution_is_visible_until_it_runs() {
    let harness = Harness::new();
    harness.engine.register_command("job.run", RecordingHandler::new());

    let id = harness
        .engine
        .execute("job.run", params! {}, ExecutionMode::Background)
        .await
        .id();
    let pending = harness.engine.get_record(id).unwrap();
    assert_eq!(pending.status, ExecutionStatus::Queued);
    assert_eq!(harness.engine.status().queue_size, 1);

    harness.engine.start().unwrap();
    assert!(harness.wait_for_history(1, WAIT).await);
    assert_eq!(harness.engine.get_record(id).unwrap().status, ExecutionStatus::Completed);
    harness.engine.shutdown().await;
}

#[tokio::test]
async fn cancelled_execution_never_runs() {
    let harness = Harness::new();
    let slow = SlowHandler::new(Duration::from_millis(5));
    harness.engine.register_command("job.run", slow.clone());

    let mut ids = Vec::new();
    for tag in ["a", "b", "c"] {
        let response = harness
            .engine
            .execute("job.run", params! { "tag" => tag }, ExecutionMode::Background)
            .await;
        ids.push(response.id());
    }

    assert!(harness.engine.cancel(ids[1]));
    assert!(!harness.engine.cancel(ids[1]));

    let cancelled = harness.engine.get_record(ids[1]).unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert_eq!(cancelled.error, Some(CommandError::Cancelled));
    assert_eq!(harness.events.count(names::COMMAND_CANCELLED), 1);

    harness.engine.start().unwrap();
    assert!(harness.wait_for_history(3, WAIT).await);
    assert_eq!(slow.started(), vec!["a", "c"]);
    harness.engine.shutdown().await;
}

#[tokio::test]
async fn full_queue_rejects_with_a_failed_record() {
    let harness =
        Harness::with_defaults(ConfigDefaults::standard().with("engine.max_queue_size", 2));
    harness.engine.register_command("job.run", RecordingHandler::new());

    for _ in 0..2 {
        let response = harness
            .engine
            .execute("job.run", params! {}, ExecutionMode::Background)
            .await;
        assert!(matches!(response, ExecuteResponse::Queued(_)));
    }

    let rejected = harness
        .engine
        .execute("job.run", params! {}, ExecutionMode::Background)
        .await
        .into_record()
        .expect("a rejected execution finishes immediately");
    assert_eq!(rejected.status, ExecutionStatus::Failed);
    assert!(matches!(rejected.error, Some(CommandError::Unavailable(_))));
    assert_eq!(harness.engine.status().queue_size, 2);
}

#[tokio::test]
async fn shutdown_drains_accepted_work_then_refuses_more() {
    let harness = Harness::new();
    let recorder = RecordingHandler::new();
    harness.engine.register_command("job.run", recorder.clone());
    harness.engine.start().unwrap();
    assert!(harness.engine.is_running());

    for n in 0..3 {
        harness
            .engine
            .execute("job.run", params! { "n" => n }, ExecutionMode::Background)
            .await;
    }
    harness.engine.shutdown().await;

    assert!(!harness.engine.is_running());
    assert_eq!(recorder.call_count(), 3);
    assert_eq!(harness.events.count(names::ENGINE_STARTED), 1);
    assert_eq!(harness.events.count(names::ENGINE_STOPPED), 1);

    let refused = harness
        .engine
        .execute("job.run", params! {}, ExecutionMode::Background)
        .await
        .into_record()
        .unwrap();
    assert!(matches!(refused.error, Some(CommandError::Unavailable(_))));
}

#[tokio::test]
async fn failures_are_records_and_events_never_errors() {
    let harness = Harness::new();
    harness
        .engine
        .register_command("deploy.trigger", FailingHandler::new("registry unreachable"));

    let record = harness.run("deploy.trigger --target=prod").await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_message().as_deref(), Some("registry unreachable"));
    assert_eq!(record.params["target"], "prod");

    let failed = harness.bus.get_history(Some(names::COMMAND_FAILED), 10);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kwarg("error").unwrap(), "registry unreachable");
    assert_eq!(failed[0].source(), Some("engine"));
}

#[tokio::test]
async fn submitted_lines_go_through_aliases_and_history() {
    let harness = Harness::new();
    let build = RecordingHandler::replying("queued build");
    harness.engine.register_command("build.trigger", build.clone());

    let record = harness.run("b --target=ios --verbose").await;
    assert!(record.is_success());
    assert_eq!(record.command, "build.trigger");

    let call = build.last_call().unwrap();
    assert_eq!(call["target"], "ios");
    assert_eq!(call["_flags"], serde_json::json!(["verbose"]));
    assert_eq!(harness.engine.processor().history(10), vec!["b --target=ios --verbose"]);
}

#[tokio::test]
async fn shuffled_submissions_keep_fifo_order() {
    let harness = Harness::new();
    let slow = SlowHandler::new(Duration::from_millis(1));
    harness.engine.register_command("job.run", slow.clone());
    harness.engine.start().unwrap();

    let mut tags: Vec<String> = (0..20).map(|n| format!("job-{n}")).collect();
    fastrand::shuffle(&mut tags);
    for tag in &tags {
        harness
            .engine
            .execute("job.run", params! { "tag" => tag }, ExecutionMode::Background)
            .await;
    }

    assert!(harness.wait_for_history(tags.len(), WAIT).await);
    assert_eq!(slow.started(), tags);
    harness.engine.shutdown().await;
}

#[tokio::test]
async fn oversized_command_timeout_means_no_bound() {
    let harness = Harness::new();
    harness.config.set("engine.command_timeout", 1e20);

    let record = harness.run("echo --message=still-here").await;
    assert!(record.is_success(), "{:?}", record.error);

    let record = harness
        .engine
        .execute("echo", params! { "message" => "again" }, ExecutionMode::Inline)
        .await
        .into_record()
        .unwrap();
    assert!(record.is_success());
}

#[tokio::test]
async fn blocking_closure_still_times_out_on_schedule() {
    let harness = Harness::new();
    harness.engine.register_fn("block.op", |_| {
        std::thread::sleep(Duration::from_millis(600));
        Ok("done".into())
    });

    let started = Instant::now();
    let record = harness
        .engine
        .execute_with_timeout("block.op", params! {}, Some(Duration::from_millis(50)))
        .await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error, Some(CommandError::TimedOut(50)));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn closure_handlers_keep_their_context_writes() {
    let harness = Harness::new();
    harness.engine.register_fn("note.take", |ctx| {
        ctx.info("noted");
        ctx.set_metadata("kind", "note");
        Ok(serde_json::Value::Null)
    });

    let record = harness.run("note.take").await;
    assert!(record.is_success());
    assert_eq!(record.logs.len(), 1);
    assert_eq!(record.metadata["kind"], "note");
}

#[tokio::test]
async fn event_history_follows_configured_size() {
    let harness = Harness::new();
    harness.config.set("events.history_size", 5);
    assert_eq!(harness.bus.history_size(), 5);

    for n in 0..12 {
        harness.bus.emit(format!("tick.{n}"), Payload::new());
    }
    let kept: Vec<String> = harness
        .bus
        .get_history(None, 100)
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    assert_eq!(kept, vec!["tick.7", "tick.8", "tick.9", "tick.10", "tick.11"]);
}
