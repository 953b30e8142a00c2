use foreman_core::{
    names, CommandError, ConfigDefaults, RunStatus, StepStatus, WorkflowDefinition, WorkflowError,
    WorkflowStep,
};
use foreman_testing::{FailingHandler, FlakyHandler, Harness, RecordingHandler, SlowHandler};
use serde_json::{json, Map};
use std::time::Duration;

fn chain(id: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(id, "Chain")
        .step(WorkflowStep::new("build", "build.trigger"))
        .step(WorkflowStep::new("test", "test.run").depends_on(["build"]))
        .step(WorkflowStep::new("deploy", "deploy.trigger").depends_on(["test"]))
}

#[tokio::test]
async fn chain_runs_in_dependency_order_and_announces_each_step() {
    let harness = Harness::new();
    for command in ["build.trigger", "test.run", "deploy.trigger"] {
        harness.engine.register_command(command, RecordingHandler::replying(command));
    }
    harness.workflows.register_workflow(chain("ship")).unwrap();

    let run = harness.workflows.run_workflow("ship", Map::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.completed_at.is_some());
    assert_eq!(run.step_results["deploy"], json!("deploy.trigger"));

    let order: Vec<String> = harness
        .engine
        .get_history(10)
        .iter()
        .map(|r| r.command.clone())
        .collect();
    assert_eq!(order, vec!["build.trigger", "test.run", "deploy.trigger"]);

    let workflow_events: Vec<String> = harness
        .events
        .names()
        .into_iter()
        .filter(|n| n.starts_with("workflow_") && n != names::WORKFLOW_REGISTERED)
        .collect();
    assert_eq!(workflow_events.first().map(String::as_str), Some(names::WORKFLOW_STARTED));
    assert_eq!(workflow_events.last().map(String::as_str), Some(names::WORKFLOW_COMPLETED));
    assert_eq!(harness.events.count(names::WORKFLOW_STEP_STARTED), 3);
    assert_eq!(harness.events.count(names::WORKFLOW_STEP_COMPLETED), 3);
}

#[tokio::test]
async fn retries_until_the_step_succeeds() {
    let harness = Harness::new();
    let flaky = FlakyHandler::new(2);
    harness.engine.register_command("net.fetch", flaky.clone());
    harness
        .workflows
        .register_workflow(
            WorkflowDefinition::new("fetch", "Fetch")
                .step(WorkflowStep::new("get", "net.fetch").retries(2)),
        )
        .unwrap();

    let run = harness.workflows.run_workflow("fetch", Map::new()).await.unwrap();
    let step = run.step("get").unwrap();
    assert_eq!(step.status, StepStatus::Success);
    assert_eq!(step.attempts, 3);
    assert_eq!(step.executions.len(), 3);
    assert_eq!(step.result, Some(json!(3)));
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_step_and_skip_dependents() {
    let harness = Harness::new();
    let failing = FailingHandler::new("compiler exploded");
    let later = RecordingHandler::new();
    harness.engine.register_command("build.trigger", failing.clone());
    harness.engine.register_command("test.run", later.clone());
    harness.engine.register_command("deploy.trigger", later.clone());

    let definition = WorkflowDefinition::new("doomed", "Doomed")
        .step(WorkflowStep::new("build", "build.trigger").retries(1))
        .step(WorkflowStep::new("test", "test.run").depends_on(["build"]))
        .step(WorkflowStep::new("deploy", "deploy.trigger").depends_on(["test"]));
    harness.workflows.register_workflow(definition).unwrap();

    let run = harness.workflows.run_workflow("doomed", Map::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let build = run.step("build").unwrap();
    assert_eq!(build.status, StepStatus::Failed);
    assert_eq!(build.attempts, 2);
    assert_eq!(build.error.as_deref(), Some("compiler exploded"));
    assert_eq!(failing.calls(), 2);

    assert_eq!(run.step("test").unwrap().status, StepStatus::Skipped);
    assert_eq!(run.step("deploy").unwrap().status, StepStatus::Skipped);
    assert_eq!(later.call_count(), 0);
}

#[tokio::test]
async fn independent_branch_still_runs_after_a_failure() {
    let harness = Harness::new();
    harness.engine.register_command("lint.run", FailingHandler::new("style"));
    let docs = RecordingHandler::replying("docs built");
    harness.engine.register_command("docs.build", docs.clone());

    let definition = WorkflowDefinition::new("mixed", "Mixed")
        .step(WorkflowStep::new("lint", "lint.run"))
        .step(WorkflowStep::new("docs", "docs.build"))
        .step(WorkflowStep::new("publish", "docs.build").depends_on(["lint", "docs"]));
    harness.workflows.register_workflow(definition).unwrap();

    let run = harness.workflows.run_workflow("mixed", Map::new()).await.unwrap();
    assert_eq!(run.step("docs").unwrap().status, StepStatus::Success);
    assert_eq!(run.step("publish").unwrap().status, StepStatus::Skipped);
    assert_eq!(docs.call_count(), 1);
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn step_timeout_fails_the_attempt() {
    let harness = Harness::new();
    harness
        .engine
        .register_command("slow.op", SlowHandler::new(Duration::from_secs(5)));
    harness
        .workflows
        .register_workflow(
            WorkflowDefinition::new("slow", "Slow")
                .step(WorkflowStep::new("wait", "slow.op").timeout(0.05)),
        )
        .unwrap();

    let run = harness.workflows.run_workflow("slow", Map::new()).await.unwrap();
    let step = run.step("wait").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error, Some(CommandError::TimedOut(50).to_string()));
}

#[tokio::test]
async fn oversized_step_timeout_runs_without_a_bound() {
    let harness = Harness::new();
    harness.engine.register_command("quick.op", RecordingHandler::replying("ok"));
    harness
        .workflows
        .register_workflow(
            WorkflowDefinition::new("big", "Big")
                .step(WorkflowStep::new("s", "quick.op").timeout(1e20)),
        )
        .unwrap();

    let run = harness.workflows.run_workflow("big", Map::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.step_results["s"], json!("ok"));
}

fn long_chain(harness: &Harness, second_step: Duration) {
    harness
        .engine
        .register_command("step.first", SlowHandler::new(Duration::from_millis(20)));
    harness
        .engine
        .register_command("step.second", SlowHandler::new(second_step));
    harness
        .workflows
        .register_workflow(
            WorkflowDefinition::new("long", "Long")
                .step(WorkflowStep::new("a", "step.first"))
                .step(WorkflowStep::new("b", "step.second").depends_on(["a"])),
        )
        .unwrap();
}

#[tokio::test]
async fn workflow_command_is_not_cut_off_by_the_engine_timeout() {
    let harness = Harness::new();
    harness.config.set("engine.command_timeout", 0.15);
    long_chain(&harness, Duration::from_millis(200));

    let record = harness.run("@workflow long").await;
    assert!(record.is_success(), "{:?}", record.error);

    let run = &harness.workflows.get_run_history(Some("long"), 1)[0];
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(harness.events.count(names::WORKFLOW_COMPLETED), 1);
}

#[tokio::test]
async fn interrupted_run_is_finalized_as_failed() {
    let harness = Harness::new();
    long_chain(&harness, Duration::from_secs(5));

    let record = harness
        .engine
        .execute_with_timeout(
            "workflow.run",
            foreman_core::params! { "workflow" => "long" },
            Some(Duration::from_millis(300)),
        )
        .await;
    assert_eq!(record.error, Some(CommandError::TimedOut(300)));

    let run = &harness.workflows.get_run_history(Some("long"), 1)[0];
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.completed_at.is_some());
    assert_eq!(run.step("a").unwrap().status, StepStatus::Success);
    let b = run.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("workflow run interrupted"));

    let completed = harness.bus.get_history(Some(names::WORKFLOW_COMPLETED), 10);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].kwarg("status").unwrap(), "failed");
}

#[tokio::test]
async fn conditions_see_earlier_step_results() {
    let harness = Harness::new();
    harness.engine.register_command("build.trigger", RecordingHandler::replying("ok"));
    let deploy = RecordingHandler::new();
    let rollback = RecordingHandler::new();
    harness.engine.register_command("deploy.trigger", deploy.clone());
    harness.engine.register_command("deploy.rollback", rollback.clone());

    let definition = WorkflowDefinition::new("guarded", "Guarded")
        .step(WorkflowStep::new("build", "build.trigger"))
        .step(
            WorkflowStep::new("deploy", "deploy.trigger")
                .depends_on(["build"])
                .when(r#"${steps.build.result} == "ok""#),
        )
        .step(
            WorkflowStep::new("rollback", "deploy.rollback")
                .depends_on(["build"])
                .when(r#"${steps.build.result} != "ok""#),
        );
    harness.workflows.register_workflow(definition).unwrap();

    let run = harness.workflows.run_workflow("guarded", Map::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.step("deploy").unwrap().status, StepStatus::Success);
    assert_eq!(run.step("rollback").unwrap().status, StepStatus::Skipped);
    assert_eq!(deploy.call_count(), 1);
    assert_eq!(rollback.call_count(), 0);
}

#[tokio::test]
async fn overrides_reach_step_params_with_their_types() {
    let harness = Harness::new();
    let build = RecordingHandler::new();
    harness.engine.register_command("build.trigger", build.clone());

    let definition = WorkflowDefinition::new("release", "Release")
        .variable("version", "1.0.0")
        .variable("shards", 1)
        .step(
            WorkflowStep::new("build", "build.trigger")
                .param("tag", "v${version}")
                .param("shards", "${shards}")
                .param("target", "${build.target}"),
        );
    harness.workflows.register_workflow(definition).unwrap();

    let mut overrides = Map::new();
    overrides.insert("version".into(), json!("2.1.0"));
    overrides.insert("shards".into(), json!(4));
    harness.workflows.run_workflow("release", overrides).await.unwrap();

    let call = build.last_call().unwrap();
    assert_eq!(call["tag"], json!("v2.1.0"));
    assert_eq!(call["shards"], json!(4));
    assert_eq!(call["target"], json!("android"));
}

#[tokio::test]
async fn follow_up_commands_receive_the_outcome() {
    let harness = Harness::new();
    let notify = RecordingHandler::new();
    harness.engine.register_command("notify.send", notify.clone());
    harness.engine.register_command("build.trigger", FailingHandler::new("nope"));

    let definition = WorkflowDefinition::new("watched", "Watched")
        .step(WorkflowStep::new("build", "build.trigger"))
        .on_success("notify.send --channel=releases")
        .on_failure("notify.send --channel=alerts urgent");
    harness.workflows.register_workflow(definition).unwrap();

    let run = harness.workflows.run_workflow("watched", Map::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let call = notify.last_call().unwrap();
    assert_eq!(notify.call_count(), 1);
    assert_eq!(call["channel"], json!("alerts"));
    assert_eq!(call["_positional"], json!(["urgent"]));
    assert_eq!(call["workflow"], json!("watched"));
    assert_eq!(call["run_id"], json!(run.run_id));
    assert_eq!(call["status"], json!("failed"));
    assert!(harness.engine.processor().history(10).is_empty());
}

#[tokio::test]
async fn parallel_rounds_overlap_independent_steps() {
    let harness = Harness::new();
    harness.config.set("workflow.parallel_steps", true);
    let slow = SlowHandler::new(Duration::from_millis(50));
    harness.engine.register_command("job.run", slow.clone());

    let definition = WorkflowDefinition::new("fan", "Fan out")
        .step(WorkflowStep::new("a", "job.run").param("tag", "a"))
        .step(WorkflowStep::new("b", "job.run").param("tag", "b"))
        .step(WorkflowStep::new("c", "job.run").param("tag", "c"))
        .step(
            WorkflowStep::new("join", "job.run")
                .param("tag", "join")
                .depends_on(["a", "b", "c"]),
        );
    harness.workflows.register_workflow(definition).unwrap();

    let run = harness.workflows.run_workflow("fan", Map::new()).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(slow.peak_concurrency(), 3);
    assert_eq!(slow.started().last().map(String::as_str), Some("join"));
}

#[tokio::test]
async fn sequential_rounds_run_one_step_at_a_time() {
    let harness = Harness::new();
    let slow = SlowHandler::new(Duration::from_millis(5));
    harness.engine.register_command("job.run", slow.clone());

    let definition = WorkflowDefinition::new("fan", "Fan out")
        .step(WorkflowStep::new("a", "job.run").param("tag", "a"))
        .step(WorkflowStep::new("b", "job.run").param("tag", "b"));
    harness.workflows.register_workflow(definition).unwrap();

    harness.workflows.run_workflow("fan", Map::new()).await.unwrap();
    assert_eq!(slow.peak_concurrency(), 1);
    assert_eq!(slow.started(), vec!["a", "b"]);
}

#[tokio::test]
async fn run_history_is_most_recent_first_and_capped() {
    let harness =
        Harness::with_defaults(ConfigDefaults::standard().with("workflow.history_limit", 2));
    harness.engine.register_command("build.trigger", RecordingHandler::new());
    harness
        .workflows
        .register_workflow(
            WorkflowDefinition::new("one", "One").step(WorkflowStep::new("s", "build.trigger")),
        )
        .unwrap();

    let mut run_ids = Vec::new();
    for _ in 0..3 {
        run_ids.push(harness.workflows.run_workflow("one", Map::new()).await.unwrap().run_id);
    }

    let history: Vec<String> = harness
        .workflows
        .get_run_history(None, 10)
        .into_iter()
        .map(|r| r.run_id)
        .collect();
    assert_eq!(history, vec![run_ids[2].clone(), run_ids[1].clone()]);
    assert!(harness.workflows.get_run(&run_ids[0]).is_none());
    assert!(harness.workflows.get_run_history(Some("other"), 10).is_empty());
}

#[test]
fn invalid_graphs_are_rejected_at_registration() {
    let harness = Harness::new();

    let cyclic = WorkflowDefinition::new("loop", "Loop")
        .step(WorkflowStep::new("a", "echo").depends_on(["b"]))
        .step(WorkflowStep::new("b", "echo").depends_on(["a"]));
    assert!(matches!(
        harness.workflows.register_workflow(cyclic),
        Err(WorkflowError::Cycle { .. })
    ));

    let dangling =
        WorkflowDefinition::new("dangling", "Dangling").step(WorkflowStep::new("a", "echo").depends_on(["ghost"]));
    assert!(matches!(
        harness.workflows.register_workflow(dangling),
        Err(WorkflowError::UnknownDependency { .. })
    ));

    assert!(harness.workflows.list_workflows().is_empty());
}

#[tokio::test]
async fn bundled_quick_build_runs_against_a_build_handler() {
    let harness = Harness::new();
    let build = RecordingHandler::replying("apk");
    harness.engine.register_command("build.trigger", build.clone());
    harness.workflows.register_builtin_workflows().unwrap();

    let record = harness.run("@workflow quick-build").await;
    assert!(record.is_success(), "{:?}", record.error);
    assert_eq!(build.last_call().unwrap()["target"], json!("android_debug"));

    let missing = harness.run("@workflow build-deploy").await;
    assert!(!missing.is_success());
    assert_eq!(missing.outputs.len(), 1);
}
