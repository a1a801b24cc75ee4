use std::sync::Arc;
use std::time::Duration;

use marshal_core::agents::{
    AgentDefinition, FailureKind, ProgramStep, Resume, RunEvent, StepDirective, TerminalReason,
    program_fn,
};
use marshal_core::runtime::{DetachedStatus, RunNotice, TurnError, TurnResponse};
use marshal_core::test_utils::{
    RecordingExecutor, ScriptedEngine, call_once, init_test_tracing, orchestrator, reader,
};
use marshal_core::{Error, OrchestrationSession, RunStatus, RuntimeConfig};
use marshal_tools::tools::READ_ONLY_TOOLS;
use marshal_tools::{ToolErrorKind, ToolResult};
use serde_json::{Value, json};

fn session(
    config: RuntimeConfig,
    executor: RecordingExecutor,
    engine: Arc<ScriptedEngine>,
    agents: Vec<AgentDefinition>,
) -> OrchestrationSession {
    let mut builder = OrchestrationSession::builder(config)
        .executor(Arc::new(executor))
        .turn_engine(engine);
    for agent in agents {
        builder = builder.agent(agent);
    }
    builder.build().unwrap()
}

fn resolved_results(history: &marshal_core::agents::RunHistory) -> Vec<ToolResult> {
    history
        .events()
        .filter_map(|event| match event {
            RunEvent::ToolCallResolved { result, .. } => Some(result.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn budget_ends_the_run_after_exactly_that_many_turns() {
    init_test_tracing();
    let engine = Arc::new(ScriptedEngine::replying("still thinking", false));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::clone(&engine),
        vec![reader("looper").with_step_budget(3)],
    );

    let outcome = session.run("looper", "think forever", json!({})).await.unwrap();

    assert_eq!(outcome.reason, TerminalReason::BudgetExhausted);
    assert_eq!(outcome.status(), RunStatus::Completed);
    assert_eq!(outcome.turns_used, 3);
    assert_eq!(engine.turns(), 3);
}

#[tokio::test]
async fn model_tool_calls_go_through_the_executor() {
    let engine = Arc::new(ScriptedEngine::new(|request| {
        let answered = request
            .history
            .events()
            .any(|event| matches!(event, RunEvent::ToolCallResolved { .. }));
        Ok(if answered {
            TurnResponse::text("found it", true)
        } else {
            TurnResponse::text("looking", false).with_call("read_files", json!({"paths": ["a.rs"]}))
        })
    }));
    let executor = RecordingExecutor::echo();
    let log = executor.log();
    let session = session(
        RuntimeConfig::default(),
        executor,
        Arc::clone(&engine),
        vec![reader("reader")],
    );

    let outcome = session.run("reader", "find a.rs", json!({})).await.unwrap();

    assert_eq!(outcome.output(), Some(&json!("found it")));
    assert_eq!(log.tool_names(), vec!["read_files".to_string()]);
    assert_eq!(
        resolved_results(&outcome.history),
        vec![ToolResult::Output(json!({"paths": ["a.rs"]}))]
    );
    let first = &engine.requests()[0];
    let mut tools = first.tools.clone();
    tools.sort();
    let mut expected: Vec<String> = READ_ONLY_TOOLS.iter().map(|t| (*t).to_string()).collect();
    expected.sort();
    assert_eq!(tools, expected);
    assert!(first.orchestration_schemas.is_empty());
}

#[tokio::test]
async fn tools_outside_the_definition_are_refused() {
    let executor = RecordingExecutor::echo();
    let log = executor.log();
    let writer = reader("reader").with_program(call_once("write_file", json!({"path": "x"})));
    let session = session(
        RuntimeConfig::default(),
        executor,
        Arc::new(ScriptedEngine::replying("unused", true)),
        vec![writer],
    );

    let outcome = session.run("reader", "write", json!({})).await.unwrap();

    assert_eq!(outcome.output().unwrap()["error"], "not_permitted");
    assert!(log.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_executor_times_the_call_out() {
    let config = RuntimeConfig::from_toml_str("[channel]\ncall_timeout_ms = 200\n").unwrap();
    let agent = reader("reader").with_program(call_once("read_files", json!({"paths": ["a"]})));
    let session = session(
        config,
        RecordingExecutor::silent(),
        Arc::new(ScriptedEngine::replying("unused", true)),
        vec![agent],
    );

    let outcome = session.run("reader", "read", json!({})).await.unwrap();

    assert_eq!(outcome.output().unwrap()["error"], "timeout");
    assert_eq!(
        resolved_results(&outcome.history)[0].error().map(|e| e.kind()),
        Some(ToolErrorKind::Timeout)
    );
}

#[tokio::test]
async fn blocking_spawn_reports_children_and_refusals_in_order() {
    let parent = orchestrator("lead", &["scout"]).with_program(call_once(
        "spawn_agents",
        json!({"agents": [
            {"agent_type": "scout", "prompt": "north"},
            {"agent_type": "saboteur", "prompt": "anything"},
            {"agent_type": "scout", "prompt": "south"},
        ]}),
    ));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(ScriptedEngine::echoing_prompt()),
        vec![parent, reader("scout"), reader("saboteur")],
    );

    let outcome = session.run("lead", "explore", json!({})).await.unwrap();
    let results = outcome.output().unwrap()["results"].as_array().unwrap().clone();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["outcome"], json!({"status": "completed", "output": "north"}));
    assert_eq!(results[1]["outcome"]["status"], "failed");
    assert_eq!(results[1]["outcome"]["kind"], "spawn");
    assert_eq!(results[1]["run_id"], Value::Null);
    assert_eq!(results[2]["outcome"], json!({"status": "completed", "output": "south"}));
}

#[tokio::test]
async fn nesting_stops_at_the_depth_limit() {
    let config = RuntimeConfig::from_toml_str("[interpreter]\nmax_spawn_depth = 1\n").unwrap();
    let recursive = orchestrator("recursive", &["recursive"]).with_program(call_once(
        "spawn_agents",
        json!({"agents": [{"agent_type": "recursive"}]}),
    ));
    let session = session(
        config,
        RecordingExecutor::echo(),
        Arc::new(ScriptedEngine::replying("unused", true)),
        vec![recursive],
    );

    let outcome = session.run("recursive", "go deep", json!({})).await.unwrap();
    let child = &outcome.output().unwrap()["results"][0]["outcome"];
    assert_eq!(child["status"], "completed");
    let grandchild = &child["output"]["results"][0]["outcome"];
    assert_eq!(grandchild["status"], "failed");
    assert_eq!(grandchild["kind"], "spawn");
}

#[tokio::test]
async fn children_can_inherit_the_parent_history() {
    let parent = orchestrator("lead", &["heir"]).with_program(call_once(
        "spawn_agents",
        json!({"agents": [{"agent_type": "heir", "prompt": "continue"}]}),
    ));
    let engine = Arc::new(ScriptedEngine::replying("ok", true));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::clone(&engine),
        vec![parent, reader("heir").inheriting_history()],
    );

    session.run("lead", "the original ask", json!({})).await.unwrap();

    let prompts: Vec<String> = engine.requests()[0]
        .history
        .events()
        .filter_map(|event| match event {
            RunEvent::UserPrompt { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(prompts, vec!["the original ask".to_string(), "continue".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn detached_children_outlive_their_parent() {
    let parent = orchestrator("lead", &["scout"]).with_program(call_once(
        "spawn_agents_async",
        json!({"agents": [{"agent_type": "scout", "prompt": "far away"}]}),
    ));
    let engine = ScriptedEngine::echoing_prompt().with_latency(|_| Duration::from_millis(500));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(engine),
        vec![parent, reader("scout")],
    );
    let mut completions = session.registry().subscribe();

    let outcome = session.run("lead", "delegate", json!({})).await.unwrap();
    let handle = &outcome.output().unwrap()["handles"][0];
    assert_eq!(handle["status"], "started");
    let run_id = handle["run_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(session.registry().children_of(outcome.run_id), vec![run_id]);

    let child = session.registry().wait(run_id, None).await.unwrap();
    assert_eq!(child.output(), Some(&json!("far away")));
    assert_eq!(child.parent_id, Some(outcome.run_id));
    assert_eq!(completions.recv().await.unwrap().run_id, run_id);
}

fn detached_scout_id(outcome: &marshal_core::RunOutcome) -> marshal_tools::RunId {
    let handle = &outcome.output().unwrap()["handles"][0];
    assert_eq!(handle["status"], "started");
    handle["run_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn failed_detached_child_stays_observable_after_parent_ends() {
    let parent = orchestrator("lead", &["scout"]).with_program(call_once(
        "spawn_agents_async",
        json!({"agents": [{"agent_type": "scout", "prompt": "doomed"}]}),
    ));
    let engine = ScriptedEngine::new(|_| Err(TurnError::Model("overloaded".to_string())))
        .with_latency(|_| Duration::from_millis(200));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(engine),
        vec![parent, reader("scout")],
    );

    let outcome = session.run("lead", "delegate", json!({})).await.unwrap();
    assert_eq!(outcome.status(), RunStatus::Completed);
    let run_id = detached_scout_id(&outcome);

    let child = session.registry().wait(run_id, None).await.unwrap();
    assert!(matches!(
        child.reason,
        TerminalReason::Failed { kind: FailureKind::Model, .. }
    ));
    assert_eq!(child.parent_id, Some(outcome.run_id));
    assert!(matches!(
        session.registry().poll(run_id),
        Some(DetachedStatus::Finished(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn panicking_detached_child_is_recorded_as_failed() {
    // Spawn a child whose program panics, then await it with no deadline.
    let program = program_fn(|view| match (view.cursor, view.resume) {
        (0, Resume::Start) => ProgramStep::Yield(StepDirective::tool(
            "spawn_agents_async",
            json!({"agents": [{"agent_type": "scout", "prompt": "boom"}]}),
        )),
        (1, Resume::ToolResult { result, .. }) => {
            let run_id = result.output().map(|out| out["handles"][0]["run_id"].clone());
            ProgramStep::Yield(StepDirective::tool(
                "await_agents",
                json!({"run_ids": [run_id.unwrap_or_default()]}),
            ))
        }
        (_, Resume::ToolResult { result, .. }) => ProgramStep::Return(result.output().cloned()),
        _ => ProgramStep::Return(None),
    });
    let parent = orchestrator("lead", &["scout"]).with_program(program);
    let scout = reader("scout").with_program(program_fn(|_| panic!("scout program blew up")));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(ScriptedEngine::replying("unused", true)),
        vec![parent, scout],
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        session.run("lead", "delegate", json!({})),
    )
    .await
    .expect("awaiting a panicked child must not hang")
    .unwrap();

    let awaited = &outcome.output().unwrap()[0];
    assert_eq!(awaited["status"]["state"], "finished");
    assert_eq!(awaited["status"]["outcome"]["status"], "failed");
    assert_eq!(awaited["status"]["outcome"]["kind"], "internal");

    let run_id = awaited["run_id"].as_str().unwrap().parse().unwrap();
    let child = session
        .registry()
        .wait(run_id, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(child.agent_type, "scout");
    assert_eq!(child.parent_id, Some(outcome.run_id));
    assert!(matches!(
        child.reason,
        TerminalReason::Failed { kind: FailureKind::Internal, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn handles_can_be_checked_and_awaited() {
    // spawn_agents_async, then check_agent, then await_agents, then return.
    let program = program_fn(|view| match (view.cursor, view.resume) {
        (0, Resume::Start) => ProgramStep::Yield(StepDirective::tool(
            "spawn_agents_async",
            json!({"agents": [{"agent_type": "scout", "prompt": "slow"}]}),
        )),
        (1, Resume::ToolResult { result, .. }) => {
            let run_id = result.output().map(|out| out["handles"][0]["run_id"].clone());
            ProgramStep::Yield(StepDirective::tool(
                "check_agent",
                json!({"run_id": run_id.unwrap_or_default()}),
            ))
        }
        (2, Resume::ToolResult { result, .. }) => {
            let run_id = result.output().map(|out| out["run_id"].clone());
            ProgramStep::Yield(StepDirective::tool(
                "await_agents",
                json!({"run_ids": [run_id.unwrap_or_default(), "not-a-run"]}),
            ))
        }
        (_, Resume::ToolResult { result, .. }) => {
            let checked = view
                .history
                .events()
                .filter_map(|event| match event {
                    RunEvent::ToolCallResolved { tool_name, result, .. }
                        if tool_name == "check_agent" =>
                    {
                        result.output().cloned()
                    }
                    _ => None,
                })
                .next();
            ProgramStep::Return(Some(json!({
                "checked": checked,
                "awaited": result.output(),
            })))
        }
        _ => ProgramStep::Return(None),
    });
    let parent = orchestrator("lead", &["scout"]).with_program(program);
    let engine = ScriptedEngine::echoing_prompt().with_latency(|_| Duration::from_millis(300));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(engine),
        vec![parent, reader("scout")],
    );

    let outcome = session.run("lead", "delegate", json!({})).await.unwrap();
    let output = outcome.output().unwrap();

    assert_eq!(output["checked"]["status"]["state"], "running");
    let awaited = output["awaited"].as_array().unwrap();
    assert_eq!(awaited[0]["status"]["state"], "finished");
    assert_eq!(
        awaited[0]["status"]["outcome"],
        json!({"status": "completed", "output": "slow"})
    );
    assert_eq!(awaited[1]["status"]["state"], "unknown");
}

#[tokio::test(start_paused = true)]
async fn await_reports_running_children_at_the_deadline() {
    let program = program_fn(|view| match (view.cursor, view.resume) {
        (0, Resume::Start) => ProgramStep::Yield(StepDirective::tool(
            "spawn_agents_async",
            json!({"agents": [{"agent_type": "scout", "prompt": "slow"}]}),
        )),
        (1, Resume::ToolResult { result, .. }) => {
            let run_id = result.output().map(|out| out["handles"][0]["run_id"].clone());
            ProgramStep::Yield(StepDirective::tool(
                "await_agents",
                json!({"run_ids": [run_id.unwrap_or_default()], "timeout_ms": 100}),
            ))
        }
        (_, Resume::ToolResult { result, .. }) => ProgramStep::Return(result.output().cloned()),
        _ => ProgramStep::Return(None),
    });
    let parent = orchestrator("lead", &["scout"]).with_program(program);
    let engine = ScriptedEngine::echoing_prompt().with_latency(|_| Duration::from_secs(10));
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(engine),
        vec![parent, reader("scout")],
    );

    let started = tokio::time::Instant::now();
    let outcome = session.run("lead", "delegate", json!({})).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(outcome.output().unwrap()[0]["status"]["state"], "running");
}

#[tokio::test(start_paused = true)]
async fn research_is_capped_and_read_only() {
    let config = RuntimeConfig::from_toml_str(
        "[research]\nmax_concurrency = 2\nstep_budget = 2\ntools = [\"read_files\"]\n",
    )
    .unwrap();
    let parent = orchestrator("lead", &[]).with_program(call_once(
        "research",
        json!({"prompts": ["one", "two", "three", "four", "five"]}),
    ));
    let engine = Arc::new(
        ScriptedEngine::echoing_prompt().with_latency(|_| Duration::from_millis(50)),
    );
    let researcher = reader("researcher").with_tools(["write_file"]);
    let session = session(
        config,
        RecordingExecutor::echo(),
        Arc::clone(&engine),
        vec![parent, researcher],
    );

    let outcome = session.run("lead", "investigate", json!({})).await.unwrap();

    assert_eq!(
        outcome.output().unwrap()["summaries"],
        json!(["one", "two", "three", "four", "five"])
    );
    assert_eq!(engine.turns(), 5);
    assert!(engine.peak_in_flight() <= 2);
    for request in engine.requests() {
        assert_eq!(request.tools, vec!["read_files".to_string()]);
        // Research children start from an empty history.
        assert_eq!(request.history.len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_session_cancels_runs() {
    let engine = ScriptedEngine::replying("slow", true).with_latency(|_| Duration::from_secs(60));
    let session = Arc::new(session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(engine),
        vec![reader("reader")],
    ));

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run("reader", "wait", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.cancel_all();

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.reason, TerminalReason::Cancelled);
    assert_eq!(outcome.status(), RunStatus::Cancelled);

    assert!(matches!(
        session.run("reader", "again", json!({})).await,
        Err(Error::Cancelled)
    ));
}

#[tokio::test]
async fn unknown_root_agents_are_an_error() {
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(ScriptedEngine::replying("unused", true)),
        vec![],
    );
    assert!(matches!(
        session.run("ghost", "boo", json!({})).await,
        Err(Error::UnknownAgent(name)) if name == "ghost"
    ));
}

#[tokio::test]
async fn model_failures_fail_the_run() {
    let engine = ScriptedEngine::new(|_| {
        Err(marshal_core::runtime::TurnError::Model("overloaded".to_string()))
    });
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(engine),
        vec![reader("reader")],
    );

    let outcome = session.run("reader", "hi", json!({})).await.unwrap();
    assert_eq!(outcome.status(), RunStatus::Failed);
    assert!(matches!(
        outcome.reason,
        TerminalReason::Failed { kind: marshal_core::agents::FailureKind::Model, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn slow_turns_time_out() {
    let config = RuntimeConfig::from_toml_str("[interpreter]\nturn_timeout_ms = 1000\n").unwrap();
    let engine = ScriptedEngine::replying("late", true).with_latency(|_| Duration::from_secs(5));
    let session = session(
        config,
        RecordingExecutor::echo(),
        Arc::new(engine),
        vec![reader("reader")],
    );

    let outcome = session.run("reader", "hi", json!({})).await.unwrap();
    assert!(matches!(
        outcome.reason,
        TerminalReason::Failed { kind: marshal_core::agents::FailureKind::Timeout, .. }
    ));
}

#[tokio::test]
async fn notices_follow_the_run() {
    let session = session(
        RuntimeConfig::default(),
        RecordingExecutor::echo(),
        Arc::new(ScriptedEngine::replying("done", true)),
        vec![reader("reader")],
    );
    let mut notices = session.subscribe();

    let outcome = session.run("reader", "hi", json!({})).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        assert_eq!(notice.run_id(), outcome.run_id);
        seen.push(notice);
    }
    assert!(matches!(seen.first(), Some(RunNotice::Started { depth: 0, .. })));
    assert!(matches!(
        seen.last(),
        Some(RunNotice::Finished { reason: TerminalReason::Completed { .. }, .. })
    ));
    assert!(seen.iter().any(|notice| matches!(
        notice,
        RunNotice::StatusChanged { status: RunStatus::Completed, .. }
    )));
}
