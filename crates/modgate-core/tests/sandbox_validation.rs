//! End-to-end tests for sandbox screening, execution and scoring.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use modgate_core::sandbox::{
    CandidateModule, ExecContext, ExecError, FnExecutor, PatternPolicy, Readiness,
    SandboxController, SandboxError, SandboxOptions, SandboxSettings, SandboxStatus,
    ScoringConfig, TestScenario, VerdictKind,
};
use serde_json::json;

fn controller_with(max: usize, executor: FnExecutor) -> SandboxController {
    SandboxController::new(
        SandboxSettings {
            max_sandboxes: max,
            monitor_interval_ms: 10,
        },
        ScoringConfig::default(),
        Arc::new(PatternPolicy::default()),
        Arc::new(executor),
    )
}

fn doubling_executor() -> FnExecutor {
    FnExecutor::new(|ctx: ExecContext| async move {
        match ctx.input.as_i64() {
            Some(n) => Ok(json!(n * 2)),
            None => Ok(serde_json::Value::Null),
        }
    })
}

// -------------------------------------------------------------------------
// Policy screening
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_high_severity_source_never_executes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = FnExecutor::new({
        let calls = calls.clone();
        move |_ctx: ExecContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("ran"))
            }
        }
    });
    let controller = controller_with(2, executor);
    let id = controller
        .create_sandbox("evil", SandboxOptions::default())
        .await
        .unwrap();

    let verdict = controller
        .run_module_in_sandbox(
            &id,
            "const x = 1;\neval('process.exit(1)');",
            &[TestScenario::new("t", json!(1), json!(2))],
        )
        .await
        .unwrap();

    assert_eq!(verdict.kind, VerdictKind::SecurityViolation);
    assert_eq!(verdict.output, None);
    assert_eq!(verdict.readiness, Readiness::NotReady);
    assert!(verdict.test_results.is_empty());
    assert!(verdict.security.violations.iter().any(|v| v.line == 2));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        controller.sandbox_status(&id).await.unwrap(),
        SandboxStatus::Failed
    );
    assert!(controller.cleanup_sandbox(&id).await);
}

#[tokio::test]
async fn test_medium_severity_runs_but_lowers_readiness() {
    let controller = controller_with(1, doubling_executor());
    let id = controller
        .create_sandbox("loader", SandboxOptions::default())
        .await
        .unwrap();
    let verdict = controller
        .run_module_in_sandbox(&id, "const fs = require('fs');", &[])
        .await
        .unwrap();

    assert_eq!(verdict.kind, VerdictKind::Completed);
    assert_eq!(verdict.score, 85.0);
    assert_eq!(verdict.readiness, Readiness::NeedsImprovement);
    assert_eq!(verdict.security.violations.len(), 1);
}

// -------------------------------------------------------------------------
// Execution and scoring
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_is_reported_as_verdict() {
    let executor = FnExecutor::new(|_ctx: ExecContext| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(json!("late"))
    });
    let controller = controller_with(1, executor);
    let id = controller
        .create_sandbox(
            "slow",
            SandboxOptions {
                timeout_ms: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let started = Instant::now();
    let verdict = controller
        .run_module_in_sandbox(&id, "while (true) {}", &[])
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(600));

    assert_eq!(verdict.kind, VerdictKind::ExecutionTimeout);
    assert_eq!(verdict.output, None);
    assert_eq!(verdict.readiness, Readiness::NotReady);
    assert_eq!(verdict.health_contribution(), 0.0);
    assert_eq!(
        controller.sandbox_status(&id).await.unwrap(),
        SandboxStatus::Failed
    );
    assert!(controller.cleanup_sandbox(&id).await);
    assert_eq!(controller.active_count().await, 0);
}

#[tokio::test]
async fn test_scenarios_are_recorded_and_archived() {
    let controller = controller_with(1, doubling_executor());
    let module = CandidateModule::new("doubler", "Doubler", "function double(x) { return x * 2; }")
        .with_scenario(TestScenario::new("two", json!(2), json!(4)))
        .with_scenario(TestScenario::new("three", json!(3), json!(6)))
        .with_scenario(TestScenario::new("wrong", json!(5), json!(11)));

    let verdict = controller
        .validate(&module, SandboxOptions::default())
        .await
        .unwrap();

    assert_eq!(verdict.kind, VerdictKind::Completed);
    assert_eq!(verdict.test_results.len(), 3);
    assert!(verdict.test_results[0].passed);
    assert!(!verdict.test_results[2].passed);
    assert_eq!(verdict.test_results[2].actual_output, Some(json!(10)));
    assert!((verdict.pass_rate() - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(verdict.score, 100.0);
    assert!(verdict
        .issues
        .iter()
        .any(|i| i.contains("scenario `wrong` failed")));
    assert!(verdict
        .recommendations
        .iter()
        .any(|r| r.contains("failing test scenarios")));

    assert_eq!(controller.active_count().await, 0);
    assert_eq!(controller.archived_results("doubler").await.len(), 3);
}

#[tokio::test]
async fn test_runtime_errors_are_captured_not_propagated() {
    let executor = FnExecutor::new(|ctx: ExecContext| async move {
        ctx.env.error("cannot read property 'x' of undefined").ok();
        Err(ExecError::Runtime("TypeError".into()))
    });
    let controller = controller_with(1, executor);
    let id = controller
        .create_sandbox("broken", SandboxOptions::default())
        .await
        .unwrap();
    let verdict = controller
        .run_module_in_sandbox(&id, "undefined.x", &[])
        .await
        .unwrap();

    // One failed execution is one runtime error, console output included.
    assert_eq!(verdict.kind, VerdictKind::Completed);
    assert_eq!(verdict.score, 80.0);
    assert_eq!(verdict.readiness, Readiness::NeedsImprovement);
    assert!(verdict.issues.iter().any(|i| i.contains("TypeError")));
    assert!(!verdict.issues.iter().any(|i| i.starts_with("console error")));
    assert_eq!(
        controller.sandbox_status(&id).await.unwrap(),
        SandboxStatus::Completed
    );
}

#[tokio::test]
async fn test_resources_are_sampled_while_running() {
    let executor = FnExecutor::new(|ctx: ExecContext| async move {
        ctx.env.log("x".repeat(64)).ok();
        tokio::time::sleep(Duration::from_millis(60)).await;
        Ok(json!(null))
    });
    let controller = controller_with(1, executor);
    let id = controller
        .create_sandbox("sampled", SandboxOptions::default())
        .await
        .unwrap();
    controller
        .run_module_in_sandbox(&id, "work()", &[])
        .await
        .unwrap();

    let snapshot = controller.sandbox_snapshot(&id).await.unwrap();
    assert!(snapshot.resources.samples >= 1);
    assert!(snapshot.resources.peak_memory_bytes >= 64);
}

// -------------------------------------------------------------------------
// Capacity and cleanup
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_create_never_exceeds_capacity() {
    let controller = Arc::new(controller_with(3, doubling_executor()));
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let c = controller.clone();
            tokio::spawn(async move {
                c.create_sandbox(&format!("m{i}"), SandboxOptions::default())
                    .await
            })
        })
        .collect();

    let mut ok = 0;
    let mut exhausted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(SandboxError::ResourceExhausted { max, .. }) => {
                assert_eq!(max, 3);
                exhausted += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(exhausted, 7);
    assert_eq!(controller.active_count().await, 3);
}

#[tokio::test]
async fn test_cleanup_twice_is_noop() {
    let controller = controller_with(1, doubling_executor());
    let id = controller
        .create_sandbox("m", SandboxOptions::default())
        .await
        .unwrap();
    assert!(controller.cleanup_sandbox(&id).await);
    assert!(!controller.cleanup_sandbox(&id).await);
    assert!(matches!(
        controller.sandbox_status(&id).await,
        Err(SandboxError::NotFound(_))
    ));

    // Capacity is freed.
    controller
        .create_sandbox("m2", SandboxOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cleanup_from_initializing_state() {
    let controller = controller_with(1, doubling_executor());
    let id = controller
        .create_sandbox("never-run", SandboxOptions::default())
        .await
        .unwrap();
    assert_eq!(
        controller.sandbox_status(&id).await.unwrap(),
        SandboxStatus::Initializing
    );
    assert!(controller.cleanup_sandbox(&id).await);
    assert!(controller.archived_results("never-run").await.is_empty());
}

// -------------------------------------------------------------------------
// Subprocess executor
// -------------------------------------------------------------------------

#[cfg(unix)]
mod process {
    use super::*;
    use modgate_core::sandbox::{NetworkIsolation, ProcessExecutor};

    fn sh_controller() -> SandboxController {
        let executor = ProcessExecutor::new("/bin/sh", ["-c"])
            .with_search_path("/usr/bin:/bin")
            .with_network_isolation(NetworkIsolation::External);
        SandboxController::new(
            SandboxSettings::default(),
            ScoringConfig::default(),
            Arc::new(PatternPolicy::default()),
            Arc::new(executor),
        )
    }

    #[tokio::test]
    async fn test_process_scenarios_read_stdin() {
        let controller = sh_controller();
        let module = CandidateModule::new("sh-double", "sh", "read x || true; echo $((x * 2))")
            .with_scenario(TestScenario::new("four", json!(4), json!(8)));
        let verdict = controller
            .validate(&module, SandboxOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.kind, VerdictKind::Completed);
        assert!(verdict.test_results[0].passed);
    }

    #[tokio::test]
    async fn test_process_stack_trace_counts_as_one_error() {
        let controller = sh_controller();
        let module = CandidateModule::new(
            "sh-throw",
            "sh",
            "echo 'Error: boom' >&2; echo '    at foo (x.js:1:1)' >&2; \
             echo '    at bar (x.js:2:1)' >&2; exit 1",
        );
        let verdict = controller
            .validate(&module, SandboxOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict.score, 80.0);
        let errors: Vec<_> = verdict
            .issues
            .iter()
            .filter(|i| i.contains("error"))
            .collect();
        assert_eq!(errors, vec!["runtime error: Error: boom"]);
    }

    #[tokio::test]
    async fn test_process_killed_on_timeout() {
        let controller = sh_controller();
        let module = CandidateModule::new("sh-sleep", "sh", "sleep 5");
        let started = Instant::now();
        let verdict = controller
            .validate(
                &module,
                SandboxOptions {
                    timeout_ms: Some(200),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(verdict.kind, VerdictKind::ExecutionTimeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
