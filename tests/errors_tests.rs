use duratask::providers::Provider;
use duratask::runtime::RegistryError;
use duratask::{
    ActivityContext, ActivityRegistry, BackoffStrategy, Client, ErrorDetails, Event, OrchestrationContext,
    OrchestrationRegistry, OrchestrationStatus, RetryPolicy, Runtime, RuntimeOptions,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc as StdArc;
use std::time::Duration;

mod common;

async fn start(
    store: StdArc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
) -> StdArc<Runtime> {
    match Runtime::start_with_options(store, activities, orchestrations, options).await {
        Ok(rt) => rt,
        Err(e) => panic!("runtime failed to start: {e}"),
    }
}

fn activity_failures(hist: &[Event]) -> Vec<ErrorDetails> {
    hist.iter()
        .filter_map(|e| match e {
            Event::ActivityFailed { details, .. } => Some(details.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn partial_failure_keeps_successful_outputs() {
    let store = common::create_in_memory_store();
    let fail_calls = StdArc::new(AtomicU32::new(0));
    let calls = fail_calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Ok", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .register("Fail", move |_ctx: ActivityContext, _input: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_with_activities("Mixed", ["Ok", "Fail"], |ctx: OrchestrationContext, _input: String| async move {
            match ctx.fan_out([("Ok", "a"), ("Fail", "b"), ("Ok", "c")]).await {
                Ok(outputs) => Ok(outputs.join(",")),
                Err(partial) => {
                    let ok: Vec<String> = partial
                        .successes()
                        .into_iter()
                        .map(|(idx, out)| format!("{idx}:{out}"))
                        .collect();
                    Ok(format!("{}|failed={}", ok.join(","), partial.failures().len()))
                }
            }
        })
        .build();
    let rt = start(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration("Mixed", "").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "0:a,2:c|failed=1".to_string()
        }
    );
    assert_eq!(fail_calls.load(Ordering::SeqCst), 3);

    let hist = client.read_history(&instance).await.unwrap();
    assert_eq!(
        activity_failures(&hist),
        vec![ErrorDetails::ActivityFailure {
            activity: "Fail".into(),
            message: "boom".into(),
            attempts: 3,
        }]
    );
    rt.shutdown(None).await;
}

#[tokio::test]
async fn unhandled_partial_failure_fails_orchestration() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Ok", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .register("Fail", |_ctx: ActivityContext, _input: String| async move { Err("no disk".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Strict", |ctx: OrchestrationContext, _input: String| async move {
            ctx.fan_out([("Ok", "1"), ("Fail", "2")])
                .await
                .map(|outputs| outputs.join(","))
                .map_err(String::from)
        })
        .build();
    let rt = start(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration("Strict", "").await.unwrap();
    match client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed {
            details: ErrorDetails::Application { message },
        } => {
            assert!(message.starts_with("1 of 2 fan-out activities failed"), "{message}");
            assert!(message.contains("no disk"), "{message}");
        }
        other => panic!("unexpected status: {other:?}"),
    }
    rt.shutdown(None).await;
}

#[tokio::test]
async fn flaky_activity_succeeds_on_retry() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Flaky", |ctx: ActivityContext, _input: String| async move {
            if ctx.attempt() < 2 {
                ctx.trace_warn("transient failure");
                Err("transient".to_string())
            } else {
                Ok(format!("attempt {}", ctx.attempt()))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("RunFlaky", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Flaky", "").await.map_err(|e| e.to_string())
        })
        .build();
    let rt = start(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration("RunFlaky", "").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "attempt 2".to_string()
        }
    );
    rt.shutdown(None).await;
}

#[tokio::test]
async fn attempts_that_exceed_timeout_are_reported_as_timeouts() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Slow", |_ctx: ActivityContext, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok("late".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("RunSlow", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Slow", "").await.map_err(|e| e.to_string())
        })
        .build();
    let options = RuntimeOptions {
        activity_retry: RetryPolicy::new(2)
            .with_timeout(Duration::from_millis(20))
            .with_backoff(BackoffStrategy::None),
        ..common::fast_options()
    };
    let rt = start(store.clone(), activities, orchestrations, options).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration("RunSlow", "").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matches!(status, OrchestrationStatus::Failed { .. }), "{status:?}");

    let hist = client.read_history(&instance).await.unwrap();
    assert_eq!(
        activity_failures(&hist),
        vec![ErrorDetails::ActivityTimeout {
            activity: "Slow".into(),
            timeout_ms: 20,
            attempts: 2,
        }]
    );
    rt.shutdown(None).await;
}

#[tokio::test]
async fn unregistered_activity_is_a_configuration_failure() {
    let store = common::create_in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsMissing", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Missing", "x").await.map_err(|e| e.to_string())
        })
        .build();
    let rt = start(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        common::fast_options(),
    )
    .await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration("CallsMissing", "").await.unwrap();
    client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    let hist = client.read_history(&instance).await.unwrap();
    match activity_failures(&hist).as_slice() {
        [ErrorDetails::Configuration { message }] => assert!(message.contains("Missing")),
        other => panic!("unexpected failures: {other:?}"),
    }
    rt.shutdown(None).await;
}

#[tokio::test]
async fn unregistered_orchestration_fails_instance() {
    let store = common::create_in_memory_store();
    let rt = start(
        store.clone(),
        ActivityRegistry::builder().build(),
        OrchestrationRegistry::builder().build(),
        common::fast_options(),
    )
    .await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration("Nope", "").await.unwrap();
    match client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed {
            details: ErrorDetails::Configuration { message },
        } => assert!(message.contains("Nope")),
        other => panic!("unexpected status: {other:?}"),
    }
    rt.shutdown(None).await;
}

#[tokio::test]
async fn undeclared_activity_blocks_startup() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Present", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_with_activities(
            "NeedsMore",
            ["Present", "Absent"],
            |_ctx: OrchestrationContext, input: String| async move { Ok(input) },
        )
        .build();
    let result = Runtime::start_with_options(store, activities, orchestrations, common::fast_options()).await;
    let Err(err) = result else {
        panic!("runtime started despite a missing activity");
    };
    assert_eq!(
        err,
        RegistryError::UndeclaredActivities {
            orchestration: "NeedsMore".into(),
            missing: vec!["Absent".into()],
        }
    );
}

#[tokio::test]
async fn panics_are_contained() {
    let store = common::create_in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Explode", |_ctx: ActivityContext, _input: String| async move {
            if true {
                panic!("activity kaboom");
            }
            Ok(String::new())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("PanicOrch", |_ctx: OrchestrationContext, _input: String| async move {
            if true {
                panic!("orchestration kaboom");
            }
            Ok(String::new())
        })
        .register("CallsExplode", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Explode", "").await.map_err(|e| e.to_string())
        })
        .build();
    let rt = start(store.clone(), activities, orchestrations, common::fast_options()).await;
    let client = Client::new(store.clone());

    let orch = client.start_orchestration("PanicOrch", "").await.unwrap();
    match client.wait_for_orchestration(&orch, Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Failed {
            details: ErrorDetails::Panicked { message },
        } => assert!(message.contains("orchestration kaboom")),
        other => panic!("unexpected status: {other:?}"),
    }

    let act = client.start_orchestration("CallsExplode", "").await.unwrap();
    client.wait_for_orchestration(&act, Duration::from_secs(5)).await.unwrap();
    let hist = client.read_history(&act).await.unwrap();
    match activity_failures(&hist).as_slice() {
        [ErrorDetails::ActivityFailure { message, attempts, .. }] => {
            assert!(message.contains("activity kaboom"));
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected failures: {other:?}"),
    }
    rt.shutdown(None).await;
}
