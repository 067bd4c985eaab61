use duratask::blob_store::{BlobStore, BlobStoreConfig, FsBlobStore};
use duratask::range_files::DURABLE_EXAMPLE;
use duratask::{Client, ErrorDetails, Event, OrchestrationStatus};
use std::sync::Arc as StdArc;
use std::time::Duration;

mod common;

fn blob_names(output: &str) -> Vec<String> {
    serde_json::from_str(output).unwrap()
}

#[tokio::test]
async fn single_range_in_memory() {
    let store = common::create_in_memory_store();
    let blobs = common::in_memory_blobs();
    let rt = common::start_range_runtime(store.clone(), blobs.clone()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration(DURABLE_EXAMPLE, "1-3").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("unexpected status: {status:?}");
    };
    assert_eq!(blob_names(&output), vec!["1-3.txt"]);
    assert_eq!(blobs.get("1-3.txt").await.unwrap(), b"1\n2\n3\n");

    let hist = client.read_history(&instance).await.unwrap();
    assert!(matches!(hist.first(), Some(Event::OrchestrationStarted { name, input, .. }) if name == DURABLE_EXAMPLE && input == "1-3"));
    assert!(matches!(hist.last(), Some(Event::OrchestrationCompleted { .. })));
    rt.shutdown(None).await;
}

#[tokio::test]
async fn multiple_ranges_sqlite_keep_input_order() {
    let (store, _td) = common::create_sqlite_store_disk().await;
    let blobs = common::in_memory_blobs();
    let rt = common::start_range_runtime(store.clone(), blobs.clone()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration(DURABLE_EXAMPLE, "1-2,5-5").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: r#"["1-2.txt","5-5.txt"]"#.to_string()
        }
    );

    let hist = client.read_history(&instance).await.unwrap();
    assert_eq!(
        common::scheduled_activities(&hist),
        vec![
            (1, "GenerateFile".to_string(), "1-2".to_string()),
            (2, "GenerateFile".to_string(), "5-5".to_string()),
        ]
    );
    let completions = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions, 2);
    assert_eq!(blobs.get("5-5.txt").await.unwrap(), b"5\n");
    rt.shutdown(None).await;
}

#[tokio::test]
async fn empty_input_uses_default_range() {
    let store = common::create_in_memory_store();
    let blobs = common::in_memory_blobs();
    let rt = common::start_range_runtime(store.clone(), blobs.clone()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration(DURABLE_EXAMPLE, "").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("unexpected status: {status:?}");
    };
    assert_eq!(blob_names(&output), vec!["1-10.txt"]);
    let text = String::from_utf8(blobs.get("1-10.txt").await.unwrap()).unwrap();
    assert_eq!(text.lines().count(), 10);
    assert!(text.ends_with("10\n"));
    rt.shutdown(None).await;
}

#[tokio::test]
async fn invalid_input_fails_without_scheduling() {
    let store = common::create_in_memory_store();
    let rt = common::start_range_runtime(store.clone(), common::in_memory_blobs()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration(DURABLE_EXAMPLE, "1-3,9-4").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Failed {
            details: ErrorDetails::Application { message },
        } => assert!(message.contains("9-4"), "{message}"),
        other => panic!("unexpected status: {other:?}"),
    }
    let hist = client.read_history(&instance).await.unwrap();
    assert!(common::scheduled_activities(&hist).is_empty());
    rt.shutdown(None).await;
}

#[tokio::test]
async fn files_land_in_blob_container_directory() {
    let (store, _db_dir) = common::create_sqlite_store_disk().await;
    let blob_dir = tempfile::tempdir().unwrap();
    let config = BlobStoreConfig {
        root: blob_dir.path().to_path_buf(),
        container: "durable".into(),
    };
    let blobs: StdArc<dyn BlobStore> = StdArc::new(FsBlobStore::new(&config));
    let rt = common::start_range_runtime(store.clone(), blobs.clone()).await;
    let client = Client::new(store.clone());

    let instance = client.start_orchestration(DURABLE_EXAMPLE, "1-10,1-100,-2-2").await.unwrap();
    let status = client
        .wait_for_orchestration(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("unexpected status: {status:?}");
    };
    assert_eq!(blob_names(&output), vec!["1-10.txt", "1-100.txt", "-2-2.txt"]);

    let container = blob_dir.path().join("durable");
    let hundred = std::fs::read_to_string(container.join("1-100.txt")).unwrap();
    assert_eq!(hundred.lines().count(), 100);
    assert_eq!(
        std::fs::read_to_string(container.join("-2-2.txt")).unwrap(),
        "-2\n-1\n0\n1\n2\n"
    );
    let mut listed = blobs.list().await.unwrap();
    listed.sort();
    assert_eq!(listed, vec!["-2-2.txt", "1-10.txt", "1-100.txt"]);
    rt.shutdown(None).await;
}

#[tokio::test]
async fn concurrent_instances_complete_independently() {
    let store = common::create_in_memory_store();
    let blobs = common::in_memory_blobs();
    let rt = common::start_range_runtime(store.clone(), blobs.clone()).await;
    let client = Client::new(store.clone());

    let mut instances = Vec::new();
    for i in 1..=5 {
        let input = format!("{i}-{}", i * 10);
        instances.push((client.start_orchestration(DURABLE_EXAMPLE, input).await.unwrap(), i));
    }
    for (instance, i) in instances {
        let status = client
            .wait_for_orchestration(&instance, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            status,
            OrchestrationStatus::Completed {
                output: format!(r#"["{i}-{}.txt"]"#, i * 10)
            }
        );
    }
    assert_eq!(client.list_instances().await.unwrap().len(), 5);
    rt.shutdown(None).await;
}
