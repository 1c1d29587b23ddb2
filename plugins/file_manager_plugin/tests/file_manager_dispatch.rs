use assistant_core::event_bus::EventRecord;
use assistant_core::intent::KeywordIntentResolver;
use assistant_core::{Orchestrator, Permission, Settings, Subject};
use calculator_plugin::CalculatorPlugin;
use file_manager_plugin::{FileManagerPlugin, SEARCHED_TOPIC};
use serde_json::json;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (Orchestrator, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("work")).unwrap();
    fs::write(dir.path().join("work/report.txt"), "q3").unwrap();
    fs::write(dir.path().join("report-draft.md"), "wip").unwrap();

    let orch = Orchestrator::builder(Settings::default()).build().await.unwrap();
    orch.load_plugin(Arc::new(FileManagerPlugin::new(dir.path())))
        .await
        .unwrap();
    (orch, dir)
}

#[tokio::test]
async fn test_search_request_lists_matches_and_announces_it() {
    let (orch, _dir) = setup().await;
    let announced = Arc::new(AtomicUsize::new(0));
    let counter = announced.clone();
    orch.events()
        .subscribe(
            SEARCHED_TOPIC,
            Arc::new(move |_e: Arc<EventRecord>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            }),
            "audit",
        )
        .unwrap();

    let response = orch.handle_request("alice", "find report").await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.plugin.as_deref(), Some("file-manager"));
    assert_eq!(response.data["files"].as_array().unwrap().len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(announced.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_user_without_file_read_is_refused() {
    let (orch, _dir) = setup().await;
    orch.handle_request("mallory", "hello").await;
    orch.gate().revoke_all(&Subject::user("mallory"));

    let response = orch.handle_request("mallory", "find report").await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().kind, "no_handler_available");
}

#[tokio::test]
async fn test_recent_searches_are_remembered() {
    let (orch, _dir) = setup().await;
    orch.handle_request("alice", "find report").await;
    orch.handle_request("alice", "find notes").await;

    orch.gate()
        .grant(Subject::plugin("auditor"), Permission::new("file_read"));
    let out = orch
        .dispatcher()
        .context_for("auditor")
        .call_plugin("file-manager", "recent_searches", json!({}))
        .await
        .unwrap();
    assert_eq!(out.data[0]["pattern"], "notes");
    assert_eq!(out.data[1]["pattern"], "report");
}

#[tokio::test]
async fn test_recent_searches_reachable_from_text() {
    let (orch, _dir) = setup().await;
    orch.handle_request("alice", "find report").await;

    let response = orch.handle_request("alice", "show my recent searches").await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.intent.as_deref(), Some("file_history"));
    assert_eq!(response.plugin.as_deref(), Some("file-manager"));
    assert_eq!(response.data[0]["pattern"], "report");
}

#[tokio::test]
async fn test_every_default_intent_has_a_handler() {
    let (orch, _dir) = setup().await;
    orch.load_plugin(Arc::new(CalculatorPlugin::new())).await.unwrap();

    let resolver = KeywordIntentResolver::default();
    for intent in resolver.intents() {
        assert!(
            !orch.registry().handlers_for(intent).is_empty(),
            "no handler for `{intent}`"
        );
    }

    let response = orch.handle_request("alice", "show system info").await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.plugin.as_deref(), Some("system"));
}
