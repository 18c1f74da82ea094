//! End-to-end coordinator behavior: init, forwarding, ordered pushes,
//! remote replay, uploads, refresh, cancellation.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use easel_editor::{Command, Dispatch, DispatchOptions, HistoryOptions, Views};
use easel_model::{Bounds, CanvasState, Element, ElementKind, MediaSource, Patch, Selection};
use easel_sync::{
    Coordinator, DocumentBundle, MemoryClient, PresenceOptions, RecordingTransport, SyncOptions,
};
use serde_json::json;

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn element(id: &str) -> Element {
    Element::new(id, ElementKind::Box, Bounds::new(0.0, 0.0, 10.0, 10.0))
}

fn options() -> SyncOptions {
    SyncOptions {
        // Zero window keeps every edit its own undo entry in tests.
        history: HistoryOptions {
            max_depth: 100,
            batch_window: Duration::ZERO,
        },
        presence: PresenceOptions::default(),
    }
}

fn setup() -> (Coordinator, MemoryClient) {
    let client = MemoryClient::new();
    let mut bundle = DocumentBundle::default();
    bundle.document.id = "doc-1".to_string();
    bundle.document.title = "Untitled".to_string();
    client.seed(bundle);

    let coordinator = Coordinator::new(
        "doc-1",
        Arc::new(client.clone()),
        Arc::new(client.clone()),
        Arc::new(RecordingTransport::new()),
        "local-user",
        options(),
    )
    .unwrap();
    (coordinator, client)
}

async fn init(coordinator: &mut Coordinator) {
    coordinator.init(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_init_builds_snapshot_from_server() {
    let client = MemoryClient::new();
    let mut bundle = DocumentBundle::default();
    bundle.document.id = "doc-1".to_string();
    bundle.document.title = "Launch plan".to_string();
    bundle.elements.push(element("e1"));
    client.seed(bundle);

    let mut coordinator = Coordinator::new(
        "doc-1",
        Arc::new(client.clone()),
        Arc::new(client),
        Arc::new(RecordingTransport::new()),
        "local-user",
        options(),
    )
    .unwrap();
    init(&mut coordinator).await;

    assert_eq!(coordinator.state().document.data.title, "Launch plan");
    assert!(coordinator.state().element("e1").is_some());
    assert_eq!(coordinator.repository_state().elements.len(), 1);
}

#[tokio::test]
async fn test_aborted_init_is_a_clean_noop() {
    let (mut coordinator, _client) = setup();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = coordinator.init(&cancel).await.unwrap_err();
    assert!(matches!(err, easel_sync::SyncError::Aborted));
    assert_eq!(coordinator.state(), &CanvasState::default());
}

#[tokio::test]
async fn test_local_edit_flows_to_server_in_wire_shape() {
    init_logs();
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;

    coordinator.elements().create(element("e1")).unwrap().unwrap();

    // Optimistic: the mirror has it before any push.
    assert!(coordinator.repository_state().elements.contains_key("e1"));
    assert_eq!(coordinator.state().document.pending_pushes, 1);
    assert_eq!(coordinator.pending_batches(), 1);

    coordinator.flush().await.unwrap();
    assert_eq!(coordinator.state().document.pending_pushes, 0);

    let batches = client.pushed_batches();
    assert_eq!(batches.len(), 1);
    let wire = serde_json::to_value(&batches[0][0]).unwrap();
    assert_eq!(wire["op"], "add");
    assert_eq!(wire["path"][0], "elements");
    assert_eq!(wire["path"][1], "e1");
    // The wire value is the flat DTO, not the view-model wrapper.
    assert!(wire["value"].get("data").is_none());
    assert_eq!(wire["value"]["id"], "e1");
}

#[tokio::test]
async fn test_transient_changes_are_not_pushed() {
    let (mut coordinator, _client) = setup();
    init(&mut coordinator).await;

    coordinator.elements().create(element("e1")).unwrap();
    coordinator.flush().await.unwrap();

    coordinator
        .dispatch(
            vec![
                Command::BeginDrag {
                    id: "e1".to_string(),
                    at: easel_model::Point::new(1.0, 1.0),
                },
                Command::SetSelection(Selection {
                    elements: vec!["e1".to_string()],
                    connectors: vec![],
                    group: None,
                }),
            ],
            DispatchOptions::user(),
        )
        .unwrap();

    assert_eq!(coordinator.pending_batches(), 0);
    assert_eq!(coordinator.state().document.pending_pushes, 0);
}

#[tokio::test]
async fn test_mirrored_patch_does_not_loop_back() {
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;

    let element_changes = Rc::new(RefCell::new(0u32));
    let sink = element_changes.clone();
    coordinator.subscribe(move |_, change| {
        if change
            .forward
            .iter()
            .any(|p| p.path.first().and_then(|s| s.as_str()) == Some("elements"))
        {
            *sink.borrow_mut() += 1;
        }
    });

    coordinator.elements().create(element("e1")).unwrap();
    coordinator.flush().await.unwrap();
    coordinator.flush().await.unwrap();

    // The element patch hit the store exactly once and the server exactly
    // once; mirroring did not re-dispatch it.
    assert_eq!(*element_changes.borrow(), 1);
    assert_eq!(client.pushed_batches().len(), 1);
}

#[tokio::test]
async fn test_failed_push_keeps_state_and_order() {
    init_logs();
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;

    let failures = Rc::new(RefCell::new(0u32));
    let sink = failures.clone();
    coordinator.on_push_failed(move |_| *sink.borrow_mut() += 1);

    coordinator.elements().create(element("e1")).unwrap();
    coordinator.elements().create(element("e2")).unwrap();
    assert_eq!(coordinator.pending_batches(), 2);

    client.fail_next_push();
    coordinator.flush().await.unwrap();

    // Non-blocking notification, optimistic state retained, batch requeued.
    assert_eq!(*failures.borrow(), 1);
    assert!(coordinator.repository_state().elements.contains_key("e1"));
    assert_eq!(coordinator.pending_batches(), 2);
    assert_eq!(coordinator.state().document.pending_pushes, 2);
    assert!(client.pushed_batches().is_empty());

    // The next flush drains the accumulated queue in commit order.
    coordinator.flush().await.unwrap();
    let batches = client.pushed_batches();
    assert_eq!(batches.len(), 2);
    let first = serde_json::to_value(&batches[0][0]).unwrap();
    let second = serde_json::to_value(&batches[1][0]).unwrap();
    assert_eq!(first["path"][1], "e1");
    assert_eq!(second["path"][1], "e2");
    assert_eq!(coordinator.state().document.pending_pushes, 0);
}

#[tokio::test]
async fn test_remote_patch_replays_without_echo() {
    let (mut coordinator, _client) = setup();
    init(&mut coordinator).await;

    let wire = Patch::add(
        vec!["elements".into(), "e9".into()],
        serde_json::to_value(element("e9")).unwrap(),
    );
    coordinator.apply_remote(&[wire]).unwrap();

    assert!(coordinator.state().element("e9").is_some());
    assert!(coordinator.repository_state().elements.contains_key("e9"));
    // Remote changes are neither undoable nor pushed back.
    assert!(!coordinator.history_status().can_undo);
    assert_eq!(coordinator.pending_batches(), 0);
}

#[tokio::test]
async fn test_malformed_remote_patch_is_dropped_not_fatal() {
    init_logs();
    let (mut coordinator, _client) = setup();
    init(&mut coordinator).await;

    let bad_kind = Patch::add(vec!["widgets".into(), "w1".into()], json!({}));
    let bad_value = Patch::add(vec!["elements".into(), "e8".into()], json!("not an object"));
    let good = Patch::add(
        vec!["elements".into(), "e9".into()],
        serde_json::to_value(element("e9")).unwrap(),
    );

    coordinator
        .apply_remote(&[bad_kind, bad_value, good])
        .unwrap();

    assert!(coordinator.state().element("e9").is_some());
    assert!(coordinator.state().element("e8").is_none());
}

#[tokio::test]
async fn test_remote_field_edit_replays_into_store_path() {
    let (mut coordinator, _client) = setup();
    init(&mut coordinator).await;

    coordinator.elements().create(element("e1")).unwrap();
    coordinator.flush().await.unwrap();

    let wire = Patch::replace(
        vec!["elements".into(), "e1".into(), "bounds".into(), "x".into()],
        json!(42.0),
    );
    coordinator.apply_remote(&[wire]).unwrap();

    assert_eq!(coordinator.state().element("e1").unwrap().bounds.x, 42.0);
    assert_eq!(
        coordinator.repository_state().elements["e1"].bounds.x,
        42.0
    );
}

#[tokio::test]
async fn test_undo_is_persisted_like_an_edit() {
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;

    coordinator.elements().create(element("e1")).unwrap();
    coordinator.flush().await.unwrap();
    assert!(coordinator.history_status().can_undo);

    coordinator.undo().unwrap().unwrap();
    assert!(coordinator.state().element("e1").is_none());
    assert!(
        !coordinator.repository_state().elements.contains_key("e1"),
        "the undone create is committed to the mirror"
    );

    coordinator.flush().await.unwrap();
    let batches = client.pushed_batches();
    assert_eq!(batches.len(), 2);
    let wire = serde_json::to_value(&batches[1][0]).unwrap();
    assert_eq!(wire["op"], "remove");
    assert_eq!(wire["path"][1], "e1");
}

#[tokio::test]
async fn test_whole_snapshot_swap_diffs_per_resource() {
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;

    let mut snapshot = coordinator.state().clone();
    snapshot
        .elements
        .insert("e1".to_string(), element("e1").into());
    snapshot.document.data.title = "Imported".to_string();

    coordinator
        .dispatch(
            vec![Command::ReplaceState(Box::new(snapshot))],
            DispatchOptions::user(),
        )
        .unwrap();

    assert!(coordinator.repository_state().elements.contains_key("e1"));
    assert_eq!(coordinator.repository_state().document.title, "Imported");

    coordinator.flush().await.unwrap();
    let batches = client.pushed_batches();
    assert_eq!(batches.len(), 1);
    let paths: Vec<String> = batches[0]
        .iter()
        .map(|p| serde_json::to_value(p).unwrap()["path"][0]
            .as_str()
            .unwrap()
            .to_string())
        .collect();
    assert!(paths.contains(&"elements".to_string()));
    assert!(paths.contains(&"document".to_string()));
}

#[tokio::test]
async fn test_local_media_blob_is_uploaded_and_patched() {
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;

    let mut media = element("img-1");
    media.kind = ElementKind::Image;
    media.source = Some(MediaSource::Local {
        asset_key: "blob-7".to_string(),
    });
    coordinator.elements().create(media).unwrap();
    assert_eq!(coordinator.pending_uploads(), 1);

    coordinator.process_uploads().await.unwrap();
    assert_eq!(client.uploaded_keys(), vec!["blob-7".to_string()]);

    let source = coordinator
        .state()
        .element("img-1")
        .unwrap()
        .source
        .clone()
        .unwrap();
    assert_eq!(
        source,
        MediaSource::Remote {
            url: "https://assets.easel.dev/blob-7".to_string()
        }
    );
    assert_eq!(
        coordinator.repository_state().elements["img-1"].source,
        Some(MediaSource::Remote {
            url: "https://assets.easel.dev/blob-7".to_string()
        })
    );
}

#[tokio::test]
async fn test_failed_upload_removes_the_element() {
    init_logs();
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;
    client.fail_uploads();

    let mut media = element("img-1");
    media.kind = ElementKind::Image;
    media.source = Some(MediaSource::Local {
        asset_key: "blob-7".to_string(),
    });
    coordinator.elements().create(media).unwrap();

    coordinator.process_uploads().await.unwrap();

    assert!(coordinator.state().element("img-1").is_none());
    assert!(!coordinator
        .repository_state()
        .elements
        .contains_key("img-1"));
}

#[tokio::test]
async fn test_refresh_reconciles_and_prunes_selection() {
    let (mut coordinator, client) = setup();
    init(&mut coordinator).await;

    coordinator.elements().create(element("stale")).unwrap();
    coordinator
        .document()
        .select(Selection {
            elements: vec!["stale".to_string()],
            connectors: vec![],
            group: None,
        })
        .unwrap();

    // The server has moved on: a different element, a new title.
    let mut bundle = DocumentBundle::default();
    bundle.document.id = "doc-1".to_string();
    bundle.document.title = "Fresh".to_string();
    bundle.elements.push(element("fresh"));
    client.seed(bundle);

    let pushes_before = client.pushed_batches().len();
    coordinator.refresh(&CancellationToken::new()).await.unwrap();

    assert_eq!(coordinator.state().document.data.title, "Fresh");
    assert!(coordinator.state().element("fresh").is_some());
    assert!(coordinator.state().element("stale").is_none());
    assert!(coordinator.state().document.selection.elements.is_empty());
    assert!(coordinator.state().check_references().is_ok());

    // Reconciliation is server-authoritative: nothing new to push.
    coordinator.flush().await.unwrap();
    assert!(client.pushed_batches().len() >= pushes_before);
    for batch in client.pushed_batches().iter().skip(pushes_before) {
        let v = serde_json::to_value(&batch[0]).unwrap();
        assert_ne!(v["path"][1], "fresh", "refresh result must not be pushed");
    }
}

#[test]
fn test_refresh_gate_pauses_background_refresh() {
    let (coordinator, _client) = setup();
    let gate = coordinator.refresh_gate();

    assert!(gate.background_allowed());
    {
        let _manual = gate.manual();
        assert!(!gate.background_allowed());
    }
    assert!(gate.background_allowed());
}

#[tokio::test]
async fn test_mode_switch_resets_both_histories() {
    let (mut coordinator, _client) = setup();
    init(&mut coordinator).await;

    coordinator.elements().create(element("e1")).unwrap();
    assert!(coordinator.history_status().can_undo);

    coordinator.set_mode(easel_model::EditMode::Flow).unwrap();
    assert!(!coordinator.history_status().can_undo);
    assert!(!coordinator.history_status().can_redo);

    coordinator.set_mode(easel_model::EditMode::Design).unwrap();
    assert!(!coordinator.history_status().can_undo);
}
