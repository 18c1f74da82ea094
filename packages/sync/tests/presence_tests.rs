//! Peer presence: identity announcements, palette assignment, cursor
//! throttling, lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use easel_editor::HistoryOptions;
use easel_model::Point;
use easel_sync::{
    Coordinator, DocumentBundle, MemoryClient, PeerMessage, PresenceOptions, RecordingTransport,
    SyncOptions, PRESENCE_PALETTE,
};

fn setup(cursor_min_interval: Duration) -> (Coordinator, RecordingTransport) {
    let client = MemoryClient::new();
    let mut bundle = DocumentBundle::default();
    bundle.document.id = "doc-1".to_string();
    client.seed(bundle);

    let transport = RecordingTransport::new();
    let coordinator = Coordinator::new(
        "doc-1",
        Arc::new(client.clone()),
        Arc::new(client),
        Arc::new(transport.clone()),
        "ada",
        SyncOptions {
            history: HistoryOptions::default(),
            presence: PresenceOptions {
                cursor_min_interval,
            },
        },
    )
    .unwrap();
    (coordinator, transport)
}

async fn init(coordinator: &mut Coordinator) {
    coordinator.init(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_open_announces_local_identity() {
    let (mut coordinator, transport) = setup(Duration::ZERO);
    init(&mut coordinator).await;

    coordinator.peer_opened("peer-1");

    let sent = transport.sent();
    assert_eq!(
        sent,
        vec![(
            "peer-1".to_string(),
            PeerMessage::Hello {
                name: "ada".to_string()
            }
        )]
    );
}

#[tokio::test]
async fn test_hello_creates_collaborator_with_unused_color() {
    let (mut coordinator, _transport) = setup(Duration::ZERO);
    init(&mut coordinator).await;

    coordinator.peer_opened("peer-1");
    coordinator
        .peer_message(
            "peer-1",
            PeerMessage::Hello {
                name: "grace".to_string(),
            },
        )
        .unwrap();
    coordinator.peer_opened("peer-2");
    coordinator
        .peer_message(
            "peer-2",
            PeerMessage::Hello {
                name: "alan".to_string(),
            },
        )
        .unwrap();

    let collaborators = &coordinator.state().document.collaborators;
    assert_eq!(collaborators.len(), 2);
    let first = &collaborators["peer-1"];
    let second = &collaborators["peer-2"];
    assert_eq!(first.name, "grace");
    assert_eq!(first.color, PRESENCE_PALETTE[0]);
    assert_eq!(second.color, PRESENCE_PALETTE[1], "colors in use are skipped");
}

#[tokio::test]
async fn test_repeated_hello_keeps_color() {
    let (mut coordinator, _transport) = setup(Duration::ZERO);
    init(&mut coordinator).await;

    coordinator.peer_opened("peer-1");
    coordinator
        .peer_message(
            "peer-1",
            PeerMessage::Hello {
                name: "grace".to_string(),
            },
        )
        .unwrap();
    coordinator
        .peer_message(
            "peer-1",
            PeerMessage::Hello {
                name: "grace hopper".to_string(),
            },
        )
        .unwrap();

    let collaborator = &coordinator.state().document.collaborators["peer-1"];
    assert_eq!(collaborator.name, "grace hopper");
    assert_eq!(collaborator.color, PRESENCE_PALETTE[0]);
}

#[tokio::test]
async fn test_cursor_moves_collaborator() {
    let (mut coordinator, _transport) = setup(Duration::ZERO);
    init(&mut coordinator).await;

    coordinator.peer_opened("peer-1");
    coordinator
        .peer_message(
            "peer-1",
            PeerMessage::Hello {
                name: "grace".to_string(),
            },
        )
        .unwrap();
    coordinator
        .peer_message("peer-1", PeerMessage::Cursor { x: 12.0, y: 34.0 })
        .unwrap();

    let collaborator = &coordinator.state().document.collaborators["peer-1"];
    assert_eq!(collaborator.cursor, Point::new(12.0, 34.0));
}

#[tokio::test]
async fn test_cursor_for_unknown_collaborator_is_ignored() {
    let (mut coordinator, _transport) = setup(Duration::ZERO);
    init(&mut coordinator).await;

    coordinator
        .peer_message("ghost", PeerMessage::Cursor { x: 1.0, y: 2.0 })
        .unwrap();

    assert!(coordinator.state().document.collaborators.is_empty());
}

#[tokio::test]
async fn test_close_deletes_collaborator() {
    let (mut coordinator, _transport) = setup(Duration::ZERO);
    init(&mut coordinator).await;

    coordinator.peer_opened("peer-1");
    coordinator
        .peer_message(
            "peer-1",
            PeerMessage::Hello {
                name: "grace".to_string(),
            },
        )
        .unwrap();
    assert_eq!(coordinator.state().document.collaborators.len(), 1);

    coordinator.peer_closed("peer-1").unwrap();
    assert!(coordinator.state().document.collaborators.is_empty());
}

#[tokio::test]
async fn test_cursor_broadcast_is_throttled() {
    let (mut coordinator, transport) = setup(Duration::from_millis(400));
    init(&mut coordinator).await;
    coordinator.peer_opened("peer-1");
    let announced = transport.sent().len();

    coordinator.cursor_moved(Point::new(1.0, 1.0));
    coordinator.cursor_moved(Point::new(2.0, 2.0));
    coordinator.cursor_moved(Point::new(3.0, 3.0));
    assert_eq!(
        transport.sent().len() - announced,
        1,
        "rapid updates collapse to one send"
    );

    std::thread::sleep(Duration::from_secs(1));
    coordinator.cursor_moved(Point::new(4.0, 4.0));
    assert_eq!(transport.sent().len() - announced, 2);
}

#[tokio::test]
async fn test_presence_stays_outside_persistence_and_undo() {
    let (mut coordinator, _transport) = setup(Duration::ZERO);
    init(&mut coordinator).await;

    coordinator.peer_opened("peer-1");
    coordinator
        .peer_message(
            "peer-1",
            PeerMessage::Hello {
                name: "grace".to_string(),
            },
        )
        .unwrap();
    coordinator
        .peer_message("peer-1", PeerMessage::Cursor { x: 5.0, y: 5.0 })
        .unwrap();

    assert_eq!(coordinator.pending_batches(), 0);
    assert!(!coordinator.history_status().can_undo);
    assert_eq!(coordinator.state().document.pending_pushes, 0);
}

#[test]
fn test_peer_message_wire_shape() {
    let hello = PeerMessage::Hello {
        name: "ada".to_string(),
    };
    assert_eq!(
        serde_json::to_value(&hello).unwrap(),
        serde_json::json!({"type": "hello", "name": "ada"})
    );

    let cursor: PeerMessage =
        serde_json::from_value(serde_json::json!({"type": "cursor", "x": 1.5, "y": 2.5})).unwrap();
    assert_eq!(cursor, PeerMessage::Cursor { x: 1.5, y: 2.5 });
}
