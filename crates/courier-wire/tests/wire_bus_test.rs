//! End-to-end tests: `Bus` instances talking over real TCP connections.
//!
//! A background node listens on an ephemeral port; UI and content nodes
//! connect to it. Every test runs the full caller/dispatcher path on top of
//! the wire transport.

use courier_bus::{
    BroadcastOptions, Bus, BusConfig, BusError, Envelope, ErrorCode, Peer, Role, SendOptions,
    StreamSink, TargetContext,
};
use courier_types::protocol::{Ping, PingPayload, Pong};
use courier_wire::{WireConfig, WireNode, MAX_FRAME_SIZE};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Route bus logs to the test harness; `RUST_LOG=courier_wire=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn node(node_id: &str, role: Role) -> (Arc<WireNode>, Bus) {
    init_tracing();
    let (node, _accept) = WireNode::start(WireConfig {
        node_id: node_id.to_string(),
        role: role.clone(),
        ..WireConfig::default()
    })
    .await
    .unwrap();
    let bus = Bus::new(role, node.clone(), BusConfig::default());
    (node, bus)
}

fn add_ping(bus: &Bus) {
    let role = bus.role().clone();
    bus.add_typed_handler::<Ping, _, _>(move |payload: PingPayload, _s: StreamSink| {
        let role = role.clone();
        async move { Ok(Pong { t: payload.t, role }) }
    });
}

/// Background node plus a UI node connected to it.
async fn background_and_ui() -> ((Arc<WireNode>, Bus), (Arc<WireNode>, Bus)) {
    let background = node("bg", Role::Background).await;
    let ui = node("popup", Role::Ui).await;
    ui.0.connect(background.0.local_addr()).await.unwrap();
    settle().await;
    (background, ui)
}

/// Let the accepting side finish registering new connections.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ping_over_tcp() {
    let ((_, background), (ui_node, ui)) = background_and_ui().await;
    add_ping(&background);
    background.listen();

    let pong = ui
        .send::<Ping>(PingPayload { t: 1_700_000_000 }, SendOptions::new())
        .await
        .unwrap();
    assert_eq!(
        pong,
        Pong {
            t: 1_700_000_000,
            role: Role::Background,
        }
    );
    assert_eq!(ui.pending_calls(), 0);
    assert_eq!(ui_node.outstanding_count(), 0);
}

#[tokio::test]
async fn test_handler_error_crosses_the_wire() {
    let ((_, background), (_, ui)) = background_and_ui().await;
    background.add_handler_fn("LOOKUP", |_req: Envelope, _s| async move {
        Err(anyhow::Error::new(
            BusError::not_found("no such tab").with_details(json!({"tab": 7})),
        ))
    });
    background.listen();

    let err = ui
        .send_raw("LOOKUP", json!({"tab": 7}), SendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
    assert_eq!(err.message, "no such tab");
    assert_eq!(err.details, Some(json!({"tab": 7})));

    let err = ui
        .send_raw("MISSING", Value::Null, SendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn test_stream_pieces_arrive_in_order() {
    let ((_, background), (_, ui)) = background_and_ui().await;
    background.add_handler_fn("COUNT", |req: Envelope, stream: StreamSink| async move {
        let n = req.payload().and_then(Value::as_u64).unwrap_or(0);
        for i in 1..=n {
            stream.send(json!(i));
        }
        Ok(Envelope::success(&req, json!("done")))
    });
    background.listen();

    let pieces = Arc::new(Mutex::new(Vec::new()));
    let pieces_clone = Arc::clone(&pieces);
    let result = ui
        .send_raw(
            "COUNT",
            json!(5),
            SendOptions::new()
                .on_stream(move |v| pieces_clone.lock().unwrap().push(v)),
        )
        .await
        .unwrap();

    assert_eq!(result, json!("done"));
    assert_eq!(
        *pieces.lock().unwrap(),
        vec![json!(1), json!(2), json!(3), json!(4), json!(5)]
    );
}

#[tokio::test]
async fn test_unlistened_node_times_out() {
    let ((_, _background), (ui_node, ui)) = background_and_ui().await;

    let err = ui
        .send::<Ping>(PingPayload { t: 1 }, SendOptions::new().timeout_ms(100))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);
    // The transport forgets the call once the caller stops waiting.
    assert_eq!(ui_node.outstanding_count(), 0);
}

#[tokio::test]
async fn test_lost_connection_fails_call_early() {
    let ((background_node, background), (ui_node, ui)) = background_and_ui().await;
    background.add_handler_fn("SLOW", |req: Envelope, _s| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Envelope::success(&req, Value::Null))
    });
    background.listen();

    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        background_node.disconnect("popup")
    });

    let started = Instant::now();
    let err = ui
        .send_raw("SLOW", Value::Null, SendOptions::new().timeout_ms(10_000))
        .await
        .unwrap_err();
    assert!(closer.await.unwrap());

    assert_eq!(err.code, ErrorCode::Internal);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(ui_node.outstanding_count(), 0);
    assert!(ui.peers().is_empty());
}

#[tokio::test]
async fn test_oversized_frames_fail_fast() {
    let ((_, background), (ui_node, ui)) = background_and_ui().await;
    background.add_handler_fn("BIGREPLY", |req: Envelope, _s| async move {
        let big = "x".repeat(MAX_FRAME_SIZE as usize + 1);
        Ok(Envelope::success(&req, json!(big)))
    });
    background.listen();

    let started = Instant::now();
    let big = "x".repeat(MAX_FRAME_SIZE as usize + 1);
    let err = ui
        .send_raw("BIG", json!(big), SendOptions::new().timeout_ms(5_000))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);
    assert!(err.message.contains("too large"), "{}", err.message);

    let err = ui
        .send_raw("BIGREPLY", Value::Null, SendOptions::new().timeout_ms(5_000))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(ui_node.outstanding_count(), 0);
    assert_eq!(ui.peers().len(), 1);
}

#[tokio::test]
async fn test_rejected_request_type_leaves_link_intact() {
    let ((_, background), (_, ui)) = background_and_ui().await;
    background.add_handler_fn("SLOW", |req: Envelope, _s| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Envelope::success(&req, json!("slow done")))
    });
    background.listen();

    let slow = {
        let ui = ui.clone();
        tokio::spawn(async move {
            ui.send_raw("SLOW", Value::Null, SendOptions::new()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = ui
        .send_raw("LOG:RES", json!({}), SendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);

    assert_eq!(slow.await.unwrap().unwrap(), json!("slow done"));
    assert_eq!(ui.peers().len(), 1);
}

#[tokio::test]
async fn test_no_connected_peer_is_internal() {
    let (_, lonely) = node("lonely", Role::Ui).await;
    let err = lonely
        .send::<Ping>(PingPayload { t: 1 }, SendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);
}

// ---------------------------------------------------------------------------
// Targeting and broadcast
// ---------------------------------------------------------------------------

/// Background node with one connected content node per ID.
async fn background_with_tabs(ids: &[&str]) -> (Arc<WireNode>, Bus, Vec<Bus>) {
    let (background_node, background) = node("bg", Role::Background).await;
    let mut tabs = Vec::new();
    for id in ids {
        let (tab_node, tab) = node(id, Role::Content).await;
        tab_node.connect(background_node.local_addr()).await.unwrap();
        tabs.push(tab);
    }
    settle().await;
    (background_node, background, tabs)
}

#[tokio::test]
async fn test_send_to_specific_tab() {
    let ids = ["tab-1", "tab-2"];
    let (_, background, tabs) = background_with_tabs(&ids).await;
    for (id, tab) in ids.iter().zip(&tabs) {
        let id = id.to_string();
        tab.add_handler_fn("WHO", move |req: Envelope, _s| {
            let id = id.clone();
            async move {
                let to = req.target_context.clone();
                Ok(Envelope::success(
                    &req,
                    json!({"answered_by": id, "target": to}),
                ))
            }
        });
        tab.listen();
    }

    let result = background
        .send_raw(
            "WHO",
            Value::Null,
            SendOptions::new().target(TargetContext::from("tab-2")),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"answered_by": "tab-2", "target": "tab-2"}));
}

#[tokio::test]
async fn test_broadcast_to_content_nodes() {
    let (background_node, background, tabs) =
        background_with_tabs(&["tab-1", "tab-2", "tab-3"]).await;
    // A UI node is also connected but filtered out.
    let (ui_node, _ui) = node("popup", Role::Ui).await;
    ui_node.connect(background_node.local_addr()).await.unwrap();
    settle().await;
    assert_eq!(background.peers().len(), 4);

    for (i, tab) in tabs.iter().enumerate() {
        if i == 1 {
            tab.add_handler_fn("PING", |_req: Envelope, _s| async move {
                Err(anyhow::Error::new(BusError::unavailable("page not ready")))
            });
        } else {
            add_ping(tab);
        }
        tab.listen();
    }

    let report = background
        .broadcast::<Ping>(
            PingPayload { t: 9 },
            BroadcastOptions::new()
                .filter(|p: &Peer| p.role == Role::Content)
                .timeout_ms(1_000),
        )
        .await;

    assert_eq!(report.target_count, 3);
    assert_eq!(report.fulfilled_count(), 2);
    let (peer, err) = report.rejected().next().unwrap();
    assert_eq!(peer.context, Some(TargetContext::from("tab-2")));
    assert_eq!(err.code, ErrorCode::Unavailable);
    assert!(report
        .fulfilled()
        .all(|(_, pong)| pong.t == 9 && pong.role == Role::Content));
}
