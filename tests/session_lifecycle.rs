//! Connection lifecycle through the session manager: credential prompts,
//! single in-flight connects, failure and closure handling, reconnects and
//! teardown.

mod common;

use common::{eventually, open_target, password_target, wait_for_state, Harness};
use shellmux::controller::{ConnectOutcome, ControllerError};
use shellmux::session::{SessionEvent, SessionState};
use shellmux::target::{Credentials, TargetId, TargetStore};
use shellmux::transport::DeliveryMode;
use std::time::Duration;

#[tokio::test]
async fn missing_credentials_pause_then_connect() {
    let h = Harness::new(DeliveryMode::Push, vec![password_target("web")]);
    let id = h.manager.open(&TargetId::new("web"), None).unwrap();

    assert_eq!(h.manager.on_session_created(id), ConnectOutcome::AwaitingCredentials);
    assert_eq!(h.registry().state(id), Some(SessionState::AwaitingCredentials));
    assert!(h.output(id).contains("Credentials required"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.transport.connect_count(), 0, "no transport call before credentials");

    h.transport.hold_connects();
    let outcome = h
        .manager
        .supply_credentials(id, Credentials::password("x"), false)
        .unwrap();
    assert_eq!(outcome, ConnectOutcome::Started);
    assert_eq!(h.registry().state(id), Some(SessionState::Connecting));

    h.transport.release_connects();
    wait_for_state(h.registry(), id, SessionState::Connected).await;
    assert!(h.output(id).contains("Connected to root@web.example:22"));
    assert_eq!(h.transport.connects_for(id), 1);
}

#[tokio::test]
async fn supplied_credentials_are_not_remembered_unless_asked() {
    let h = Harness::new(
        DeliveryMode::Push,
        vec![password_target("a"), password_target("b")],
    );

    let a = h.start("a", None);
    h.manager
        .supply_credentials(a, Credentials::password("pw-a"), false)
        .unwrap();
    wait_for_state(h.registry(), a, SessionState::Connected).await;
    assert!(!h.book.get(&TargetId::new("a")).unwrap().has_credentials());

    let b = h.start("b", None);
    h.manager
        .supply_credentials(b, Credentials::password("pw-b"), true)
        .unwrap();
    wait_for_state(h.registry(), b, SessionState::Connected).await;
    let stored = h.book.get(&TargetId::new("b")).unwrap();
    assert_eq!(stored.credentials.password.as_deref(), Some("pw-b"));
}

#[tokio::test]
async fn insufficient_credentials_fail_the_attempt() {
    let h = Harness::new(DeliveryMode::Push, vec![password_target("web")]);
    let id = h.start("web", None);

    let outcome = h
        .manager
        .supply_credentials(id, Credentials::default(), false)
        .unwrap();
    assert_eq!(outcome, ConnectOutcome::Failed);
    assert_eq!(h.registry().state(id), Some(SessionState::Disconnected));
    assert!(h.output(id).contains("Connection failed"));
    assert_eq!(h.transport.connect_count(), 0);

    let err = h
        .manager
        .supply_credentials(id, Credentials::password("late"), false)
        .unwrap_err();
    assert!(matches!(err, ControllerError::NotAwaitingCredentials(_)));
}

#[tokio::test]
async fn credentials_for_a_closed_session_are_ignored() {
    let h = Harness::new(DeliveryMode::Push, vec![password_target("web")]);
    let id = h.start("web", None);
    assert!(h.manager.on_view_closed(id).await);

    let outcome = h
        .manager
        .supply_credentials(id, Credentials::password("x"), true)
        .unwrap();
    assert_eq!(outcome, ConnectOutcome::Stale);
    assert_eq!(h.transport.connect_count(), 0);
    assert!(!h.book.get(&TargetId::new("web")).unwrap().has_credentials());
}

#[tokio::test]
async fn cancelled_prompt_leaves_session_disconnected() {
    let h = Harness::new(DeliveryMode::Push, vec![password_target("web")]);
    let id = h.start("web", None);

    assert!(h.manager.cancel_credentials(id));
    assert!(!h.manager.cancel_credentials(id));
    assert_eq!(h.registry().state(id), Some(SessionState::Disconnected));
    assert!(h.output(id).contains("cancelled"));
    assert_eq!(h.transport.connect_count(), 0);
}

#[tokio::test]
async fn second_connect_while_connecting_is_noop() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    h.transport.hold_connects();
    let id = h.start("web", None);
    assert_eq!(h.registry().state(id), Some(SessionState::Connecting));

    assert_eq!(h.manager.connect(id), ConnectOutcome::AlreadyActive);
    assert_eq!(h.manager.on_session_created(id), ConnectOutcome::AlreadyActive);

    h.transport.release_connects();
    wait_for_state(h.registry(), id, SessionState::Connected).await;
    assert_eq!(h.manager.connect(id), ConnectOutcome::AlreadyActive);
    assert_eq!(h.transport.connects_for(id), 1);
}

#[tokio::test]
async fn connect_failure_shows_notice_and_stays_disconnected() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    h.transport.fail_host("web.example");
    let mut events = h.registry().subscribe_events();

    let id = h.start("web", None);
    wait_for_state(h.registry(), id, SessionState::Disconnected).await;

    let output = h.output(id);
    assert!(output.contains("\x1b[31mConnection failed"));
    assert!(output.contains("connection refused"));
    let session = h.registry().get(id).unwrap();
    assert!(session.last_error.as_deref().unwrap().contains("connection refused"));
    assert!(!h.manager.bridge().is_subscribed(id));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged { to, .. } = event {
            seen.push(to);
        }
    }
    assert_eq!(
        seen,
        [
            SessionState::Connecting,
            SessionState::Failed,
            SessionState::Disconnected
        ]
    );

    // No automatic retry.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.connects_for(id), 1);
}

#[tokio::test]
async fn initial_payload_runs_once_after_settle() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    let id = h.connected("web", Some("uptime")).await;

    assert_eq!(h.transport.sent(id), "", "payload waits for the settle delay");
    eventually("payload to be sent", || h.transport.sent(id) == "uptime\n").await;
    assert_eq!(h.registry().get(id).unwrap().initial_payload, None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.sent(id), "uptime\n");
}

#[tokio::test]
async fn payload_is_not_replayed_on_reconnect() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    let id = h.connected("web", Some("echo hi\n")).await;
    eventually("payload to be sent", || h.transport.sent(id) == "echo hi\n").await;

    h.transport.close(id).await;
    wait_for_state(h.registry(), id, SessionState::Disconnected).await;

    assert_eq!(h.manager.connect(id), ConnectOutcome::Started);
    wait_for_state(h.registry(), id, SessionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.transport.sent(id), "echo hi\n");
    assert_eq!(h.transport.connects_for(id), 2);
}

#[tokio::test]
async fn payload_survives_disconnect_before_settle() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    let id = h.connected("web", Some("df -h")).await;
    assert!(h.manager.disconnect(id).await);
    assert_eq!(h.registry().state(id), Some(SessionState::Disconnected));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.sent(id), "");

    h.manager.connect(id);
    wait_for_state(h.registry(), id, SessionState::Connected).await;
    eventually("payload after reconnect", || h.transport.sent(id) == "df -h\n").await;
}

#[tokio::test]
async fn remote_close_disconnects_with_notice() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    let id = h.connected("web", None).await;

    h.transport.close(id).await;
    wait_for_state(h.registry(), id, SessionState::Disconnected).await;
    eventually("closed notice", || h.output(id).contains("\x1b[31mConnection closed")).await;
    eventually("subscription released", || !h.manager.bridge().is_subscribed(id)).await;
}

#[tokio::test]
async fn stream_error_disconnects_with_notice() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    let id = h.connected("web", None).await;

    h.transport.fail_stream(id, "channel reset").await;
    wait_for_state(h.registry(), id, SessionState::Disconnected).await;
    eventually("error notice", || h.output(id).contains("Error: channel reset")).await;
}

#[tokio::test]
async fn known_size_is_pushed_on_connect() {
    let h = Harness::with_surfaces(
        DeliveryMode::Push,
        vec![open_target("web")],
        shellmux::surface::BufferSurfaces::with_size(132, 43),
    );
    let id = h.connected("web", None).await;
    eventually("size pushed", || !h.transport.resizes(id).is_empty()).await;
    assert_eq!(h.transport.resizes(id), [(132, 43)]);
}

#[tokio::test]
async fn closing_a_connecting_session_leaves_no_trace() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    h.transport.hold_connects();
    let id = h.start("web", None);
    let surface = h.surfaces.get(id).unwrap();
    eventually("connect call", || h.transport.connects_for(id) == 1).await;

    assert!(h.manager.on_view_closed(id).await);
    let writes = surface.write_count();
    assert!(surface.is_disposed());
    assert!(h.registry().get(id).is_none());

    h.transport.release_connects();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.registry().get(id).is_none());
    assert!(h.registry().is_empty());
    assert_eq!(surface.write_count(), writes, "no writes after close");
    assert!(!h.manager.bridge().is_subscribed(id));
    assert!(h.transport.disconnects(id) >= 1);
}

#[tokio::test]
async fn close_is_idempotent() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("web")]);
    let id = h.connected("web", None).await;

    assert!(h.manager.on_view_closed(id).await);
    assert!(!h.manager.on_view_closed(id).await);
    assert_eq!(h.transport.disconnects(id), 1);
    assert!(!h.manager.input().is_attached(id));
    assert_eq!(h.manager.connect(id), ConnectOutcome::Stale);
}

#[tokio::test]
async fn focus_follows_creation_and_removal() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("a"), open_target("b")]);
    let a = h.start("a", None);
    let b = h.start("b", None);
    assert_eq!(h.registry().focused(), Some(b));

    h.manager.focus(a).unwrap();
    assert_eq!(h.registry().focused(), Some(a));

    h.manager.on_view_closed(a).await;
    assert_eq!(h.registry().focused(), Some(b));
    h.manager.on_view_closed(b).await;
    assert_eq!(h.registry().focused(), None);
}

#[tokio::test]
async fn unknown_target_is_rejected() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("a")]);
    assert!(h.manager.open(&TargetId::new("nope"), None).is_err());
    assert!(h.registry().is_empty());
}

#[tokio::test]
async fn shutdown_closes_everything() {
    let h = Harness::new(DeliveryMode::Push, vec![open_target("a"), open_target("b")]);
    let a = h.connected("a", None).await;
    let b = h.connected("b", None).await;

    h.manager.shutdown().await;
    assert!(h.registry().is_empty());
    assert_eq!(h.transport.disconnects(a), 1);
    assert_eq!(h.transport.disconnects(b), 1);
    assert_eq!(h.manager.bridge().subscription_count(), 0);
}
