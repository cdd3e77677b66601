use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peermeet_core::chat::MessageOrigin;
use peermeet_core::loopback::{LoopbackDevices, LoopbackNetwork};
use peermeet_core::{
    MeetError, MeetEvent, MediaKind, RoomId, RoomRole, RoomSession, SessionConfig, SessionPhase,
};

struct Member {
    session: RoomSession,
    devices: Arc<LoopbackDevices>,
    events: Arc<Mutex<Vec<MeetEvent>>>,
}

async fn member(net: &LoopbackNetwork, name: &str) -> Member {
    let devices = Arc::new(LoopbackDevices::new());
    let config = SessionConfig {
        display_name: name.to_string(),
        probe_timeout: Duration::from_millis(500),
        ..SessionConfig::default()
    };
    let session = RoomSession::new(config, Arc::new(net.clone()), devices.clone());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.add_fn(move |e| sink.lock().unwrap().push(e));
    session.refresh_devices().await.unwrap();
    Member { session, devices, events }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn occupancy_probe_reports_hosted_rooms_and_cleans_up() {
    let net = LoopbackNetwork::new();
    let host = member(&net, "host").await;
    let visitor = member(&net, "visitor").await;
    let room = RoomId::generate();

    assert!(!visitor.session.check_room_occupancy(&room).await);
    assert_eq!(net.live_peers(), 0);

    host.session.host_room(&room).await.unwrap();
    assert_eq!(net.live_peers(), 1);

    assert!(visitor.session.check_room_occupancy(&room).await);
    assert_eq!(net.live_peers(), 1);
    assert_eq!(visitor.session.phase(), SessionPhase::Idle);

    host.session.teardown().await;
    assert_eq!(net.live_peers(), 0);
}

#[tokio::test]
async fn host_and_two_joiners_meet_and_chat() {
    let net = LoopbackNetwork::new();
    let host = member(&net, "Alice").await;
    let bob = member(&net, "Bob").await;
    let carol = member(&net, "Carol").await;
    let room = RoomId::parse("https://meet.example/m/standup").unwrap();

    let host_handle = host.session.enter(&room).await.unwrap();
    assert_eq!(host_handle.role(), RoomRole::Host);

    let bob_handle = bob.session.enter(&room).await.unwrap();
    assert_eq!(bob_handle.role(), RoomRole::Joiner);
    let carol_handle = carol.session.enter(&room).await.unwrap();
    assert_eq!(carol_handle.role(), RoomRole::Joiner);

    let h = &host.session;
    wait_for("both joiners on the host", move || async move {
        let list = h.participants().await;
        list.len() == 2 && list.iter().all(|p| p.has_audio && p.display_name.is_some())
    })
    .await;
    let names: Vec<_> = host
        .session
        .participants()
        .await
        .into_iter()
        .filter_map(|p| p.display_name)
        .collect();
    assert_eq!(names, ["Bob", "Carol"]);

    let b = &bob.session;
    wait_for("host on bob's side", move || async move {
        let list = b.participants().await;
        list.len() == 1 && list[0].peer_id == "standup" && list[0].has_audio
    })
    .await;

    bob.session.chat().send_message("hi all", None).await.unwrap();
    let h = &host.session;
    wait_for("chat on the host", move || async move {
        h.chat().messages().await.iter().any(|m| m.text == "hi all")
    })
    .await;
    let log = host.session.chat().messages().await;
    let received = log.iter().find(|m| m.text == "hi all").unwrap();
    assert_eq!(received.sender_name, "Bob");
    assert_eq!(
        received.origin,
        MessageOrigin::Remote { peer_id: bob_handle.local_peer_id().to_string() }
    );

    for m in [&carol, &bob, &host] {
        m.session.teardown().await;
        assert_eq!(m.devices.live_tracks(), 0);
    }
    assert_eq!(net.live_peers(), 0);
}

#[tokio::test]
async fn host_survives_a_joiner_leaving() {
    let net = LoopbackNetwork::new();
    let host = member(&net, "host").await;
    let bob = member(&net, "bob").await;
    let carol = member(&net, "carol").await;
    let room = RoomId::generate();

    host.session.enter(&room).await.unwrap();
    bob.session.enter(&room).await.unwrap();
    carol.session.enter(&room).await.unwrap();

    let h = &host.session;
    wait_for("two participants", move || async move { h.participants().await.len() == 2 }).await;

    bob.session.teardown().await;
    wait_for("bob removed", move || async move { h.participants().await.len() == 1 }).await;
    assert_eq!(host.session.phase(), SessionPhase::Connected);
    assert!(net.is_registered(room.as_str()));

    carol.session.chat().send_message("still here", None).await.unwrap();
    wait_for("carol's message", move || async move {
        h.chat().messages().await.iter().any(|m| m.text == "still here")
    })
    .await;

    host.session.teardown().await;
    carol.session.teardown().await;
    assert_eq!(net.live_peers(), 0);
}

#[tokio::test]
async fn joiner_is_told_when_host_goes_away() {
    let net = LoopbackNetwork::new();
    let host = member(&net, "host").await;
    let bob = member(&net, "bob").await;
    let room = RoomId::generate();

    host.session.enter(&room).await.unwrap();
    bob.session.enter(&room).await.unwrap();
    let b = &bob.session;
    wait_for("host visible", move || async move { b.participants().await.len() == 1 }).await;

    host.session.teardown().await;

    let events = bob.events.clone();
    wait_for("loss notice", move || {
        let events = events.clone();
        async move {
            events.lock().unwrap().iter().any(|e| {
                matches!(e, MeetEvent::Notice(n) if matches!(n.error, MeetError::Connection(_)))
            })
        }
    })
    .await;

    let b = &bob.session;
    wait_for("bob back to idle", move || async move {
        b.phase() == SessionPhase::Idle && b.handle().await.is_none()
    })
    .await;
    assert!(bob.session.participants().await.is_empty());
    assert_eq!(bob.devices.live_tracks(), 0);
    assert_eq!(net.live_peers(), 0);
    assert_eq!(
        bob.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, MeetEvent::SessionEnded))
            .count(),
        1
    );
}

#[tokio::test]
async fn joining_a_vanished_room_fails_cleanly() {
    let net = LoopbackNetwork::new();
    let bob = member(&net, "bob").await;
    let room = RoomId::generate();

    let err = bob
        .session
        .join_room(&room, peermeet_core::MediaStream::empty("nothing"))
        .await
        .unwrap_err();
    assert!(matches!(err, MeetError::Connection(_)));
    assert_eq!(bob.session.phase(), SessionPhase::Idle);
    assert!(bob.session.handle().await.is_none());
    assert_eq!(net.live_peers(), 0);
}

#[tokio::test]
async fn second_host_on_a_taken_id_gets_connection_error() {
    let net = LoopbackNetwork::new();
    let first = member(&net, "first").await;
    let second = member(&net, "second").await;
    let room = RoomId::generate();

    first.session.host_room(&room).await.unwrap();
    let err = second.session.host_room(&room).await.unwrap_err();
    assert!(matches!(err, MeetError::Connection(_)));
    assert!(net.is_registered(room.as_str()));

    first.session.teardown().await;
}

#[tokio::test]
async fn screen_share_reaches_the_host() {
    let net = LoopbackNetwork::new();
    let host = member(&net, "host").await;
    let bob = member(&net, "bob").await;
    let room = RoomId::generate();

    host.session.enter(&room).await.unwrap();
    bob.session.enter(&room).await.unwrap();

    let h = &host.session;
    wait_for("bob connected", move || async move {
        h.participants().await.first().is_some_and(|p| p.has_audio)
    })
    .await;
    assert!(!host.session.participants().await[0].has_video);

    bob.session.share_screen().await.unwrap();
    wait_for("bob's screen", move || async move {
        h.participants().await.first().is_some_and(|p| p.has_video && p.has_audio)
    })
    .await;

    bob.session.stop_screen_share().await.unwrap();
    wait_for("screen gone", move || async move {
        h.participants().await.first().is_some_and(|p| !p.has_video)
    })
    .await;

    bob.session.teardown().await;
    host.session.teardown().await;
    assert_eq!(net.live_peers(), 0);
    assert_eq!(bob.devices.live_tracks(), 0);
}

#[tokio::test]
async fn teardown_runs_local_then_remote_then_ends() {
    let net = LoopbackNetwork::new();
    let host = member(&net, "host").await;
    let bob = member(&net, "bob").await;
    let room = RoomId::generate();

    host.session.enter(&room).await.unwrap();
    bob.session.enter(&room).await.unwrap();
    let b = &bob.session;
    wait_for("host stream", move || async move {
        b.participants().await.first().is_some_and(|p| p.stream_id.is_some())
    })
    .await;

    bob.events.lock().unwrap().clear();
    bob.session.teardown().await;
    bob.session.teardown().await;

    let events = bob.events.lock().unwrap().clone();
    let position = |pred: &dyn Fn(&MeetEvent) -> bool| events.iter().position(pred).unwrap();
    let local_off = position(&|e| {
        matches!(e, MeetEvent::LocalMediaChanged { kind: MediaKind::Audio, active: false })
    });
    let remote_gone = position(&|e| matches!(e, MeetEvent::ParticipantLeft(_)));
    let ended = position(&|e| matches!(e, MeetEvent::SessionEnded));
    assert!(local_off < remote_gone);
    assert!(remote_gone < ended);
    assert_eq!(events.iter().filter(|e| matches!(e, MeetEvent::SessionEnded)).count(), 1);

    host.session.teardown().await;
}
