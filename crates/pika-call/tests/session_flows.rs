//! Session-level negotiation flows over the in-memory relay.

use std::time::Duration;

use pika_call::media::synthetic::SyntheticOptions;
use pika_call::media::{ConnectivityState, MediaEvent, SessionDescription};
use pika_call::signal::{SignalKind, SignalPayload};
use pika_call::{CallError, CallId, CallKind, CallPhase, CallRole, InMemoryRelay};

#[path = "support/mod.rs"]
mod support;
use support::{
    candidate, connected_pair, count_kind, drain, fast_config, hangup_reasons, initiator,
    inject, remote_offer, responder, settle, spawn, tap, wait_phase, TOPIC,
};

#[tokio::test(start_paused = true)]
async fn late_responder_still_receives_parked_offer() {
    let relay = InMemoryRelay::new();
    let id = CallId::generate();

    let alice = spawn(&relay, initiator(&id, CallKind::Audio), SyntheticOptions::default());
    wait_phase(&alice.handle, CallPhase::AwaitingAnswer).await;
    // settle delay, first send, one retry: all reach nobody.
    settle(Duration::from_secs(2)).await;
    assert_eq!(alice.handle.phase(), CallPhase::AwaitingAnswer);
    assert_eq!(alice.probe.offers_created(), 1);

    let mut tap = tap(&relay).await;
    let bob = spawn(&relay, responder(Some(&id), CallKind::Audio), SyntheticOptions::default());

    assert_eq!(wait_phase(&bob.handle, CallPhase::Connected).await.phase, CallPhase::Connected);
    assert_eq!(wait_phase(&alice.handle, CallPhase::Connected).await.phase, CallPhase::Connected);

    let msgs = drain(&mut tap);
    assert_eq!(count_kind(&msgs, "bob", SignalKind::Ready), 1);
    assert_eq!(count_kind(&msgs, "bob", SignalKind::Offer), 0);
    assert_eq!(count_kind(&msgs, "bob", SignalKind::Answer), 1);
    assert!(count_kind(&msgs, "alice", SignalKind::Offer) >= 1);
    assert_eq!(alice.probe.offers_created(), 1);
    assert!(!bob.probe.applied_remote_candidates().is_empty());

    alice.handle.hang_up().await;
    wait_phase(&bob.handle, CallPhase::Ended).await;
}

#[tokio::test(start_paused = true)]
async fn candidate_before_offer_is_applied_after_remote_description() {
    let relay = InMemoryRelay::new();
    let id = CallId::generate();
    let bob = spawn(
        &relay,
        responder(Some(&id), CallKind::Audio),
        SyntheticOptions {
            auto_connect: false,
            ..Default::default()
        },
    );
    wait_phase(&bob.handle, CallPhase::AwaitingOffer).await;

    inject(&relay, Some(&id), "alice", "bob", SignalPayload::Candidate(candidate(1))).await;
    settle(Duration::from_millis(10)).await;
    assert_eq!(bob.handle.snapshot().pending_candidates, 1);
    assert!(bob.probe.applied_remote_candidates().is_empty());

    inject(&relay, Some(&id), "alice", "bob", SignalPayload::Offer(remote_offer())).await;
    let snapshot = wait_phase(&bob.handle, CallPhase::Negotiating).await;
    assert_eq!(snapshot.phase, CallPhase::Negotiating);
    assert_eq!(snapshot.pending_candidates, 0);
    assert_eq!(bob.probe.applied_remote_candidates(), vec![candidate(1)]);
    assert_eq!(bob.probe.answers_created(), 1);
    assert_eq!(bob.probe.offers_created(), 0);

    // Late duplicate and fresh candidates after the description.
    inject(&relay, Some(&id), "alice", "bob", SignalPayload::Candidate(candidate(1))).await;
    inject(&relay, Some(&id), "alice", "bob", SignalPayload::Candidate(candidate(2))).await;
    settle(Duration::from_millis(10)).await;
    assert_eq!(
        bob.probe.applied_remote_candidates(),
        vec![candidate(1), candidate(2)]
    );

    bob.handle.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn responder_adopts_session_id_from_first_offer() {
    let relay = InMemoryRelay::new();
    let bob = spawn(
        &relay,
        responder(None, CallKind::Audio),
        SyntheticOptions {
            auto_connect: false,
            ..Default::default()
        },
    );
    wait_phase(&bob.handle, CallPhase::AwaitingOffer).await;

    let id = CallId::new("c0ffee00-0000-4000-8000-000000000001");
    let other = CallId::new("c0ffee00-0000-4000-8000-000000000002");
    inject(&relay, Some(&other), "alice", "bob", SignalPayload::Candidate(candidate(7))).await;
    inject(&relay, Some(&id), "alice", "bob", SignalPayload::Candidate(candidate(1))).await;
    inject(&relay, Some(&id), "alice", "bob", SignalPayload::Offer(remote_offer())).await;

    let snapshot = wait_phase(&bob.handle, CallPhase::Negotiating).await;
    assert_eq!(snapshot.session_id, Some(id));
    assert_eq!(bob.probe.applied_remote_candidates(), vec![candidate(1)]);

    bob.handle.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn hang_up_while_awaiting_answer_sends_one_hangup_and_releases() {
    let relay = InMemoryRelay::new();
    let mut tap = tap(&relay).await;
    let id = CallId::generate();
    let alice = spawn(&relay, initiator(&id, CallKind::Video), SyntheticOptions::default());
    wait_phase(&alice.handle, CallPhase::AwaitingAnswer).await;

    let first = alice.handle.hang_up().await;
    let second = alice.handle.hang_up().await;
    assert_eq!(first.phase, CallPhase::Ended);
    assert_eq!(second.phase, CallPhase::Ended);
    assert_eq!(first.end_reason.as_deref(), Some("user_hangup"));
    settle(Duration::from_millis(10)).await;

    let msgs = drain(&mut tap);
    assert_eq!(hangup_reasons(&msgs), vec!["user_hangup".to_string()]);
    let captured = alice.probe.captured_tracks();
    assert_eq!(captured.len(), 2);
    assert_eq!(alice.probe.stopped_tracks(), captured);
    assert_eq!(alice.probe.close_count(), 1);
    // Only the tap is left on the topic.
    assert_eq!(relay.subscriber_count(TOPIC), 1);
}

#[tokio::test(start_paused = true)]
async fn connectivity_failure_while_connected_fails_without_hangup() {
    let relay = InMemoryRelay::new();
    let (alice, bob) = connected_pair(&relay).await;
    let mut tap = tap(&relay).await;

    assert!(alice
        .probe
        .emit(MediaEvent::ConnectivityChanged(ConnectivityState::Failed)));
    let snapshot = wait_phase(&alice.handle, CallPhase::Failed).await;
    assert_eq!(snapshot.phase, CallPhase::Failed);
    assert_eq!(snapshot.last_error, Some(CallError::ConnectivityLost));
    settle(Duration::from_millis(10)).await;

    assert!(hangup_reasons(&drain(&mut tap)).is_empty());
    assert_eq!(
        alice.probe.stopped_tracks(),
        alice.probe.captured_tracks()
    );
    assert_eq!(alice.probe.close_count(), 1);
    assert_eq!(bob.handle.phase(), CallPhase::Connected);

    bob.handle.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn denied_capture_never_subscribes() {
    let relay = InMemoryRelay::new();
    let id = CallId::generate();
    let alice = spawn(
        &relay,
        initiator(&id, CallKind::Audio),
        SyntheticOptions {
            deny_capture: true,
            ..Default::default()
        },
    );
    let snapshot = wait_phase(&alice.handle, CallPhase::Failed).await;
    assert_eq!(snapshot.last_error, Some(CallError::MediaAccessDenied));
    assert_eq!(relay.subscriber_count(TOPIC), 0);
    assert!(!alice.probe.has_connection());
}

#[tokio::test(start_paused = true)]
async fn remote_hangup_ends_both_sides_once() {
    let relay = InMemoryRelay::new();
    let (alice, bob) = connected_pair(&relay).await;
    let mut tap = tap(&relay).await;

    let ended = bob.handle.hang_up().await;
    assert_eq!(ended.phase, CallPhase::Ended);
    let snapshot = wait_phase(&alice.handle, CallPhase::Ended).await;
    assert_eq!(snapshot.phase, CallPhase::Ended);
    assert_eq!(snapshot.end_reason.as_deref(), Some("user_hangup"));
    assert!(snapshot.duration().is_some());

    // Alice's own hang up after the remote one is a no-op.
    alice.handle.hang_up().await;
    settle(Duration::from_millis(10)).await;
    let msgs = drain(&mut tap);
    assert_eq!(count_kind(&msgs, "bob", SignalKind::Hangup), 1);
    assert_eq!(count_kind(&msgs, "alice", SignalKind::Hangup), 0);
    assert_eq!(alice.probe.close_count(), 1);
    assert_eq!(bob.probe.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn finished_sessions_ignore_further_signals() {
    let relay = InMemoryRelay::new();
    let (alice, bob) = connected_pair(&relay).await;
    let id = alice.handle.snapshot().session_id.expect("session id");

    alice.handle.hang_up().await;
    wait_phase(&bob.handle, CallPhase::Ended).await;

    inject(&relay, Some(&id), "bob", "alice", SignalPayload::Offer(remote_offer())).await;
    inject(
        &relay,
        Some(&id),
        "bob",
        "alice",
        SignalPayload::Answer(SessionDescription::answer("v=0")),
    )
    .await;
    inject(&relay, Some(&id), "bob", "alice", SignalPayload::Candidate(candidate(3))).await;
    alice
        .probe
        .emit(MediaEvent::ConnectivityChanged(ConnectivityState::Failed));
    settle(Duration::from_millis(50)).await;

    assert_eq!(alice.handle.phase(), CallPhase::Ended);
    assert_eq!(bob.handle.phase(), CallPhase::Ended);
    assert_eq!(alice.handle.snapshot().last_error, None);
}

#[tokio::test(start_paused = true)]
async fn foreign_and_stale_signals_do_not_move_the_session() {
    let relay = InMemoryRelay::new();
    let id = CallId::generate();
    let alice = spawn(&relay, initiator(&id, CallKind::Audio), SyntheticOptions::default());
    wait_phase(&alice.handle, CallPhase::AwaitingAnswer).await;

    let stale = CallId::generate();
    let answer = SignalPayload::Answer(SessionDescription::answer("v=0\r\nm=audio 9 x\r\n"));
    inject(&relay, Some(&stale), "bob", "alice", answer.clone()).await;
    inject(&relay, Some(&id), "bob", "carol", answer.clone()).await;
    inject(&relay, Some(&id), "mallory", "alice", answer).await;
    inject(
        &relay,
        Some(&stale),
        "bob",
        "alice",
        SignalPayload::Hangup {
            reason: "user_hangup".to_string(),
        },
    )
    .await;
    settle(Duration::from_millis(50)).await;

    let snapshot = alice.handle.snapshot();
    assert_eq!(snapshot.phase, CallPhase::AwaitingAnswer);
    assert_eq!(snapshot.role, CallRole::Initiator);
    assert!(alice.probe.remote_description().is_none());

    alice.handle.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_answer_is_ignored() {
    let relay = InMemoryRelay::new();
    let id = CallId::generate();
    let alice = spawn(
        &relay,
        initiator(&id, CallKind::Audio),
        SyntheticOptions {
            auto_connect: false,
            ..Default::default()
        },
    );
    wait_phase(&alice.handle, CallPhase::AwaitingAnswer).await;

    let first = SessionDescription::answer("v=0\r\ns=first\r\n");
    let second = SessionDescription::answer("v=0\r\ns=second\r\n");
    inject(&relay, Some(&id), "bob", "alice", SignalPayload::Answer(first.clone())).await;
    inject(&relay, Some(&id), "bob", "alice", SignalPayload::Answer(second)).await;
    settle(Duration::from_millis(50)).await;

    assert_eq!(alice.handle.phase(), CallPhase::Negotiating);
    assert_eq!(alice.probe.remote_description(), Some(first));

    alice.handle.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_fails_with_no_answer() {
    let relay = InMemoryRelay::new();
    let mut tap = tap(&relay).await;
    let id = CallId::generate();
    let alice = spawn(&relay, initiator(&id, CallKind::Audio), SyntheticOptions::default());

    let snapshot = tokio::time::timeout(
        Duration::from_secs(120),
        alice.handle.wait_for_phase(CallPhase::is_terminal),
    )
    .await
    .expect("answer timeout");
    assert_eq!(snapshot.phase, CallPhase::Failed);
    assert_eq!(snapshot.last_error, Some(CallError::NoAnswer));
    assert_eq!(hangup_reasons(&drain(&mut tap)), vec!["no_answer".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn mute_disables_audio_without_signaling() {
    let relay = InMemoryRelay::new();
    let (alice, bob) = connected_pair(&relay).await;
    let mut tap = tap(&relay).await;

    alice.handle.set_muted(true);
    settle(Duration::from_millis(10)).await;
    assert!(alice.handle.snapshot().muted);
    let disabled = alice.probe.disabled_tracks();
    assert_eq!(disabled.len(), 1);
    assert!(drain(&mut tap).is_empty());
    assert_eq!(alice.handle.phase(), CallPhase::Connected);

    alice.handle.set_muted(false);
    settle(Duration::from_millis(10)).await;
    assert!(alice.probe.disabled_tracks().is_empty());

    alice.handle.hang_up().await;
    wait_phase(&bob.handle, CallPhase::Ended).await;
}

#[tokio::test(start_paused = true)]
async fn first_offer_waits_for_settle_delay() {
    let relay = InMemoryRelay::new();
    let mut tap = tap(&relay).await;
    let id = CallId::generate();
    let alice = spawn(&relay, initiator(&id, CallKind::Audio), SyntheticOptions::default());
    wait_phase(&alice.handle, CallPhase::AwaitingAnswer).await;

    let settle_delay = fast_config().settle_delay();
    settle(settle_delay - Duration::from_millis(10)).await;
    assert_eq!(count_kind(&drain(&mut tap), "alice", SignalKind::Offer), 0);

    settle(Duration::from_millis(20)).await;
    assert_eq!(count_kind(&drain(&mut tap), "alice", SignalKind::Offer), 1);
    assert_eq!(alice.handle.phase(), CallPhase::AwaitingAnswer);

    alice.handle.hang_up().await;
}

#[tokio::test(start_paused = true)]
async fn offer_send_failing_twice_fails_the_call() {
    let relay = InMemoryRelay::new();
    let id = CallId::generate();
    let alice = spawn(&relay, initiator(&id, CallKind::Audio), SyntheticOptions::default());
    wait_phase(&alice.handle, CallPhase::AwaitingAnswer).await;
    relay.set_online(false);

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        alice.handle.wait_for_phase(CallPhase::is_terminal),
    )
    .await
    .expect("send failure is terminal");
    assert_eq!(snapshot.phase, CallPhase::Failed);
    assert_eq!(
        snapshot.last_error,
        Some(CallError::SignalingSendFailed(
            "relay is not connected".to_string()
        ))
    );
    assert_eq!(alice.probe.offers_created(), 1);
    assert_eq!(alice.probe.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_negotiating_fails() {
    let relay = InMemoryRelay::new();
    let mut tap = tap(&relay).await;
    let id = CallId::generate();
    let alice = spawn(
        &relay,
        initiator(&id, CallKind::Audio),
        SyntheticOptions {
            auto_connect: false,
            ..Default::default()
        },
    );
    wait_phase(&alice.handle, CallPhase::AwaitingAnswer).await;
    inject(
        &relay,
        Some(&id),
        "bob",
        "alice",
        SignalPayload::Answer(SessionDescription::answer("v=0\r\nm=audio 9 x\r\n")),
    )
    .await;
    wait_phase(&alice.handle, CallPhase::Negotiating).await;

    assert!(alice
        .probe
        .emit(MediaEvent::ConnectivityChanged(ConnectivityState::Disconnected)));
    let snapshot = wait_phase(&alice.handle, CallPhase::Failed).await;
    assert_eq!(snapshot.phase, CallPhase::Failed);
    assert_eq!(snapshot.last_error, Some(CallError::ConnectivityLost));
    assert_eq!(snapshot.connected_at, None);
    settle(Duration::from_millis(10)).await;
    assert!(hangup_reasons(&drain(&mut tap)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_negotiation_times_out_for_the_responder() {
    let relay = InMemoryRelay::new();
    let mut tap = tap(&relay).await;
    let id = CallId::generate();
    let bob = spawn(
        &relay,
        responder(Some(&id), CallKind::Audio),
        SyntheticOptions {
            auto_connect: false,
            ..Default::default()
        },
    );
    wait_phase(&bob.handle, CallPhase::AwaitingOffer).await;
    inject(&relay, Some(&id), "alice", "bob", SignalPayload::Offer(remote_offer())).await;
    wait_phase(&bob.handle, CallPhase::Negotiating).await;

    let snapshot = tokio::time::timeout(
        Duration::from_secs(120),
        bob.handle.wait_for_phase(CallPhase::is_terminal),
    )
    .await
    .expect("negotiation deadline");
    assert_eq!(snapshot.phase, CallPhase::Failed);
    assert_eq!(snapshot.last_error, Some(CallError::NegotiationTimeout));
    assert_eq!(hangup_reasons(&drain(&mut tap)), vec!["timeout".to_string()]);
    assert_eq!(bob.probe.close_count(), 1);
}
