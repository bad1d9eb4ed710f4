// Request/response correlation against real stdio workers

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stoker::comms::{Envelope, Inbound, MessageKind, ProcessCommunication};
use stoker::config::{CommandSpec, ManagerConfig};
use stoker::error::StokerError;
use stoker::process::{ProcessId, ProcessManager};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn manager() -> ProcessManager {
    ProcessManager::new(ManagerConfig::default())
}

/// A worker that answers every request: sed rewrites the envelope kind on
/// the echoed line, turning each request into its own response
async fn spawn_responder(manager: &ProcessManager, reply_kind: &str) -> ProcessId {
    let script = format!("s/\"type\":\"request\"/\"type\":\"{}\"/", reply_kind);
    manager
        .spawn(CommandSpec::new("sed").with_args(["-u".to_string(), script]))
        .await
        .unwrap()
}

#[tokio::test]
async fn send_and_wait_resolves_with_matching_response() {
    let manager = manager();
    let comms = ProcessCommunication::new(manager.clone());
    let id = spawn_responder(&manager, "response").await;

    let payload = json!({"prompt": "fix the bug", "options": {"stream": false}});
    let answer = comms
        .send_and_wait(id, payload.clone(), Duration::from_secs(5))
        .await
        .unwrap();

    // The responder echoes the payload untouched
    assert_eq!(answer, payload);

    manager.cleanup().await;
}

#[tokio::test]
async fn sequential_requests_correlate_independently() {
    let manager = manager();
    let comms = ProcessCommunication::new(manager.clone());
    let id = spawn_responder(&manager, "response").await;

    for n in 0..5 {
        let answer = comms
            .send_and_wait(id, json!({"n": n}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(answer, json!({"n": n}));
    }

    manager.cleanup().await;
}

#[tokio::test]
async fn error_envelope_rejects_the_request() {
    let manager = manager();
    let comms = ProcessCommunication::new(manager.clone());
    let id = spawn_responder(&manager, "error").await;

    let result = comms
        .send_and_wait(id, json!({"message": "boom"}), Duration::from_secs(5))
        .await;

    match result {
        Err(StokerError::WorkerError(message)) => assert_eq!(message, "boom"),
        other => panic!("expected WorkerError, got {:?}", other),
    }

    manager.cleanup().await;
}

#[tokio::test]
async fn timeout_rejects_and_late_response_is_a_noop() {
    let manager = manager();
    let comms = ProcessCommunication::new(manager.clone());
    // cat echoes the request back as a request, so nothing ever correlates
    let id = manager.spawn(CommandSpec::new("/bin/cat")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    comms
        .on_message(
            id,
            Arc::new(move |inbound| {
                let _ = tx.send(inbound.clone());
                Ok(())
            }),
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = comms
        .send_and_wait(id, json!({"q": 1}), Duration::from_millis(150))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(StokerError::RequestTimeout(_))));
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(2));

    // Learn the request id from the echoed request envelope
    let echoed = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let request_id = match echoed {
        Inbound::Envelope(envelope) => {
            assert_eq!(envelope.kind, MessageKind::Request);
            envelope.id
        }
        Inbound::Raw(raw) => panic!("expected the echoed request, got raw: {}", raw),
    };

    // A response arriving after the timeout finds no pending entry; it is
    // delivered as an ordinary uncorrelated message and nothing resolves
    let late = Envelope::new(request_id, MessageKind::Response, json!({"late": true}));
    manager
        .write_stdin(id, late.to_line().unwrap().into_bytes())
        .await
        .unwrap();

    let passed_through = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        passed_through,
        Inbound::Envelope(e) if e.kind == MessageKind::Response && e.payload == json!({"late": true})
    ));

    // The channel still works after the race
    comms.send(id, json!({"still": "fine"})).await.unwrap();

    manager.cleanup().await;
}

#[tokio::test]
async fn envelopes_are_delivered_in_stream_order() {
    let manager = manager();
    let comms = ProcessCommunication::new(manager.clone());
    let id = manager.spawn(CommandSpec::new("/bin/cat")).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    comms
        .on_message(
            id,
            Arc::new(move |inbound| {
                if let Inbound::Envelope(envelope) = inbound {
                    let _ = tx.send(envelope.payload["n"].as_u64().unwrap());
                }
                Ok(())
            }),
        )
        .await
        .unwrap();

    for n in 0..10u64 {
        comms.send(id, json!({"n": n})).await.unwrap();
    }

    for expected in 0..10u64 {
        let got = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, expected);
    }

    manager.cleanup().await;
}

#[tokio::test]
async fn pending_request_rejected_when_worker_dies() {
    let manager = manager();
    let comms = ProcessCommunication::new(manager.clone());
    let id = manager.spawn(CommandSpec::new("/bin/cat")).await.unwrap();

    let comms2 = comms.clone();
    let pending = tokio::spawn(async move {
        comms2
            .send_and_wait(id, json!({"q": 1}), Duration::from_secs(10))
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.terminate(id, false).await.unwrap();

    let result = timeout(Duration::from_secs(3), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(StokerError::ProcessTerminated)));

    manager.cleanup().await;
}
