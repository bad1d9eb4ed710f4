use crate::comms::envelope::{Envelope, Inbound, LineBuffer, MessageKind};
use crate::error::{Result, StokerError};
use crate::events::ProcessEvent;
use crate::process::manager::ProcessManager;
use crate::process::types::ProcessId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Handler invoked for every inbound unit that is not a correlated
/// response. A handler error is logged and never stops the other handlers.
pub type MessageHandler = Arc<dyn Fn(&Inbound) -> Result<()> + Send + Sync>;

/// Handle returned by `on_message`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    process: ProcessId,
    token: u64,
}

struct ChannelState {
    linebuf: LineBuffer,
    pending: HashMap<String, oneshot::Sender<Result<Value>>>,
    handlers: Vec<(u64, MessageHandler)>,
    dispatch: JoinHandle<()>,
}

/// Structured messaging over a managed process's stdio.
///
/// Frames the output stream into newline-delimited JSON envelopes,
/// correlates responses to in-flight requests by envelope id, and fans
/// everything else out to registered handlers. All process access goes
/// through the manager's id-indexed API; this layer never touches a raw
/// child handle.
#[derive(Clone)]
pub struct ProcessCommunication {
    inner: Arc<CommsInner>,
}

struct CommsInner {
    manager: ProcessManager,
    channels: Mutex<HashMap<ProcessId, ChannelState>>,
    next_request: AtomicU64,
    next_subscription: AtomicU64,
}

impl ProcessCommunication {
    pub fn new(manager: ProcessManager) -> Self {
        Self {
            inner: Arc::new(CommsInner {
                manager,
                channels: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Wrap the payload in an `event` envelope and write it to the
    /// process's stdin. Fails when the process or its input stream is gone.
    pub async fn send(&self, id: ProcessId, payload: Value) -> Result<()> {
        self.ensure_channel(id).await?;

        let envelope = Envelope::new(self.next_message_id("msg"), MessageKind::Event, payload);
        let line = envelope.to_line()?;
        self.inner.manager.write_stdin(id, line.into_bytes()).await
    }

    /// Send a `request` envelope and await the `response`/`error` envelope
    /// carrying the same id.
    ///
    /// The pending entry is registered before the write so a fast worker
    /// cannot respond into a void. Exactly one resolution happens per call:
    /// a response after the timeout, or a timeout after the response, finds
    /// the entry already gone and is a no-op.
    pub async fn send_and_wait(
        &self,
        id: ProcessId,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_channel(id).await?;

        let request_id = self.next_message_id("req");
        let envelope = Envelope::new(request_id.clone(), MessageKind::Request, payload);
        let line = envelope.to_line()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut channels = self.inner.channels.lock().await;
            let state = channels
                .get_mut(&id)
                .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;
            state.pending.insert(request_id.clone(), tx);
        }

        if let Err(e) = self.inner.manager.write_stdin(id, line.into_bytes()).await {
            self.forget_pending(id, &request_id).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(StokerError::ProcessTerminated),
            Err(_) => {
                self.forget_pending(id, &request_id).await;
                Err(StokerError::RequestTimeout(timeout))
            }
        }
    }

    /// Register a handler for every inbound unit on this process's output
    /// that is not a correlated response. Multiple handlers may coexist.
    ///
    /// Handlers run inline on the dispatch task and must not call back
    /// into this channel; hand work off through your own channel instead.
    pub async fn on_message(&self, id: ProcessId, handler: MessageHandler) -> Result<SubscriptionId> {
        self.ensure_channel(id).await?;

        let token = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        let mut channels = self.inner.channels.lock().await;
        let state = channels
            .get_mut(&id)
            .ok_or_else(|| StokerError::ProcessNotFound(id.to_string()))?;
        state.handlers.push((token, handler));

        Ok(SubscriptionId { process: id, token })
    }

    pub async fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut channels = self.inner.channels.lock().await;
        if let Some(state) = channels.get_mut(&subscription.process) {
            state.handlers.retain(|(t, _)| *t != subscription.token);
        }
    }

    /// Pipe an external byte stream into the process's input without
    /// closing it. Resolves when the source ends, fails on the first I/O
    /// error from either side.
    pub async fn stream_data<R>(&self, id: ProcessId, mut source: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = [0u8; 8192];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.inner.manager.write_stdin(id, buf[..n].to_vec()).await?;
        }
    }

    /// Drop buffered partial-line state, reject every pending request with
    /// a process-terminated error and remove all handlers for this id.
    pub async fn cleanup(&self, id: ProcessId) {
        let mut channels = self.inner.channels.lock().await;
        if let Some(mut state) = channels.remove(&id) {
            state.dispatch.abort();
            state.linebuf.clear();
            for (_, tx) in state.pending.drain() {
                let _ = tx.send(Err(StokerError::ProcessTerminated));
            }
        }
    }

    fn next_message_id(&self, prefix: &str) -> String {
        format!(
            "{}-{}",
            prefix,
            self.inner.next_request.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn forget_pending(&self, id: ProcessId, request_id: &str) {
        let mut channels = self.inner.channels.lock().await;
        if let Some(state) = channels.get_mut(&id) {
            state.pending.remove(request_id);
        }
    }

    /// Attach to the process's output stream on first use. The lossless tap
    /// keeps the framing invariant: every byte the child writes reaches the
    /// line buffer, in order, exactly once.
    async fn ensure_channel(&self, id: ProcessId) -> Result<()> {
        let mut channels = self.inner.channels.lock().await;
        if channels.contains_key(&id) {
            return Ok(());
        }

        let (tap_tx, tap_rx) = mpsc::channel::<Vec<u8>>(256);
        self.inner.manager.register_output_tap(id, tap_tx).await?;

        let events = self.inner.manager.subscribe();
        let comms = self.clone();
        let dispatch = tokio::spawn(comms.dispatch_loop(id, tap_rx, events));

        channels.insert(
            id,
            ChannelState {
                linebuf: LineBuffer::new(),
                pending: HashMap::new(),
                handlers: Vec::new(),
                dispatch,
            },
        );
        Ok(())
    }

    async fn dispatch_loop(
        self,
        id: ProcessId,
        mut data_rx: mpsc::Receiver<Vec<u8>>,
        mut events: broadcast::Receiver<ProcessEvent>,
    ) {
        loop {
            tokio::select! {
                // Drain output ahead of lifecycle events so bytes written
                // before an exit are still framed and delivered
                biased;

                chunk = data_rx.recv() => match chunk {
                    Some(data) => self.handle_chunk(id, &data).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(ProcessEvent::Exited { id: exited, .. }) if exited == id => {
                        self.on_process_exit(id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Dispatcher for process {} lagged {} lifecycle events",
                            id,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn handle_chunk(&self, id: ProcessId, data: &[u8]) {
        let mut channels = self.inner.channels.lock().await;
        let Some(state) = channels.get_mut(&id) else {
            return;
        };

        for inbound in state.linebuf.push(data) {
            let correlated = match &inbound {
                Inbound::Envelope(envelope)
                    if matches!(envelope.kind, MessageKind::Response | MessageKind::Error) =>
                {
                    match state.pending.remove(&envelope.id) {
                        Some(tx) => {
                            let outcome = match envelope.kind {
                                MessageKind::Response => Ok(envelope.payload.clone()),
                                _ => Err(StokerError::WorkerError(
                                    envelope
                                        .error_message()
                                        .unwrap_or("unspecified error")
                                        .to_string(),
                                )),
                            };
                            // Receiver gone means the request already timed
                            // out; dropping the result is the no-op we want
                            let _ = tx.send(outcome);
                            true
                        }
                        None => false,
                    }
                }
                _ => false,
            };

            if correlated {
                continue;
            }

            for (token, handler) in state.handlers.iter() {
                if let Err(e) = handler(&inbound) {
                    tracing::warn!(
                        "Message handler {} for process {} failed: {}",
                        token,
                        id,
                        e
                    );
                }
            }
        }
    }

    /// The process exited: the partial tail of the dead incarnation cannot
    /// complete, and neither can any in-flight request.
    async fn on_process_exit(&self, id: ProcessId) {
        let mut channels = self.inner.channels.lock().await;
        let Some(state) = channels.get_mut(&id) else {
            return;
        };
        state.linebuf.clear();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(StokerError::ProcessTerminated));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, ManagerConfig};
    use serde_json::json;
    use tokio::time::timeout;

    fn manager() -> ProcessManager {
        ProcessManager::new(ManagerConfig::default())
    }

    async fn spawn_cat(manager: &ProcessManager) -> ProcessId {
        manager.spawn(CommandSpec::new("/bin/cat")).await.unwrap()
    }

    #[tokio::test]
    async fn test_event_send_echoes_back_to_handler() {
        let manager = manager();
        let comms = ProcessCommunication::new(manager.clone());
        let id = spawn_cat(&manager).await;

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

        comms.send(id, json!({"hello": "worker"})).await.unwrap();

        let inbound = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match inbound {
            Inbound::Envelope(envelope) => {
                assert_eq!(envelope.kind, MessageKind::Event);
                assert_eq!(envelope.payload, json!({"hello": "worker"}));
            }
            Inbound::Raw(raw) => panic!("expected envelope, got raw: {}", raw),
        }

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_others() {
        let manager = manager();
        let comms = ProcessCommunication::new(manager.clone());
        let id = spawn_cat(&manager).await;

        comms
            .on_message(
                id,
                Arc::new(|_| Err(StokerError::WorkerError("handler blew up".to_string()))),
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        comms
            .on_message(
                id,
                Arc::new(move |_| {
                    let _ = tx.send(());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        comms.send(id, json!({"n": 1})).await.unwrap();

        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second handler must still run")
            .unwrap();

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let manager = manager();
        let comms = ProcessCommunication::new(manager.clone());
        let id = spawn_cat(&manager).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = comms
            .on_message(
                id,
                Arc::new(move |_| {
                    let _ = tx.send(());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        comms.send(id, json!({"n": 1})).await.unwrap();
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        comms.unsubscribe(subscription).await;
        comms.send(id, json!({"n": 2})).await.unwrap();

        assert!(
            timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
            "no delivery after unsubscribe"
        );

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_legacy_output_surfaces_as_raw() {
        let manager = manager();
        let comms = ProcessCommunication::new(manager.clone());
        // The echo is delayed so the handler below is attached first
        let id = manager
            .spawn(CommandSpec::new("/bin/sh").with_args(["-c", "sleep 0.5; echo plain text; sleep 5"]))
            .await
            .unwrap();

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

        let inbound = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(inbound, Inbound::Raw(raw) if raw == "plain text"));

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_process_fails() {
        let manager = manager();
        let comms = ProcessCommunication::new(manager);

        let result = comms.send(ProcessId::new(77), json!({})).await;
        assert!(matches!(result, Err(StokerError::ProcessNotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_rejects_pending_requests() {
        let manager = manager();
        let comms = ProcessCommunication::new(manager.clone());
        let id = spawn_cat(&manager).await;

        let comms2 = comms.clone();
        let pending = tokio::spawn(async move {
            comms2
                .send_and_wait(id, json!({"ask": 1}), Duration::from_secs(10))
                .await
        });

        // Give the request time to register, then tear the channel down
        tokio::time::sleep(Duration::from_millis(100)).await;
        comms.cleanup(id).await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(StokerError::ProcessTerminated)));

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_stream_data_pipes_without_closing() {
        let manager = manager();
        let comms = ProcessCommunication::new(manager.clone());
        let mut events = manager.subscribe();
        let id = spawn_cat(&manager).await;

        let source = std::io::Cursor::new(b"streamed bytes\n".to_vec());
        comms.stream_data(id, source).await.unwrap();

        let mut echoed = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline && !echoed.ends_with(b"\n") {
            if let Ok(Ok(ProcessEvent::Stdout { id: eid, data })) =
                timeout(Duration::from_millis(200), events.recv()).await
            {
                if eid == id {
                    echoed.extend_from_slice(&data);
                }
            }
        }
        assert_eq!(echoed, b"streamed bytes\n");

        // Input is still open: a follow-up write works
        comms.send(id, json!({"still": "alive"})).await.unwrap();

        manager.cleanup().await;
    }
}
