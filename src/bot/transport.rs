//! Chat gateway transport
//!
//! Long-lived outbound WebSocket connection. Two framings share the socket:
//! gateway events (objects with `post_type`) and API responses (objects with
//! `echo` correlating a pending call). Reconnects with exponential backoff;
//! pending calls fail fast when the connection drops.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::bot::event::Segment;
use crate::core::state::{Notifier, TunnelNotice};
use crate::error::{AppError, Result};
use crate::logger::log;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const OUTBOUND_CAPACITY: usize = 64;
pub const EVENT_CAPACITY: usize = 64;

pub struct BotTransport {
    ws_url: String,
    token: String,
    broadcast_groups: Vec<String>,
    self_id: RwLock<Option<String>>,
    echo_counter: AtomicU64,
    pending: DashMap<String, oneshot::Sender<Result<Value>>>,
    outbound_tx: mpsc::Sender<String>,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl BotTransport {
    /// Build the transport and return it together with the receiving ends the
    /// caller wires up: `start` consumes the outbound receiver, the dispatcher
    /// consumes the event receiver.
    pub fn new(
        ws_url: String,
        token: String,
        self_id: Option<String>,
        broadcast_groups: Vec<String>,
    ) -> (Arc<Self>, mpsc::Receiver<String>, mpsc::Sender<Value>, mpsc::Receiver<Value>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let transport = Arc::new(Self {
            ws_url,
            token,
            broadcast_groups,
            self_id: RwLock::new(self_id),
            echo_counter: AtomicU64::new(1),
            pending: DashMap::new(),
            outbound_tx,
            connected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        (transport, outbound_rx, event_tx, event_rx)
    }

    fn connect_url(&self) -> String {
        if self.token.is_empty() {
            self.ws_url.clone()
        } else {
            let sep = if self.ws_url.contains('?') { '&' } else { '?' };
            format!("{}{}access_token={}", self.ws_url, sep, self.token)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn self_id(&self) -> Option<String> {
        self.self_id.read().await.clone()
    }

    /// Record the gateway-reported self id the first time we see it.
    pub async fn observe_self_id(&self, id: &str) {
        let mut guard = self.self_id.write().await;
        if guard.is_none() {
            log::info!(self_id = id, "Captured bot self id from event stream");
            *guard = Some(id.to_string());
        }
    }

    /// Spawn the connection loop. Reconnects forever until `stop`.
    pub fn start(
        self: Arc<Self>,
        outbound_rx: mpsc::Receiver<String>,
        event_tx: mpsc::Sender<Value>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(outbound_rx, event_tx).await })
    }

    async fn run(self: Arc<Self>, mut outbound_rx: mpsc::Receiver<String>, event_tx: mpsc::Sender<Value>) {
        let mut k: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match connect_async(self.connect_url()).await {
                Ok((ws, _)) => {
                    log::info!(url = %self.ws_url, "Bot transport connected");
                    self.connected.store(true, Ordering::Relaxed);
                    k = 0;

                    let (mut sink, mut stream) = ws.split();
                    loop {
                        tokio::select! {
                            frame = stream.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    self.handle_frame(&text, &event_tx).await;
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = sink.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    log::warn!("Bot transport closed by gateway");
                                    break;
                                }
                                Some(Err(e)) => {
                                    log::warn!(error = %e, "Bot transport read error");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            },
                            out = outbound_rx.recv() => match out {
                                Some(text) => {
                                    if let Err(e) = sink.send(Message::Text(text)).await {
                                        log::warn!(error = %e, "Bot transport write error");
                                        break;
                                    }
                                }
                                None => return,
                            },
                            _ = self.shutdown.cancelled() => {
                                let _ = sink.send(Message::Close(None)).await;
                                self.connected.store(false, Ordering::Relaxed);
                                self.fail_pending();
                                return;
                            }
                        }
                    }

                    self.connected.store(false, Ordering::Relaxed);
                    self.fail_pending();
                }
                Err(e) => {
                    log::warn!(error = %e, "Bot transport connect failed");
                }
            }

            let delay = reconnect_delay(k);
            k = k.saturating_add(1);
            log::debug!(delay_secs = delay.as_secs(), "Bot transport reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// Drop the socket and fail every in-flight call.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.fail_pending();
    }

    fn fail_pending(&self) {
        let echoes: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for echo in echoes {
            if let Some((_, tx)) = self.pending.remove(&echo) {
                let _ = tx.send(Err(AppError::Transport("disconnected".to_string())));
            }
        }
    }

    /// Route one inbound frame: API response by echo, or gateway event.
    async fn handle_frame(&self, text: &str, event_tx: &mpsc::Sender<Value>) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            log::debug!("Dropping unparseable gateway frame");
            return;
        };

        if let Some(echo) = frame.get("echo").and_then(|v| v.as_str()) {
            if let Some((_, tx)) = self.pending.remove(echo) {
                let status = frame.get("status").and_then(|v| v.as_str()).unwrap_or("");
                let result = if status == "ok" {
                    Ok(frame.get("data").cloned().unwrap_or(Value::Null))
                } else {
                    let retcode = frame.get("retcode").and_then(|v| v.as_i64()).unwrap_or(-1);
                    Err(AppError::Transport(format!(
                        "API call failed: status={} retcode={}",
                        status, retcode
                    )))
                };
                let _ = tx.send(result);
            }
            return;
        }

        if frame.get("post_type").is_some() {
            if frame.get("post_type").and_then(|v| v.as_str()) == Some("meta_event") {
                log::debug!("Gateway meta event");
            }
            if event_tx.send(frame).await.is_err() {
                log::warn!("Event channel closed, dropping gateway event");
            }
        }
    }

    /// Send an API call frame and wait for the matching echo.
    pub async fn call_api(&self, action: &str, params: Value) -> Result<Value> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::Transport("shut down".to_string()));
        }

        let echo = format!("ff-{}", self.echo_counter.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(echo.clone(), tx);

        let frame = json!({ "action": action, "params": params, "echo": echo }).to_string();
        if self.outbound_tx.send(frame).await.is_err() {
            self.pending.remove(&echo);
            return Err(AppError::Transport("outbound channel closed".to_string()));
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::Transport("call dropped".to_string())),
            Err(_) => {
                self.pending.remove(&echo);
                Err(AppError::Transport("call timed out".to_string()))
            }
        }
    }

    /// Group message that @-mentions a user.
    pub async fn send_group_message(&self, group_id: &str, user_id: &str, text: &str) -> Result<()> {
        let message = json!([Segment::at(user_id), Segment::text(&format!(" {}", text))]);
        self.call_api(
            "send_group_msg",
            json!({ "group_id": group_value(group_id), "message": message }),
        )
        .await?;
        Ok(())
    }

    /// Plain group message without a mention.
    pub async fn send_group_text(&self, group_id: &str, text: &str) -> Result<()> {
        let message = json!([Segment::text(text)]);
        self.call_api(
            "send_group_msg",
            json!({ "group_id": group_value(group_id), "message": message }),
        )
        .await?;
        Ok(())
    }

    /// Send `text` to each group (default: the configured broadcast groups).
    pub async fn broadcast_group_message(&self, text: &str, groups: Option<&[String]>) {
        let groups = groups.unwrap_or(&self.broadcast_groups);
        for group_id in groups {
            if let Err(e) = self.send_group_text(group_id, text).await {
                log::warn!(group = %group_id, error = %e, "Broadcast failed");
            }
        }
    }
}

/// The gateway expects numeric group ids where possible.
fn group_value(group_id: &str) -> Value {
    match group_id.parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(group_id),
    }
}

fn reconnect_delay(k: u32) -> Duration {
    let secs = 1u64.checked_shl(k).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_RECONNECT_DELAY)
}

/// [`Notifier`] backed by the bot transport.
pub struct BotNotifier(pub Arc<BotTransport>);

#[async_trait]
impl Notifier for BotNotifier {
    async fn tunnel_connected(&self, notice: TunnelNotice) {
        let text = format!(
            "隧道 {} 已连接: {} ({})",
            notice.tunnel_id, notice.endpoint, notice.game_name
        );
        if let Err(e) = self
            .0
            .send_group_message(&notice.group_id, &notice.user_id, &text)
            .await
        {
            log::warn!(error = %e, "Tunnel-connected notification failed");
        }
    }

    async fn tunnel_disconnected(&self, notice: TunnelNotice) {
        let text = format!("隧道 {} 已断开 ({})", notice.tunnel_id, notice.game_name);
        if let Err(e) = self
            .0
            .send_group_message(&notice.group_id, &notice.user_id, &text)
            .await
        {
            log::warn!(error = %e, "Tunnel-disconnected notification failed");
        }
    }

    async fn group_message(&self, group_id: &str, text: &str) {
        if let Err(e) = self.0.send_group_text(group_id, text).await {
            log::warn!(error = %e, "Group message failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_transport() -> (Arc<BotTransport>, mpsc::Receiver<String>, mpsc::Sender<Value>, mpsc::Receiver<Value>) {
        BotTransport::new(
            "ws://127.0.0.1:6700".to_string(),
            String::new(),
            None,
            vec!["g1".to_string()],
        )
    }

    #[test]
    fn test_connect_url_without_token() {
        let (transport, _rx, _etx, _erx) = make_transport();
        assert_eq!(transport.connect_url(), "ws://127.0.0.1:6700");
    }

    #[test]
    fn test_connect_url_with_token() {
        let (transport, _rx, _etx, _erx) = BotTransport::new(
            "ws://127.0.0.1:6700".to_string(),
            "secret".to_string(),
            None,
            vec![],
        );
        assert_eq!(
            transport.connect_url(),
            "ws://127.0.0.1:6700?access_token=secret"
        );
    }

    #[test]
    fn test_reconnect_delay_backoff() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(64), Duration::from_secs(30));
    }

    #[test]
    fn test_group_value_numeric_vs_string() {
        assert_eq!(group_value("12345"), json!(12345));
        assert_eq!(group_value("not-a-number"), json!("not-a-number"));
    }

    #[tokio::test]
    async fn test_observe_self_id_first_write_wins() {
        let (transport, _rx, _etx, _erx) = make_transport();
        assert_eq!(transport.self_id().await, None);
        transport.observe_self_id("111").await;
        transport.observe_self_id("222").await;
        assert_eq!(transport.self_id().await.as_deref(), Some("111"));
    }

    #[tokio::test]
    async fn test_api_response_resolves_pending_call() {
        let (transport, mut outbound_rx, event_tx, _erx) = make_transport();

        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.call_api("get_status", json!({})).await });

        // read the outbound frame to learn the echo
        let frame = outbound_rx.recv().await.unwrap();
        let sent: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(sent["action"], "get_status");
        let echo = sent["echo"].as_str().unwrap().to_string();

        let response = json!({ "status": "ok", "retcode": 0, "data": { "good": true }, "echo": echo })
            .to_string();
        transport.handle_frame(&response, &event_tx).await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!({ "good": true }));
    }

    #[tokio::test]
    async fn test_api_error_response_rejects_call() {
        let (transport, mut outbound_rx, event_tx, _erx) = make_transport();

        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.call_api("send_group_msg", json!({})).await });

        let frame = outbound_rx.recv().await.unwrap();
        let sent: Value = serde_json::from_str(&frame).unwrap();
        let echo = sent["echo"].as_str().unwrap().to_string();

        let response =
            json!({ "status": "failed", "retcode": 100, "echo": echo }).to_string();
        transport.handle_frame(&response, &event_tx).await;

        assert!(call.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (transport, _rx, event_tx, mut event_rx) = make_transport();
        let frame = json!({ "post_type": "message", "message_type": "group" }).to_string();
        transport.handle_frame(&frame, &event_tx).await;

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event["post_type"], "message");
    }

    #[tokio::test]
    async fn test_stop_fails_pending_calls() {
        let (transport, _outbound_rx, _etx, _erx) = make_transport();

        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.call_api("get_status", json!({})).await });
        // give the call a moment to register
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.stop();

        assert!(call.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_call_after_stop_fails_immediately() {
        let (transport, _rx, _etx, _erx) = make_transport();
        transport.stop();
        assert!(transport.call_api("x", json!({})).await.is_err());
    }
}
