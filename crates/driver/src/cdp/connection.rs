//! CDP connection - one WebSocket per engine
//!
//! Commands are matched to replies by id through a lock-free pending map;
//! events are fanned out on a broadcast channel so any number of pages can
//! filter for their own session. Fail fast: no retries, no queuing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::cdp::wire::{CallId, CdpCall, CdpEvent, CdpMessage, CdpReply};
use crate::error::{DriverError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Broadcast capacity for raw CDP events. Slow subscribers lag and lose
/// events rather than stalling the reader task.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct Connection {
    next_id: AtomicU64,

    /// Callers waiting for a reply, keyed by call id.
    pending: Arc<DashMap<CallId, oneshot::Sender<CdpReply>>>,

    /// All unsolicited events, unfiltered. Pages subscribe and filter by
    /// session id.
    event_tx: broadcast::Sender<CdpEvent>,

    sink: Mutex<WsSink>,
}

impl Connection {
    /// Connect to a DevTools WebSocket endpoint and start the reader task.
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let parsed =
            url::Url::parse(ws_url).map_err(|e| DriverError::Endpoint(e.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(DriverError::Endpoint(format!(
                "expected ws:// or wss:// URL, got {ws_url}"
            )));
        }

        let (stream, _) = connect_async(ws_url).await?;
        let (sink, mut source) = stream.split();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let conn = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            event_tx,
            sink: Mutex::new(sink),
        });

        let reader = Arc::clone(&conn);
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => reader.dispatch(&text),
                    Ok(Message::Close(_)) => {
                        tracing::info!("DevTools socket closed by engine");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("DevTools socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            // Wake every caller still waiting; their oneshot senders drop
            // here and the receivers observe Closed.
            reader.pending.clear();
        });

        Ok(conn)
    }

    /// Send a command and wait for its reply.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let call = CdpCall {
            id,
            method: method.to_string(),
            params,
            session_id: session_id.map(str::to_string),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let json = serde_json::to_string(&call)?;
        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(json)).await {
                self.pending.remove(&id);
                return Err(DriverError::WebSocket(e));
            }
        }

        let reply = rx.await.map_err(|_| DriverError::Closed)?;
        if let Some(err) = reply.error {
            return Err(DriverError::Protocol {
                code: err.code,
                message: err.message,
            });
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    /// Subscribe to the raw event stream.
    pub fn events(&self) -> broadcast::Receiver<CdpEvent> {
        self.event_tx.subscribe()
    }

    /// Wait for the next event with the given method (and session, when
    /// supplied), bounded by `timeout`.
    pub async fn wait_for(
        &self,
        method: &str,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<CdpEvent> {
        Self::wait_on(self.events(), method, session_id, timeout).await
    }

    /// Like `wait_for`, but on a receiver the caller subscribed earlier.
    /// Subscribe before issuing the command that triggers the event, or the
    /// event can fire into nothing.
    pub async fn wait_on(
        mut rx: broadcast::Receiver<CdpEvent>,
        method: &str,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<CdpEvent> {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if ev.method == method
                            && (session_id.is_none() || ev.session_id.as_deref() == session_id)
                        {
                            return Ok(ev);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("event stream lagged, skipped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(DriverError::Closed),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DriverError::Timeout(format!("waiting for {method}")))?
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<CdpMessage>(text) {
            Ok(CdpMessage::Reply(reply)) => {
                if let Some((_, tx)) = self.pending.remove(&reply.id) {
                    let _ = tx.send(reply);
                } else {
                    tracing::warn!("reply for unknown call id {}", reply.id);
                }
            }
            Ok(CdpMessage::Event(event)) => {
                // No subscribers is fine; events are advisory.
                let _ = self.event_tx.send(event);
            }
            Err(e) => tracing::warn!("unparseable CDP message: {e}"),
        }
    }

    /// Close the socket. Pending callers observe `Closed`.
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}
