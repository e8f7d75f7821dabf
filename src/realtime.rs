use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::api::{ApiClient, ApiError};
use crate::events::StreamEvent;
use crate::remote::{Connection, EventSource, wait_for_shutdown};
use crate::wire::decode_event;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("connection error")]
    ConnectionError,
}

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Live event stream over the real-time WebSocket API.
///
/// Every connection starts with a start call that returns a one-shot socket
/// URL and the workspace snapshot. Lost sockets are reopened the same way.
pub struct RealtimeSource {
    api: ApiClient,
}

impl RealtimeSource {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl EventSource for RealtimeSource {
    async fn connect(&self, shutdown: watch::Receiver<bool>) -> Result<Connection, RealtimeError> {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let _ = tx.send(StreamEvent::Connecting).await;

        let start = self.api.start_realtime().await?;
        let (url, bootstrap) = start.into_parts();
        let socket = open(&url).await?;
        let _ = tx.send(StreamEvent::Connected).await;
        tracing::info!("real-time socket open");

        tokio::spawn(manage(self.api.clone(), socket, tx, shutdown));
        Ok(Connection { bootstrap, events })
    }
}

async fn open(url: &str) -> Result<Socket, RealtimeError> {
    let url = Url::parse(url)?;
    let (socket, _) = connect_async(url).await?;
    Ok(socket)
}

/// Starts a fresh session and opens its socket. The snapshot is dropped:
/// the engine's periodic refresh catches up on what changed meanwhile.
async fn reopen(api: &ApiClient) -> Result<Socket, RealtimeError> {
    let (url, _) = api.start_realtime().await?.into_parts();
    open(&url).await
}

enum Pump {
    Shutdown,
    ReceiverGone,
    Lost(String),
}

async fn manage(
    api: ApiClient,
    mut socket: Socket,
    tx: mpsc::Sender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match pump(&mut socket, &tx, &mut shutdown).await {
            Pump::Shutdown => {
                close(&mut socket).await;
                let _ = tx.send(StreamEvent::Disconnected { intentional: true }).await;
                return;
            }
            Pump::ReceiverGone => {
                close(&mut socket).await;
                return;
            }
            Pump::Lost(reason) => {
                tracing::warn!(%reason, "real-time socket lost");
                if tx.send(StreamEvent::Disconnected { intentional: false }).await.is_err() {
                    return;
                }
                match reconnect(&api, &tx, &mut shutdown).await {
                    Some(reopened) => socket = reopened,
                    None => return,
                }
            }
        }
    }
}

/// Retries until a socket opens. `None` on shutdown or when nobody
/// listens anymore.
async fn reconnect(
    api: &ApiClient,
    tx: &mpsc::Sender<StreamEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Socket> {
    let mut attempt = 0;
    loop {
        let delay = backoff_delay(attempt, rand::thread_rng().gen_range(0.0..1.0));
        tracing::debug!(attempt, ?delay, "reconnecting");
        tokio::select! {
            _ = wait_for_shutdown(shutdown) => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        tx.send(StreamEvent::Connecting).await.ok()?;
        match reopen(api).await {
            Ok(socket) => {
                tx.send(StreamEvent::Connected).await.ok()?;
                tracing::info!(attempt, "real-time socket reopened");
                return Some(socket);
            }
            Err(error) => {
                tracing::warn!(%error, attempt, "reconnect failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

async fn pump(
    socket: &mut Socket,
    tx: &mpsc::Sender<StreamEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Pump {
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_id: u64 = 0;
    let mut ping_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown) => return Pump::Shutdown,
            _ = ping.tick() => {
                ping_id += 1;
                let frame = serde_json::json!({ "id": ping_id, "type": "ping" }).to_string();
                if let Err(error) = socket.send(WsMessage::Text(frame)).await {
                    return Pump::Lost(error.to_string());
                }
                ping_sent = Some(Instant::now());
            }
            frame = socket.next() => {
                let text = match frame {
                    None => return Pump::Lost("stream ended".to_string()),
                    Some(Err(error)) => return Pump::Lost(error.to_string()),
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) => return Pump::Lost("closed by server".to_string()),
                    Some(Ok(_)) => continue,
                };
                let event = match decode_event(&text) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(error) => {
                        tracing::debug!(%error, "undecodable frame");
                        continue;
                    }
                };
                if event == StreamEvent::LatencyReport {
                    if let Some(sent) = ping_sent.take() {
                        tracing::debug!(latency = ?sent.elapsed(), "pong");
                    }
                }
                if tx.send(event).await.is_err() {
                    return Pump::ReceiverGone;
                }
            }
        }
    }
}

async fn close(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        tracing::debug!(%error, "close frame not sent");
        return;
    }
    let drained = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = socket.next().await {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!("server did not confirm close");
    }
}

/// Exponential backoff capped at `BACKOFF_MAX`; `jitter` in `[0, 1)` adds
/// up to half of the delay again.
fn backoff_delay(attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.min(16);
    let base = BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX);
    base + base.mul_f64(jitter.clamp(0.0, 1.0) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(backoff_delay(0, 0.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, 0.0), Duration::from_secs(8));
        assert_eq!(backoff_delay(10, 0.0), BACKOFF_MAX);
        assert_eq!(backoff_delay(u32::MAX, 0.0), BACKOFF_MAX);
    }

    #[test]
    fn jitter_adds_at_most_half() {
        assert_eq!(backoff_delay(2, 1.0), Duration::from_secs(6));
        assert_eq!(backoff_delay(2, 0.5), Duration::from_secs(5));
        assert_eq!(backoff_delay(10, 2.0), BACKOFF_MAX + BACKOFF_MAX / 2);
    }

    #[test]
    fn bad_socket_url_is_rejected() {
        let error = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
            .block_on(open("not a url"));
        assert!(matches!(error, Err(RealtimeError::Url(_))));
    }
}
