//! WebSocket push subscription with reconnect backoff.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::HeaderMap;
use tessera_core::{ConfigError, FetchError, ReconnectConfig, TesseraConfig};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::http::build_auth_headers;
use crate::invalidation::InvalidationChannel;
use crate::transport::{PushConnection, PushConnector, PushMessage};

/// Connects to the configured WebSocket endpoint with the auth headers.
#[derive(Clone)]
pub struct WsConnector {
    endpoint: String,
    auth: HeaderMap,
}

impl std::fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnector")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl WsConnector {
    pub fn new(config: &TesseraConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: config.ws_endpoint.clone(),
            auth: build_auth_headers(&config.auth)?,
        })
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn PushConnection>, FetchError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| FetchError::network(e.to_string()))?;
        let headers = request.headers_mut();
        for (name, value) in self.auth.iter() {
            headers.insert(name.clone(), value.clone());
        }
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| FetchError::network(e.to_string()))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, message: &PushMessage) -> Result<(), FetchError> {
        let text = serde_json::to_string(message).map_err(|e| FetchError::Decode {
            reason: e.to_string(),
        })?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FetchError::network(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, FetchError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(FetchError::network(e.to_string()))),
            }
        }
    }
}

/// Drive the push subscription until the outbound side is dropped.
///
/// Each connect sends SUBSCRIBE once for every registered entity type and
/// then invalidates what may have changed before the subscription was live.
pub fn spawn_push_task(
    connector: Arc<dyn PushConnector>,
    channel: Arc<InvalidationChannel>,
    outbound: mpsc::UnboundedReceiver<PushMessage>,
    reconnect: ReconnectConfig,
) -> JoinHandle<()> {
    tokio::spawn(run_push_loop(connector, channel, outbound, reconnect))
}

async fn run_push_loop(
    connector: Arc<dyn PushConnector>,
    channel: Arc<InvalidationChannel>,
    mut outbound: mpsc::UnboundedReceiver<PushMessage>,
    reconnect: ReconnectConfig,
) {
    let mut backoff = reconnect.initial_ms;
    loop {
        match connector.connect().await {
            Ok(mut connection) => {
                info!("push subscription connected");
                backoff = reconnect.initial_ms;
                match pump(connection.as_mut(), &channel, &mut outbound).await {
                    PumpExit::OutboundClosed => {
                        debug!("push outbound closed, stopping");
                        return;
                    }
                    PumpExit::Disconnected(reason) => {
                        warn!(reason = %reason, "push subscription lost");
                    }
                }
            }
            Err(error) => {
                warn!(error = %error, backoff_ms = backoff, "push connect failed");
            }
        }

        let delay = jittered_backoff(backoff, reconnect.jitter_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        backoff = next_backoff(backoff, &reconnect);
    }
}

enum PumpExit {
    OutboundClosed,
    Disconnected(String),
}

async fn pump(
    connection: &mut dyn PushConnection,
    channel: &InvalidationChannel,
    outbound: &mut mpsc::UnboundedReceiver<PushMessage>,
) -> PumpExit {
    let mut subscribed = BTreeSet::new();
    for entity_type in channel.interests() {
        if let Err(e) = connection.send(&PushMessage::subscribe(entity_type.clone())).await {
            return PumpExit::Disconnected(e.to_string());
        }
        subscribed.insert(entity_type);
    }
    channel.handle_connect().await;

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    // Queued before this connection and already covered above.
                    if let PushMessage::Subscribe(payload) = &message {
                        if !subscribed.insert(payload.entity_type.clone()) {
                            continue;
                        }
                    }
                    if let Err(e) = connection.send(&message).await {
                        return PumpExit::Disconnected(e.to_string());
                    }
                }
                None => return PumpExit::OutboundClosed,
            },
            incoming = connection.next_text() => match incoming {
                Some(Ok(text)) => {
                    channel.handle_message(&text).await;
                }
                Some(Err(e)) => return PumpExit::Disconnected(e.to_string()),
                None => return PumpExit::Disconnected("connection closed".to_string()),
            },
        }
    }
}

fn next_backoff(current_ms: u64, reconnect: &ReconnectConfig) -> u64 {
    let next = (current_ms as f64 * reconnect.multiplier) as u64;
    next.min(reconnect.max_ms)
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base_ms.saturating_add(nanos % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter_ms: 50,
        }
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let config = reconnect();
        let mut backoff = config.initial_ms;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff);
            backoff = next_backoff(backoff, &config);
        }
        assert_eq!(seen, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_in_window() {
        for _ in 0..100 {
            let delay = jittered_backoff(100, 50);
            assert!((100..150).contains(&delay));
        }
        assert_eq!(jittered_backoff(100, 0), 100);
    }

    #[test]
    fn test_connector_from_config() {
        let mut config = TesseraConfig::local("http://localhost/api", "ws://localhost/ws");
        config.auth.jwt = Some("token".into());
        let connector = WsConnector::new(&config).unwrap();
        assert_eq!(connector.auth["authorization"], "Bearer token");
        assert_eq!(connector.endpoint, "ws://localhost/ws");
    }
}
