use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::state::ClientState;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Doubling reconnect delay, capped, reset once a connection is established.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (delay * 2).min(BACKOFF_CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum RealtimeError {
    Ws(tokio_tungstenite::tungstenite::Error),
    Http(reqwest::Error),
    Auth(reqwest::StatusCode),
    Protocol(String),
    Closed,
}

impl fmt::Display for RealtimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ws(err) => write!(f, "websocket error: {err}"),
            Self::Http(err) => write!(f, "channel auth request failed: {err}"),
            Self::Auth(status) => write!(f, "channel auth rejected: {status}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Closed => write!(f, "connection closed by server"),
        }
    }
}

impl std::error::Error for RealtimeError {}

/// Incoming frame shape shared by all protocol and application events.
#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EstablishedData {
    socket_id: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: String,
}

pub fn websocket_url(config: &Config) -> String {
    let scheme = if config.server.scheme == "https" {
        "wss"
    } else {
        "ws"
    };
    format!(
        "{scheme}://{}:{}/app/{}?protocol=7&client=shuffler-client&version={}",
        config.server.host,
        config.realtime.port,
        config.realtime.app_key,
        env!("CARGO_PKG_VERSION"),
    )
}

fn subscribe_frame(channel: &str, auth: &str) -> String {
    json!({
        "event": "pusher:subscribe",
        "data": { "channel": channel, "auth": auth },
    })
    .to_string()
}

/// Some protocol frames carry their data pre-encoded as a JSON string; accept
/// both that and a plain object.
fn frame_data(data: Option<Value>) -> Result<Value, RealtimeError> {
    match data {
        Some(Value::String(inner)) => serde_json::from_str(&inner)
            .map_err(|err| RealtimeError::Protocol(format!("bad frame data: {err}"))),
        Some(other) => Ok(other),
        None => Err(RealtimeError::Protocol("frame without data".to_string())),
    }
}

/// Maintains the server's realtime channel subscription: connects, authorizes
/// the private player and session channels, and feeds `"command"` events to
/// the dispatcher in arrival order. Reconnects forever with backoff until
/// shutdown.
pub struct RealtimeClient {
    ws_url: String,
    auth_url: String,
    bearer: String,
    channels: [String; 2],
    http: reqwest::Client,
    state: Arc<ClientState>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
}

impl RealtimeClient {
    pub fn new(
        config: &Config,
        state: Arc<ClientState>,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ws_url: websocket_url(config),
            auth_url: format!("{}/broadcasting/auth", config.server_url()),
            bearer: config.realtime.bearer_token.clone(),
            channels: [
                format!("private-player.{}", config.player.name),
                format!("private-session.{}", config.player.session),
            ],
            http: reqwest::Client::new(),
            state,
            dispatcher,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            match self.connect_and_listen(&mut backoff).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "realtime connection lost");
                    self.state.set_connected(false);
                }
            }

            let delay = backoff.next();
            tracing::info!(delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one connection to completion. `Ok` means shutdown was requested;
    /// any drop or protocol failure surfaces as an error so the reconnect
    /// loop takes over.
    async fn connect_and_listen(&mut self, backoff: &mut Backoff) -> Result<(), RealtimeError> {
        let (mut stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(RealtimeError::Ws)?;

        let socket_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_established(&mut stream))
            .await
            .map_err(|_| RealtimeError::Protocol("handshake timed out".to_string()))??;
        tracing::debug!(%socket_id, "realtime connection established");

        for channel in &self.channels {
            let auth = self.authorize(&socket_id, channel).await?;
            stream
                .send(Message::Text(subscribe_frame(channel, &auth)))
                .await
                .map_err(RealtimeError::Ws)?;
        }
        tracing::info!(channels = ?self.channels, "subscribed");
        backoff.reset();

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = stream.close(None).await;
                        return Ok(());
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&mut stream, &text).await?,
                    Some(Ok(Message::Ping(payload))) => {
                        stream
                            .send(Message::Pong(payload))
                            .await
                            .map_err(RealtimeError::Ws)?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(RealtimeError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(RealtimeError::Ws(err)),
                },
            }
        }
    }

    async fn handle_frame(&self, stream: &mut WsStream, text: &str) -> Result<(), RealtimeError> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable frame dropped");
                return Ok(());
            }
        };

        match frame.event.as_str() {
            "pusher:ping" => {
                stream
                    .send(Message::Text(
                        json!({ "event": "pusher:pong", "data": {} }).to_string(),
                    ))
                    .await
                    .map_err(RealtimeError::Ws)?;
            }
            "pusher_internal:subscription_succeeded" => {
                tracing::debug!("channel subscription confirmed");
            }
            "pusher:error" => {
                let detail = frame.data.unwrap_or(Value::Null);
                return Err(RealtimeError::Protocol(format!("server error: {detail}")));
            }
            "command" => {
                let Some(raw) = frame.data else {
                    tracing::warn!("command event without data");
                    return Ok(());
                };
                // Dispatch inline so events on a channel apply in order.
                self.dispatcher.handle_raw(&raw).await;
            }
            other => tracing::debug!(event = other, "frame ignored"),
        }
        Ok(())
    }

    /// Exchanges the socket id and channel name for a subscription signature.
    pub(crate) async fn authorize(
        &self,
        socket_id: &str,
        channel: &str,
    ) -> Result<String, RealtimeError> {
        let resp = self
            .http
            .post(&self.auth_url)
            .bearer_auth(&self.bearer)
            .json(&json!({ "socket_id": socket_id, "channel_name": channel }))
            .send()
            .await
            .map_err(RealtimeError::Http)?;

        if !resp.status().is_success() {
            return Err(RealtimeError::Auth(resp.status()));
        }
        let body: AuthResponse = resp.json().await.map_err(RealtimeError::Http)?;
        Ok(body.auth)
    }
}

async fn await_established(stream: &mut WsStream) -> Result<String, RealtimeError> {
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(RealtimeError::Ws)?;
        let Message::Text(text) = msg else { continue };
        let frame: Frame = serde_json::from_str(&text)
            .map_err(|err| RealtimeError::Protocol(format!("bad handshake frame: {err}")))?;
        if frame.event != "pusher:connection_established" {
            continue;
        }
        let data = frame_data(frame.data)?;
        let established: EstablishedData = serde_json::from_value(data)
            .map_err(|err| RealtimeError::Protocol(format!("bad handshake data: {err}")))?;
        return Ok(established.socket_id);
    }
    Err(RealtimeError::Closed)
}
