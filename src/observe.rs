use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backend::{SessionStatus, SessionStore, TryOnSession};
use crate::config::{BackendConfig, ObserveConfig, ObserveStrategy};
use crate::error::SessionError;

pub type UpdateFn<'a> = dyn FnMut(&TryOnSession) + Send + 'a;

/// Watches a try-on session until the backend finishes it.
///
/// Implementations report each status change and return the terminal record.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// Follow `session_id` until it reaches a terminal status.
    async fn observe(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        on_update: &mut UpdateFn<'_>,
    ) -> Result<TryOnSession, SessionError>;
}

async fn bounded<F>(
    max_wait: Option<Duration>,
    cancel: &CancellationToken,
    work: F,
) -> Result<TryOnSession, SessionError>
where
    F: Future<Output = Result<TryOnSession, SessionError>>,
{
    let limited = async {
        match max_wait {
            Some(limit) => timeout(limit, work)
                .await
                .map_err(|_| SessionError::Timeout(limit))?,
            None => work.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            log::info!("Session observation cancelled");
            Err(SessionError::Cancelled)
        }
        result = limited => result,
    }
}

/// Forwards a record to the callback only when its status moved.
struct StatusTracker {
    last: Option<SessionStatus>,
}

impl StatusTracker {
    fn new() -> Self {
        Self { last: None }
    }

    fn report(&mut self, session: &TryOnSession, on_update: &mut UpdateFn<'_>) {
        if self.last != Some(session.status) {
            log::info!("Session {} is {:?}", session.id, session.status);
            self.last = Some(session.status);
            on_update(session);
        }
    }
}

pub struct PollingObserver {
    store: Arc<dyn SessionStore>,
    interval: Duration,
    max_wait: Option<Duration>,
}

impl PollingObserver {
    pub fn new(store: Arc<dyn SessionStore>, interval: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            store,
            interval,
            max_wait,
        }
    }

    pub fn from_config(store: Arc<dyn SessionStore>, config: &ObserveConfig) -> Self {
        Self::new(store, config.poll_interval(), config.max_wait())
    }
}

#[async_trait]
impl SessionObserver for PollingObserver {
    async fn observe(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        on_update: &mut UpdateFn<'_>,
    ) -> Result<TryOnSession, SessionError> {
        let work = async {
            let mut tracker = StatusTracker::new();
            loop {
                sleep(self.interval).await;
                let session = match self.store.fetch(session_id).await {
                    Ok(session) => session,
                    Err(SessionError::Http(e)) => {
                        log::warn!("Polling session {} failed, will retry: {}", session_id, e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                tracker.report(&session, &mut *on_update);
                if session.status.is_terminal() {
                    return Ok(session);
                }
            }
        };
        bounded(self.max_wait, cancel, work).await
    }
}

/// Source of pushed row changes for one session.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<TryOnSession>, SessionError>;
}

pub struct PushObserver<F: ChangeFeed> {
    feed: F,
    store: Arc<dyn SessionStore>,
    max_wait: Option<Duration>,
}

impl<F: ChangeFeed> PushObserver<F> {
    pub fn new(feed: F, store: Arc<dyn SessionStore>, max_wait: Option<Duration>) -> Self {
        Self {
            feed,
            store,
            max_wait,
        }
    }
}

#[async_trait]
impl<F: ChangeFeed> SessionObserver for PushObserver<F> {
    async fn observe(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        on_update: &mut UpdateFn<'_>,
    ) -> Result<TryOnSession, SessionError> {
        let work = async {
            let mut tracker = StatusTracker::new();
            let mut changes = self.feed.subscribe(session_id).await?;

            // Catch a transition that landed before the subscription did
            let current = self.store.fetch(session_id).await?;
            tracker.report(&current, &mut *on_update);
            if current.status.is_terminal() {
                return Ok(current);
            }

            while let Some(session) = changes.recv().await {
                if session.id != session_id {
                    continue;
                }
                tracker.report(&session, &mut *on_update);
                if session.status.is_terminal() {
                    return Ok(session);
                }
            }
            Err(SessionError::Feed("change feed closed".to_string()))
        };
        bounded(self.max_wait, cancel, work).await
    }
}

/// Row changes pushed over the Supabase realtime websocket.
pub struct RealtimeFeed {
    base_url: String,
    api_key: String,
    table: String,
    heartbeat: Duration,
}

impl RealtimeFeed {
    pub fn new(backend: &BackendConfig, observe: &ObserveConfig, api_key: String) -> Self {
        Self {
            base_url: backend.url.clone(),
            api_key,
            table: backend.sessions_table.clone(),
            heartbeat: observe.heartbeat(),
        }
    }

    pub fn socket_url(&self) -> Result<Url, SessionError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SessionError::Feed(format!("invalid backend url: {}", e)))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SessionError::Feed(format!("cannot use {} for websockets", self.base_url)))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub fn join_message(&self, session_id: &str) -> Value {
        json!({
            "topic": format!("realtime:tryon-session-{}", session_id),
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "UPDATE",
                        "schema": "public",
                        "table": self.table,
                        "filter": format!("id=eq.{}", session_id),
                    }],
                },
                "access_token": self.api_key,
            },
            "ref": "1",
        })
    }

    pub fn heartbeat_message(reference: u64) -> Value {
        json!({
            "topic": "phoenix",
            "event": "heartbeat",
            "payload": {},
            "ref": reference.to_string(),
        })
    }

    /// Extract the updated row from a channel message, if it carries one.
    pub fn parse_change(text: &str) -> Option<TryOnSession> {
        let message: Value = serde_json::from_str(text).ok()?;
        let record = match message.get("event")?.as_str()? {
            "postgres_changes" => message.pointer("/payload/data/record")?,
            "UPDATE" | "INSERT" => message.pointer("/payload/record")?,
            "phx_reply" => {
                if message.pointer("/payload/status").and_then(Value::as_str) == Some("error") {
                    log::warn!("Realtime channel reported an error: {}", message["payload"]);
                }
                return None;
            }
            _ => return None,
        };
        match serde_json::from_value(record.clone()) {
            Ok(session) => Some(session),
            Err(e) => {
                log::warn!("Ignoring malformed change payload: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<TryOnSession>, SessionError> {
        let url = self.socket_url()?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Feed(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        write
            .send(Message::Text(self.join_message(session_id).to_string().into()))
            .await
            .map_err(|e| SessionError::Feed(e.to_string()))?;
        log::info!("Subscribed to changes for session {}", session_id);

        let (tx, rx) = mpsc::channel(16);
        let period = self.heartbeat;
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(period);
            heartbeat.tick().await;
            let mut reference = 1u64;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = heartbeat.tick() => {
                        reference += 1;
                        let beat = RealtimeFeed::heartbeat_message(reference).to_string();
                        if let Err(e) = write.send(Message::Text(beat.into())).await {
                            log::warn!("Realtime heartbeat failed: {}", e);
                            break;
                        }
                    }
                    message = read.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(session) = RealtimeFeed::parse_change(text.as_str()) {
                                if tx.send(session).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Realtime socket closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("Realtime socket error: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        Ok(rx)
    }
}

/// Observer for the configured strategy.
pub fn observer_for(
    config: &ObserveConfig,
    backend: &BackendConfig,
    store: Arc<dyn SessionStore>,
    api_key: String,
) -> Box<dyn SessionObserver> {
    match config.strategy {
        ObserveStrategy::Poll => Box::new(PollingObserver::from_config(store, config)),
        ObserveStrategy::Push => Box::new(PushObserver::new(
            RealtimeFeed::new(backend, config, api_key),
            store,
            config.max_wait(),
        )),
    }
}
