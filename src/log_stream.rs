//! Client for the authenticated websocket log feed.
//!
//! [`fetch_token`] trades admin credentials for a bearer token once at
//! startup. [`run_log_stream`] then connects, feeds every line to the
//! [`Ingestor`], and reconnects after a fixed delay whenever the connection
//! drops, forever, until cancelled.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ingest::{Ingestor, StreamEnd};
use crate::metrics::STREAM_CONNECTED;

const GREETING: &str = "Hello, Server!";

/// Lines read from the feed, in arrival order.
pub type LineStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ssl: bool,
    // Seconds, passed through to the log endpoint
    pub log_interval: u64,
    pub reconnect_delay: Duration,
}

impl StreamConfig {
    pub fn token_url(&self) -> String {
        format!("http://{}:{}/api/admin/token", self.address, self.port)
    }

    pub fn stream_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!(
            "{}://{}:{}/api/core/logs?interval={}",
            scheme, self.address, self.port, self.log_interval
        )
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Password-grant login against the log server.
pub async fn fetch_token(client: &reqwest::Client, config: &StreamConfig) -> Result<String> {
    let form = [
        ("grant_type", "password"),
        ("username", config.username.as_str()),
        ("password", config.password.as_str()),
        ("scope", ""),
        ("client_id", ""),
        ("client_secret", ""),
    ];

    let res = client.post(config.token_url()).form(&form).send().await?;
    if !res.status().is_success() {
        return Err(Error::Auth(format!("token endpoint returned {}", res.status())));
    }

    let body: TokenResponse = res.json().await?;
    Ok(body.access_token)
}

// A frame can carry several newline-separated lines
fn frame_lines(text: &str) -> Vec<Result<String>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(line.to_string()))
        .collect()
}

/// Open the websocket, send the greeting and return its text lines.
pub async fn connect(config: &StreamConfig, token: &str) -> Result<LineStream> {
    let mut request = config.stream_url().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| Error::Url(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (mut ws, _) = connect_async(request).await?;
    ws.send(Message::Text(GREETING.into())).await?;

    let lines = ws
        .map(|msg| match msg {
            Ok(Message::Text(text)) => frame_lines(text.as_str()),
            Ok(Message::Binary(data)) => frame_lines(&String::from_utf8_lossy(&data)),
            // Control frames; the stream ends on its own after a close
            Ok(_) => Vec::new(),
            Err(e) => vec![Err(e.into())],
        })
        .flat_map(stream::iter)
        .boxed();
    Ok(lines)
}

/// Connect, ingest until the connection ends, wait `delay`, repeat.
///
/// Connection errors are retried the same way as clean closes; there is no
/// retry limit and no backoff.
pub async fn run_with_reconnect<F, Fut>(
    mut open: F,
    ingestor: &Ingestor,
    delay: Duration,
    cancel: &CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<LineStream>>,
{
    loop {
        let opened = tokio::select! {
            opened = open() => opened,
            _ = cancel.cancelled() => break,
        };

        match opened {
            Ok(lines) => {
                info!("Log stream connected");
                STREAM_CONNECTED.set(1.0);
                let end = ingestor.run(lines, cancel).await;
                STREAM_CONNECTED.set(0.0);
                match end {
                    StreamEnd::Cancelled => break,
                    StreamEnd::Closed => warn!("Log stream closed by server"),
                    StreamEnd::Failed(e) => warn!(error = %e, "Error reading log stream"),
                }
            }
            Err(e) => warn!(error = %e, "Log stream connection error"),
        }

        info!(delay = ?delay, "Reconnecting to log stream");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("Log stream stopped");
}

pub async fn run_log_stream(
    config: StreamConfig,
    token: String,
    ingestor: Ingestor,
    cancel: CancellationToken,
) {
    info!(url = %config.stream_url(), "Starting log stream");
    run_with_reconnect(
        || connect(&config, &token),
        &ingestor,
        config.reconnect_delay,
        &cancel,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use crate::store::kv::{KvSessionStore, MemoryKv};
    use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn config(port: u16) -> StreamConfig {
        StreamConfig {
            address: "127.0.0.1".into(),
            port,
            username: "admin".into(),
            password: "secret".into(),
            ssl: false,
            log_interval: 5,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    fn memory_ingestor() -> (Ingestor, Arc<dyn SessionStore>) {
        let sessions: Arc<dyn SessionStore> =
            Arc::new(KvSessionStore::new(Arc::new(MemoryKv::new())));
        (Ingestor::new(sessions.clone(), 2), sessions)
    }

    #[test]
    fn test_urls() {
        let mut cfg = config(8000);
        assert_eq!(cfg.token_url(), "http://127.0.0.1:8000/api/admin/token");
        assert_eq!(cfg.stream_url(), "ws://127.0.0.1:8000/api/core/logs?interval=5");
        cfg.ssl = true;
        assert!(cfg.stream_url().starts_with("wss://"));
    }

    #[test]
    fn test_frame_lines_splits_and_skips_blank() {
        let lines: Vec<String> = frame_lines("a\r\n\nb\n")
            .into_iter()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fetch_token_posts_password_grant() {
        let app = Router::new().route(
            "/api/admin/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                if form.get("grant_type").map(String::as_str) == Some("password")
                    && form.get("username").map(String::as_str) == Some("admin")
                    && form.get("password").map(String::as_str) == Some("secret")
                {
                    Ok(Json(serde_json::json!({"access_token": "tok-123"})))
                } else {
                    Err(StatusCode::UNAUTHORIZED)
                }
            }),
        );
        let port = serve(app).await;
        let client = reqwest::Client::new();

        assert_eq!(fetch_token(&client, &config(port)).await.unwrap(), "tok-123");

        let mut wrong = config(port);
        wrong.password = "nope".into();
        assert!(matches!(
            fetch_token(&client, &wrong).await,
            Err(Error::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_reads_lines_with_bearer_token() {
        let app = Router::new().route(
            "/api/core/logs",
            get(|headers: HeaderMap, ws: WebSocketUpgrade| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer tok-123");
                ws.on_upgrade(move |mut socket| async move {
                    // Greeting arrives first
                    if let Some(Ok(WsMessage::Text(hello))) = socket.recv().await {
                        assert_eq!(hello.as_str(), GREETING);
                    }
                    if authorized {
                        let _ = socket
                            .send(WsMessage::Text(
                                "1.1.1.1 ok email: a@b.com\n2.2.2.2 ok email: a@b.com".into(),
                            ))
                            .await;
                    }
                    let _ = socket.send(WsMessage::Close(None)).await;
                })
            }),
        );
        let port = serve(app).await;

        let lines: Vec<String> = connect(&config(port), "tok-123")
            .await
            .unwrap()
            .filter_map(|l| async move { l.ok() })
            .collect()
            .await;
        assert_eq!(
            lines,
            vec!["1.1.1.1 ok email: a@b.com", "2.2.2.2 ok email: a@b.com"]
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_errors_and_closes() {
        let (ingestor, sessions) = memory_ingestor();
        let cancel = CancellationToken::new();
        let attempts = AtomicUsize::new(0);

        run_with_reconnect(
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let cancel = cancel.clone();
                async move {
                    match attempt {
                        0 => Err(Error::Url("refused".into())),
                        1 => Ok(stream::iter(vec![Ok("1.1.1.1 email: a@b.com".to_string())]).boxed()),
                        2 => Ok(stream::iter(vec![Ok("2.2.2.2 email: a@b.com".to_string())]).boxed()),
                        _ => {
                            cancel.cancel();
                            Ok(stream::pending().boxed())
                        }
                    }
                }
            },
            &ingestor,
            Duration::from_millis(5),
            &cancel,
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let user = sessions.get("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.active_ips, vec!["2.2.2.2", "1.1.1.1"]);
    }
}
