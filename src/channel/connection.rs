//! Background WebSocket task: connect, read, reconnect.
//!
//! The task holds only a `Weak` reference to its [`EventChannel`], so dropping
//! the last channel handle ends it at the next frame or retry.

use super::{ChannelError, ConnectionState, EventChannel};
use futures_util::{SinkExt, StreamExt};
use std::sync::Weak;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ReadEnd {
    Shutdown,
    Closed,
    ChannelDropped,
}

impl ChannelError {
    /// Errors no amount of retrying will fix.
    fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidUrl { .. } | Self::InvalidHeader(_))
    }
}

async fn connect_once(
    url: &str,
    token: Option<&str>,
    timeout: Duration,
) -> Result<WsStream, ChannelError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ChannelError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ChannelError::InvalidHeader(e.to_string()))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| ChannelError::Timeout(timeout.as_secs()))??;
    Ok(stream)
}

/// Sleep unless shutdown fires first. Returns `false` on shutdown.
async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

pub(super) async fn run(channel: Weak<EventChannel>, shutdown: CancellationToken) {
    let mut failures: u32 = 0;
    let mut ever_connected = false;

    loop {
        let Some(ch) = channel.upgrade() else {
            return;
        };
        let url = ch.url().to_string();
        let token = ch.current_token();
        let policy = ch.config().reconnect.clone();
        let connect_timeout = Duration::from_secs(ch.config().connect_timeout_secs.max(1));
        ch.set_state(if failures == 0 && !ever_connected {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting {
                attempt: failures + 1,
            }
        });
        drop(ch);

        let attempt = tokio::select! {
            () = shutdown.cancelled() => break,
            result = connect_once(&url, token.as_deref(), connect_timeout) => result,
        };

        match attempt {
            Ok(stream) => {
                failures = 0;
                ever_connected = true;
                match channel.upgrade() {
                    Some(ch) => ch.set_state(ConnectionState::Connected),
                    None => return,
                }
                tracing::info!(url = %url, "Event channel connected");

                match read_loop(&channel, stream, &shutdown).await {
                    ReadEnd::Shutdown => break,
                    ReadEnd::ChannelDropped => return,
                    ReadEnd::Closed => {
                        tracing::warn!(url = %url, "Event channel connection lost, reconnecting");
                        if !pause(policy.delay_for(1), &shutdown).await {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(url = %url, attempt = failures, error = %e, "Event channel connect failed");

                if e.is_fatal() || !policy.should_retry(failures) {
                    tracing::error!(
                        url = %url,
                        attempts = failures,
                        "Giving up on event channel"
                    );
                    if let Some(ch) = channel.upgrade() {
                        ch.set_state(ConnectionState::GaveUp);
                    }
                    return;
                }
                if !pause(policy.delay_for(failures), &shutdown).await {
                    break;
                }
            }
        }
    }

    if let Some(ch) = channel.upgrade() {
        ch.set_state(ConnectionState::Disconnected);
    }
}

async fn read_loop(
    channel: &Weak<EventChannel>,
    stream: WsStream,
    shutdown: &CancellationToken,
) -> ReadEnd {
    let (mut sink, mut source) = stream.split();

    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return ReadEnd::Shutdown;
            }
            msg = source.next() => msg,
        };

        let delivered = match msg {
            Some(Ok(WsMessage::Text(text))) => deliver(channel, &text),
            // Some emitters send JSON in binary frames.
            Some(Ok(WsMessage::Binary(data))) if matches!(data.first(), Some(b'{' | b'[')) => {
                match std::str::from_utf8(&data) {
                    Ok(text) => deliver(channel, text),
                    Err(_) => true,
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                tracing::info!(frame = ?frame, "Event channel closed by server");
                return ReadEnd::Closed;
            }
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Event channel read error");
                return ReadEnd::Closed;
            }
            None => return ReadEnd::Closed,
        };

        if !delivered {
            let _ = sink.send(WsMessage::Close(None)).await;
            return ReadEnd::ChannelDropped;
        }
    }
}

/// Returns `false` once the channel itself is gone.
fn deliver(channel: &Weak<EventChannel>, frame: &str) -> bool {
    match channel.upgrade() {
        Some(ch) => {
            ch.dispatch_frame(frame);
            true
        }
        None => false,
    }
}
