//! WebSocket client with automatic reconnection

use super::types::{WsConfig, WsError, WsMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

/// Bidirectional WebSocket client
///
/// A background task owns the socket. It reconnects with exponential
/// backoff and emits [`WsMessage::Connected`] after every successful
/// connect so the consumer can resubscribe.
pub struct WsClient {
    config: WsConfig,
}

impl WsClient {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Start the connection task
    ///
    /// Returns (incoming messages, outgoing text sender). The task ends when
    /// `shutdown` is cancelled, the receiver is dropped, or reconnects run out.
    pub fn connect(
        &self,
        shutdown: CancellationToken,
    ) -> (mpsc::Receiver<WsMessage>, mpsc::Sender<String>) {
        let (msg_tx, msg_rx) = mpsc::channel(1024);
        let (send_tx, send_rx) = mpsc::channel(256);
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = Self::run_connection_loop(config, msg_tx, send_rx, shutdown).await {
                tracing::error!(error = %e, "WebSocket connection loop failed");
            }
        });

        (msg_rx, send_tx)
    }

    async fn run_connection_loop(
        config: WsConfig,
        tx: mpsc::Sender<WsMessage>,
        mut send_rx: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) -> Result<(), WsError> {
        let mut reconnect_attempts = 0;
        let mut reconnect_delay = config.initial_reconnect_delay;

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Ok(false),
                r = Self::connect_and_stream(&config, &tx, &mut send_rx) => r,
            };

            match result {
                Ok(false) => {
                    tracing::info!("WebSocket connection closed");
                    let _ = tx.send(WsMessage::Disconnected).await;
                    return Ok(());
                }
                Ok(true) => {
                    // Was connected for a while; start backoff over
                    reconnect_attempts = 0;
                    reconnect_delay = config.initial_reconnect_delay;
                    tracing::warn!("WebSocket closed by server, reconnecting");
                }
                Err(e) => {
                    reconnect_attempts += 1;
                    tracing::warn!(
                        error = %e,
                        attempt = reconnect_attempts,
                        "WebSocket connection error, reconnecting..."
                    );
                    if config.max_reconnect_attempts > 0
                        && reconnect_attempts >= config.max_reconnect_attempts
                    {
                        tracing::error!("Max reconnection attempts reached");
                        let _ = tx.send(WsMessage::Disconnected).await;
                        return Err(WsError::MaxReconnectsExceeded);
                    }
                }
            }

            if tx.is_closed() {
                tracing::info!("Receiver dropped, stopping reconnection");
                return Ok(());
            }
            let _ = tx
                .send(WsMessage::Reconnecting {
                    attempt: reconnect_attempts,
                })
                .await;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = tx.send(WsMessage::Disconnected).await;
                    return Ok(());
                }
                _ = sleep(reconnect_delay) => {}
            }
            reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
        }
    }

    /// Run one connection
    ///
    /// Ok(true) means the server closed an established link and a reconnect
    /// is wanted; Ok(false) means the consumer went away.
    async fn connect_and_stream(
        config: &WsConfig,
        tx: &mpsc::Sender<WsMessage>,
        send_rx: &mut mpsc::Receiver<String>,
    ) -> Result<bool, WsError> {
        tracing::info!(url = %config.url, "Connecting to WebSocket");

        let (ws_stream, _response) = connect_async(config.url.as_str())
            .await
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        tracing::info!("WebSocket connected");
        if tx.send(WsMessage::Connected).await.is_err() {
            return Ok(false);
        }

        let mut ping_interval = tokio::time::interval(config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_interval.tick().await;
        let mut waiting_for_pong = false;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if tx.send(WsMessage::Text(text)).await.is_err() {
                                tracing::debug!("Receiver dropped, closing connection");
                                return Ok(false);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await
                                .map_err(|e| WsError::SendFailed(e.to_string()))?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            waiting_for_pong = false;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Received close frame");
                            return Ok(true);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(WsError::ConnectionFailed(e.to_string()));
                        }
                        None => {
                            return Err(WsError::ConnectionFailed("Stream ended unexpectedly".into()));
                        }
                    }
                }

                outgoing = send_rx.recv() => {
                    match outgoing {
                        Some(text) => {
                            write.send(Message::Text(text)).await
                                .map_err(|e| WsError::SendFailed(e.to_string()))?;
                        }
                        None => return Ok(false),
                    }
                }

                _ = ping_interval.tick() => {
                    if waiting_for_pong {
                        return Err(WsError::ConnectionFailed("Pong timeout".into()));
                    }
                    write.send(Message::Ping(Vec::new())).await
                        .map_err(|e| WsError::SendFailed(e.to_string()))?;
                    waiting_for_pong = true;
                }
            }
        }
    }
}
