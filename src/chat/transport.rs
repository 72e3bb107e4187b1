// Transport seam: anything that can open a framed, bidirectional text
// session. Production uses a WebSocket; tests substitute an in-memory pair.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::connection::ConnectionError;

/// One open session. Outbound frames go through `outbound`; the session is
/// considered dropped when `inbound` yields `None`.
pub struct TransportSession {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportSession, ConnectionError>;
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<TransportSession, ConnectionError> {
        info!("Opening WebSocket connection to {}", url);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(100);
        let (in_tx, in_rx) = mpsc::channel::<String>(100);

        // Write half: drains the outbound queue into the socket. Ends when
        // the sender side is dropped (explicit disconnect) or a send fails.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("WebSocket send failed: {}", e);
                    break;
                }
            }
            if let Err(e) = write.close().await {
                debug!("WebSocket close: {}", e);
            }
        });

        // Read half: forwards text frames inward. Dropping in_tx on exit is
        // what signals the disconnect to the connection manager.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        info!("Server closed the connection");
                        break;
                    }
                    Ok(_) => {} // ping/pong/binary: nothing to forward
                    Err(e) => {
                        error!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(TransportSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
