//! WebSocket transport for the client.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rdao_core::{Connector, Link, TransportError};
use rdao_settings::ServerSettings;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Connects to a reactive-dao server over `ws://`.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Connector for a full `ws://host:port/path` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connector for the server described by `settings`.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(format!(
            "ws://{}:{}{}",
            settings.host, settings.port, settings.path
        ))
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, "websocket connected");

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (ours, theirs) = Link::pair();
        let Link {
            sender: inbound,
            receiver: mut outbound,
        } = theirs;

        drop(tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        }));

        drop(tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(len = data.len(), "dropping non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(error) => {
                        debug!(%error, "websocket read failed");
                        break;
                    }
                };
                if inbound.send(text).is_err() {
                    break;
                }
            }
        }));

        Ok(ours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_from_settings() {
        let connector = WsConnector::from_settings(&ServerSettings {
            port: 9000,
            ..ServerSettings::default()
        });
        assert_eq!(connector.url(), "ws://127.0.0.1:9000/reactive-dao");
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = WsConnector::new(format!("ws://{addr}/reactive-dao")).connect().await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
