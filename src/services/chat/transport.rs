//! Chat Transport
//!
//! Outbound side of the backend connection. The engine only needs to push
//! [`ClientEvent`]s; inbound events are fed to the engine by whoever owns the
//! connection.

use async_trait::async_trait;
use tokio::sync::mpsc;

use agent_chat_core::ClientEvent;

use crate::utils::error::{AppError, AppResult};

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, event: ClientEvent) -> AppResult<()>;
}

/// Transport that forwards events into a channel, e.g. to a socket writer task
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<ClientEvent>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<ClientEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChatTransport for ChannelTransport {
    async fn send(&self, event: ClientEvent) -> AppResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| AppError::transport(format!("outbound channel closed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_forwards() {
        let (tx, mut rx) = mpsc::channel(4);
        let transport = ChannelTransport::new(tx);
        transport
            .send(ClientEvent::GetAgentSessions {
                agent_id: "a1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::GetAgentSessions {
                agent_id: "a1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_closed_channel_is_transport_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let transport = ChannelTransport::new(tx);
        let err = transport.send(ClientEvent::CreateNewSession { agent_id: "a1".to_string() }).await.unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
    }
}
