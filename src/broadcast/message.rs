//! JSON messages pushed to subscribers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::DetectionResult;
use crate::utils::epoch_millis;

/// Per-subscriber lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionStatus {
        status: SubscriberState,
        timestamp: u64,
        client_id: Uuid,
    },
    AiDetection {
        data: DetectionResult,
    },
    Ping {
        timestamp: u64,
    },
    Echo {
        message: String,
    },
}

impl ServerMessage {
    pub fn connected(client_id: Uuid) -> Self {
        Self::ConnectionStatus {
            status: SubscriberState::Connected,
            timestamp: epoch_millis(),
            client_id,
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            timestamp: epoch_millis(),
        }
    }

    pub fn echo(message: impl Into<String>) -> Self {
        Self::Echo {
            message: message.into(),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<DetectionResult> for ServerMessage {
    fn from(data: DetectionResult) -> Self {
        Self::AiDetection { data }
    }
}
