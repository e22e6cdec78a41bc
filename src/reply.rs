//! Reply policies applied by the listener to each received message.

use bytes::Bytes;
use clap::ValueEnum;
use serde::Deserialize;
use tracing::info;

/// Acknowledgement sent by `Reply::Acknowledge` unless configured otherwise.
pub const DEFAULT_ACK_TEXT: &str = "Connection successful";

/// Which reply policy to run, as named in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyKind {
    #[default]
    Echo,
    Acknowledge,
}

/// How the listener answers a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send the message straight back.
    Echo,
    /// Log the message as text and answer with a fixed acknowledgement.
    Acknowledge { text: Bytes },
}

impl Reply {
    pub fn new(kind: ReplyKind, ack_text: &str) -> Self {
        match kind {
            ReplyKind::Echo => Reply::Echo,
            ReplyKind::Acknowledge => Reply::Acknowledge {
                text: Bytes::copy_from_slice(ack_text.as_bytes()),
            },
        }
    }

    /// Produce the reply for `message`.
    pub fn respond(&self, message: &Bytes) -> Bytes {
        match self {
            Reply::Echo => message.clone(),
            Reply::Acknowledge { text } => {
                info!(text = %String::from_utf8_lossy(message), "Message received");
                text.clone()
            }
        }
    }
}
