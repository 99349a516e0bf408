use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Events pushed to realtime subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the socket is authenticated
    Ready { user_id: String },

    /// A message was appended to a conversation. `prev_seq` is the sequence
    /// of the message before it in the same conversation, 0 for the first.
    MessageCreate { message: Message, prev_seq: i64 },

    /// A participant read the other side's messages
    MessagesRead {
        conversation_id: String,
        reader_id: String,
    },

    /// The user's notification list changed; clients refetch
    NotificationsChanged { user_id: String, unread: i64 },

    /// A subscribe command was refused
    SubscribeDenied {
        conversation_id: String,
        reason: String,
    },
}

impl GatewayEvent {
    /// Returns the conversation this event belongs to, if it is conversation-scoped.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::MessageCreate { message, .. } => Some(&message.conversation_id),
            Self::MessagesRead {
                conversation_id, ..
            } => Some(conversation_id),
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving live messages for one conversation
    Subscribe { conversation_id: String },

    /// Stop receiving a conversation; nothing more is sent for it afterwards
    Unsubscribe { conversation_id: String },

    /// Start receiving notification changes for the authenticated user
    SubscribeNotifications,

    UnsubscribeNotifications,
}
