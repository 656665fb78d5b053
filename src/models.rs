//! Domain events decoded from message batches.
//!
//! The server identifies the logged-in user as `"0"` inside push payloads.
//! Constructing a [`Message`] or [`Undo`] rewrites those placeholders to the
//! real session uid and records whether the item originated from us.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Placeholder uid the server uses for the session's own account.
const SELF_UID: &str = "0";

/// Conversation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    /// One-to-one conversation.
    User,
    /// Group conversation.
    Group,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Integer field the server may send as a number, a numeric string, or null.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    })
}

/// Raw message item as carried in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    /// Server message id.
    #[serde(default, deserialize_with = "lenient_string")]
    pub msg_id: String,
    /// Client-assigned message id.
    #[serde(default, deserialize_with = "lenient_string")]
    pub cli_msg_id: String,
    /// Message kind, e.g. `webchat` or `chat.photo`.
    #[serde(default, deserialize_with = "lenient_string")]
    pub msg_type: String,
    /// Sender uid.
    #[serde(default, deserialize_with = "lenient_string")]
    pub uid_from: String,
    /// Recipient uid or group id.
    #[serde(default, deserialize_with = "lenient_string")]
    pub id_to: String,
    /// Sender display name.
    #[serde(default, deserialize_with = "lenient_string")]
    pub d_name: String,
    /// Server timestamp in milliseconds.
    #[serde(default, deserialize_with = "lenient_string")]
    pub ts: String,
    /// Text body or structured attachment.
    #[serde(default)]
    pub content: Value,
    /// Self-destruct timer in milliseconds.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub ttl: i64,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Recall details of an [`Undo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoContent {
    /// Server id of the recalled message.
    #[serde(default, deserialize_with = "lenient_string")]
    pub global_msg_id: String,
    /// Client id of the recalled message.
    #[serde(default, deserialize_with = "lenient_string")]
    pub cli_msg_id: String,
    /// Discriminant marking this item as a recall.
    #[serde(default, deserialize_with = "lenient_string")]
    pub delete_msg: String,
    /// Sender of the recalled message.
    #[serde(default, deserialize_with = "lenient_string")]
    pub src_id: String,
    /// Conversation of the recalled message.
    #[serde(default, deserialize_with = "lenient_string")]
    pub dest_id: String,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Conversation the message belongs to.
    pub thread_id: String,
    /// Conversation kind.
    pub thread_type: ThreadType,
    /// True when sent by the session's own account.
    pub is_self: bool,
    /// Item with self placeholders rewritten.
    pub data: MessageData,
}

/// A recall notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Undo {
    /// Conversation the recall belongs to.
    pub thread_id: String,
    /// Conversation kind.
    pub thread_type: ThreadType,
    /// True when recalled by the session's own account.
    pub is_self: bool,
    /// Item with self placeholders rewritten.
    pub data: MessageData,
    /// Parsed recall details.
    pub undo: UndoContent,
}

/// One classified batch item.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    /// Normal message.
    Message(Message),
    /// Recall notification.
    Undo(Undo),
}

impl BatchItem {
    /// Classify a raw batch item, rewriting self placeholders to `uid`.
    ///
    /// Items whose `content` object has a `deleteMsg` field are recalls.
    pub fn classify(uid: &str, thread_type: ThreadType, raw: Value) -> Result<Self, serde_json::Error> {
        let mut data: MessageData = serde_json::from_value(raw)?;
        let is_self = data.uid_from == SELF_UID;
        let thread_id = match thread_type {
            ThreadType::User if is_self => data.id_to.clone(),
            ThreadType::User => data.uid_from.clone(),
            ThreadType::Group => data.id_to.clone(),
        };

        if data.id_to == SELF_UID {
            data.id_to = uid.to_string();
        }
        if is_self {
            data.uid_from = uid.to_string();
        }

        let is_undo = data
            .content
            .as_object()
            .is_some_and(|content| content.contains_key("deleteMsg"));
        if is_undo {
            let undo = UndoContent::deserialize(&data.content)?;
            return Ok(Self::Undo(Undo {
                thread_id,
                thread_type,
                is_self,
                data,
                undo,
            }));
        }
        Ok(Self::Message(Message {
            thread_id,
            thread_type,
            is_self,
            data,
        }))
    }

    /// True when the item originated from the session's own account.
    pub fn is_self(&self) -> bool {
        match self {
            Self::Message(message) => message.is_self,
            Self::Undo(undo) => undo.is_self,
        }
    }
}

/// Decoded message batch payload: `{"data": {"msgs": [...]}}` for users,
/// `{"data": {"groupMsgs": [...]}}` for groups.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBatch {
    /// Batch body.
    #[serde(default)]
    pub data: BatchBody,
}

/// Items of a [`MessageBatch`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchBody {
    /// One-to-one items.
    #[serde(default)]
    pub msgs: Vec<Value>,
    /// Group items.
    #[serde(default, rename = "groupMsgs")]
    pub group_msgs: Vec<Value>,
}

impl MessageBatch {
    /// Raw items for `thread_type`.
    pub fn into_items(self, thread_type: ThreadType) -> Vec<Value> {
        match thread_type {
            ThreadType::User => self.data.msgs,
            ThreadType::Group => self.data.group_msgs,
        }
    }
}

/// Reply to an old-message backfill request.
#[derive(Debug, Clone, PartialEq)]
pub struct OldMessages {
    /// Conversation kind requested.
    pub thread_type: ThreadType,
    /// Messages returned, self items included.
    pub messages: Vec<Message>,
}
