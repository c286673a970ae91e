use std::fmt;

use serde::{Deserialize, Serialize};

use courier_core::Update;

/// Identifies one conversation instance.
///
/// Built from the chat id, user id and/or message id of an update, joined
/// with `:`, e.g. `"-1001:42"` for a per-chat, per-user conversation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Joins `parts` into a key.
    pub fn from_parts<T: fmt::Display>(parts: &[T]) -> Self {
        let parts: Vec<String> = parts.iter().map(ToString::to_string).collect();
        Self(parts.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which parts of an update make up its conversation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyStrategy {
    pub per_chat: bool,
    pub per_user: bool,
    pub per_message: bool,
}

impl Default for KeyStrategy {
    fn default() -> Self {
        Self {
            per_chat: true,
            per_user: true,
            per_message: false,
        }
    }
}

impl KeyStrategy {
    pub fn is_empty(&self) -> bool {
        !(self.per_chat || self.per_user || self.per_message)
    }

    /// Derives the key of `update`.
    ///
    /// Returns `None` if the update lacks a required part: no chat for
    /// `per_chat`, no user for `per_user`, or, for `per_message`, anything
    /// but a callback query.
    pub fn key_for(&self, update: &Update) -> Option<ConversationKey> {
        let mut parts: Vec<String> = Vec::with_capacity(3);

        if self.per_chat {
            parts.push(update.effective_chat_id()?.to_string());
        }
        if self.per_user {
            parts.push(update.effective_user_id()?.to_string());
        }
        if self.per_message {
            let query = update.callback_query()?;
            let id = match (&query.inline_message_id, &query.message) {
                (Some(inline), _) => inline.clone(),
                (None, Some(message)) => message.message_id.to_string(),
                (None, None) => return None,
            };
            parts.push(id);
        }

        Some(ConversationKey::from_parts(&parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn callback_update() -> Update {
        Update::from_value(json!({
            "update_id": 1,
            "callback_query": {
                "id": "q",
                "from": { "id": 7, "first_name": "A" },
                "message": { "message_id": 55, "chat": { "id": -3, "type": "group" } },
                "data": "x"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_key_strategies() {
        let update = callback_update();
        let chat_user = KeyStrategy::default();
        assert_eq!(chat_user.key_for(&update).unwrap().as_str(), "-3:7");

        let all = KeyStrategy {
            per_message: true,
            ..KeyStrategy::default()
        };
        assert_eq!(all.key_for(&update).unwrap().as_str(), "-3:7:55");

        let user_only = KeyStrategy {
            per_chat: false,
            per_user: true,
            per_message: false,
        };
        assert_eq!(user_only.key_for(&update).unwrap().as_str(), "7");
    }

    #[test]
    fn test_per_message_needs_callback_query() {
        let update = Update::from_value(json!({
            "update_id": 1,
            "message": {
                "message_id": 1,
                "chat": { "id": 1, "type": "private" },
                "from": { "id": 1, "first_name": "A" }
            }
        }))
        .unwrap();
        let strategy = KeyStrategy {
            per_message: true,
            ..KeyStrategy::default()
        };
        assert!(strategy.key_for(&update).is_none());
    }
}
