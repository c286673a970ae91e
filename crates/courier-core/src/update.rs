//! Inbound update model.
//!
//! An [`Update`] is one inbound event from the messaging platform: a strictly
//! increasing `update_id` plus exactly one payload. Payloads are modelled as a
//! tagged sum type ([`UpdateKind`]) so predicates can switch on the variant
//! instead of probing optional fields.
//!
//! Only the fields the dispatch core reads are typed. Everything else the API
//! sends is kept in a flattened `extra` map on each payload, which keeps the
//! model forward compatible and lets content-type filters test for presence
//! (`photo`, `document`, `voice`, ...).
//!
//! # Wire format
//!
//! ```json
//! { "update_id": 10, "message": { "message_id": 1, "chat": { "id": 5, "type": "private" } } }
//! ```
//!
//! Unknown payload kinds deserialize into [`UpdateKind::Other`] rather than
//! failing, so the cursor can still advance past them.

use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Free-form JSON fields that are carried but not interpreted.
pub type Extra = Map<String, Value>;

// ============================================================================
// Users and chats
// ============================================================================

/// A user or bot account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier.
    pub id: i64,
    /// Whether this account is a bot.
    #[serde(default)]
    pub is_bot: bool,
    /// First name.
    #[serde(default)]
    pub first_name: String,
    /// Optional username, without the leading `@`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// The kind of a chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
    /// A chat type this crate does not know about yet.
    Unknown(String),
}

impl ChatType {
    /// Returns the wire name of this chat type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Supergroup => "supergroup",
            Self::Channel => "channel",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for ChatType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "private" => Self::Private,
            "group" => Self::Group,
            "supergroup" => Self::Supergroup,
            "channel" => Self::Channel,
            _ => Self::Unknown(value),
        }
    }
}

impl From<ChatType> for String {
    fn from(value: ChatType) -> Self {
        value.as_str().to_string()
    }
}

impl Serialize for ChatType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChatType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// A chat: private conversation, group, supergroup or channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    /// Unique identifier.
    pub id: i64,
    /// Type of the chat.
    #[serde(rename = "type")]
    pub kind: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

// ============================================================================
// Messages
// ============================================================================

/// A special span of message text: command, mention, URL, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    /// Entity type, e.g. `bot_command` or `mention`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Offset in UTF-16 code units.
    pub offset: usize,
    /// Length in UTF-16 code units.
    pub length: usize,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A message, channel post, or the message attached to a callback query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    /// Unix timestamp; zero for inaccessible messages.
    #[serde(default)]
    pub date: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caption_entities: Vec<MessageEntity>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Message {
    /// Returns the text, falling back to the media caption.
    pub fn text_or_caption(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    /// Returns `true` if the message carries the untyped field `field`
    /// (e.g. `"photo"`, `"document"`, `"new_chat_members"`).
    pub fn has(&self, field: &str) -> bool {
        self.extra.get(field).is_some_and(|v| !v.is_null())
    }

    /// Returns the slice of `text` covered by `entity`.
    ///
    /// Entity offsets count UTF-16 code units, so the text is re-encoded
    /// before slicing. Returns `None` if the entity lies outside the text.
    pub fn entity_text(&self, entity: &MessageEntity) -> Option<String> {
        let text = self.text.as_deref()?;
        let units: Vec<u16> = text.encode_utf16().collect();
        let end = entity.offset.checked_add(entity.length)?;
        let slice = units.get(entity.offset..end)?;
        Some(String::from_utf16_lossy(slice))
    }
}

// ============================================================================
// Other payloads
// ============================================================================

/// A button press on an inline keyboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    /// The message carrying the keyboard, if the bot sent it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<Message>>,
    /// Set instead of `message` for inline-mode messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub chat_instance: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An incoming inline query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub offset: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// An inline result chosen by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenInlineResult {
    pub result_id: String,
    pub from: User,
    #[serde(default)]
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_message_id: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A shipping or pre-checkout query from the payments flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub invoice_payload: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A poll whose state changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    #[serde(default)]
    pub question: String,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A vote in a non-anonymous poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollAnswer {
    pub poll_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Set when the vote was cast on behalf of a chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voter_chat: Option<Chat>,
    #[serde(default)]
    pub option_ids: Vec<i32>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A change of a chat member's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: User,
    #[serde(default)]
    pub date: i64,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A request to join a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatJoinRequest {
    pub chat: Chat,
    pub from: User,
    #[serde(default)]
    pub date: i64,
    #[serde(flatten)]
    pub extra: Extra,
}

// ============================================================================
// UpdateKind / UpdateTag
// ============================================================================

/// Field-less discriminant of [`UpdateKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateTag {
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    CallbackQuery,
    InlineQuery,
    ChosenInlineResult,
    ShippingQuery,
    PreCheckoutQuery,
    Poll,
    PollAnswer,
    MyChatMember,
    ChatMember,
    ChatJoinRequest,
    Other,
}

impl UpdateTag {
    /// Every tag with a typed payload, in wire-lookup order.
    pub const KNOWN: [UpdateTag; 14] = [
        Self::Message,
        Self::EditedMessage,
        Self::ChannelPost,
        Self::EditedChannelPost,
        Self::CallbackQuery,
        Self::InlineQuery,
        Self::ChosenInlineResult,
        Self::ShippingQuery,
        Self::PreCheckoutQuery,
        Self::Poll,
        Self::PollAnswer,
        Self::MyChatMember,
        Self::ChatMember,
        Self::ChatJoinRequest,
    ];

    /// Returns the JSON field name used for this payload kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::EditedMessage => "edited_message",
            Self::ChannelPost => "channel_post",
            Self::EditedChannelPost => "edited_channel_post",
            Self::CallbackQuery => "callback_query",
            Self::InlineQuery => "inline_query",
            Self::ChosenInlineResult => "chosen_inline_result",
            Self::ShippingQuery => "shipping_query",
            Self::PreCheckoutQuery => "pre_checkout_query",
            Self::Poll => "poll",
            Self::PollAnswer => "poll_answer",
            Self::MyChatMember => "my_chat_member",
            Self::ChatMember => "chat_member",
            Self::ChatJoinRequest => "chat_join_request",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for UpdateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload of an [`Update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    Message(Message),
    EditedMessage(Message),
    ChannelPost(Message),
    EditedChannelPost(Message),
    CallbackQuery(CallbackQuery),
    InlineQuery(InlineQuery),
    ChosenInlineResult(ChosenInlineResult),
    ShippingQuery(PaymentQuery),
    PreCheckoutQuery(PaymentQuery),
    Poll(Poll),
    PollAnswer(PollAnswer),
    MyChatMember(ChatMemberUpdated),
    ChatMember(ChatMemberUpdated),
    ChatJoinRequest(ChatJoinRequest),
    /// A payload kind without a typed model.
    Other {
        /// The JSON field name the payload arrived under.
        kind: String,
        payload: Value,
    },
}

impl UpdateKind {
    /// Returns the discriminant of this payload.
    pub fn tag(&self) -> UpdateTag {
        match self {
            Self::Message(_) => UpdateTag::Message,
            Self::EditedMessage(_) => UpdateTag::EditedMessage,
            Self::ChannelPost(_) => UpdateTag::ChannelPost,
            Self::EditedChannelPost(_) => UpdateTag::EditedChannelPost,
            Self::CallbackQuery(_) => UpdateTag::CallbackQuery,
            Self::InlineQuery(_) => UpdateTag::InlineQuery,
            Self::ChosenInlineResult(_) => UpdateTag::ChosenInlineResult,
            Self::ShippingQuery(_) => UpdateTag::ShippingQuery,
            Self::PreCheckoutQuery(_) => UpdateTag::PreCheckoutQuery,
            Self::Poll(_) => UpdateTag::Poll,
            Self::PollAnswer(_) => UpdateTag::PollAnswer,
            Self::MyChatMember(_) => UpdateTag::MyChatMember,
            Self::ChatMember(_) => UpdateTag::ChatMember,
            Self::ChatJoinRequest(_) => UpdateTag::ChatJoinRequest,
            Self::Other { .. } => UpdateTag::Other,
        }
    }

    /// Returns the JSON field name of this payload.
    pub fn name(&self) -> &str {
        match self {
            Self::Other { kind, .. } => kind,
            other => other.tag().as_str(),
        }
    }

    /// Builds a payload from the update object with `update_id` removed.
    fn from_object(mut object: Map<String, Value>) -> Result<Self, serde_json::Error> {
        for tag in UpdateTag::KNOWN {
            if let Some(payload) = object.remove(tag.as_str()) {
                return Self::from_tagged(tag, payload);
            }
        }

        match object.into_iter().next() {
            Some((kind, payload)) => Ok(Self::Other { kind, payload }),
            None => Err(serde_json::Error::custom("update carries no payload")),
        }
    }

    fn from_tagged(tag: UpdateTag, payload: Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;

        Ok(match tag {
            UpdateTag::Message => Self::Message(from_value(payload)?),
            UpdateTag::EditedMessage => Self::EditedMessage(from_value(payload)?),
            UpdateTag::ChannelPost => Self::ChannelPost(from_value(payload)?),
            UpdateTag::EditedChannelPost => Self::EditedChannelPost(from_value(payload)?),
            UpdateTag::CallbackQuery => Self::CallbackQuery(from_value(payload)?),
            UpdateTag::InlineQuery => Self::InlineQuery(from_value(payload)?),
            UpdateTag::ChosenInlineResult => Self::ChosenInlineResult(from_value(payload)?),
            UpdateTag::ShippingQuery => Self::ShippingQuery(from_value(payload)?),
            UpdateTag::PreCheckoutQuery => Self::PreCheckoutQuery(from_value(payload)?),
            UpdateTag::Poll => Self::Poll(from_value(payload)?),
            UpdateTag::PollAnswer => Self::PollAnswer(from_value(payload)?),
            UpdateTag::MyChatMember => Self::MyChatMember(from_value(payload)?),
            UpdateTag::ChatMember => Self::ChatMember(from_value(payload)?),
            UpdateTag::ChatJoinRequest => Self::ChatJoinRequest(from_value(payload)?),
            UpdateTag::Other => Self::Other {
                kind: UpdateTag::Other.as_str().to_string(),
                payload,
            },
        })
    }
}

// ============================================================================
// Update
// ============================================================================

/// One inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Strictly increasing sequence number used for acknowledgement.
    pub update_id: i64,
    pub kind: UpdateKind,
}

impl Update {
    /// Creates an update from its parts.
    pub fn new(update_id: i64, kind: UpdateKind) -> Self {
        Self { update_id, kind }
    }

    /// Parses an update from a JSON value.
    ///
    /// Use this when only a single malformed update should be skipped
    /// instead of failing a whole batch.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Returns the payload discriminant.
    pub fn tag(&self) -> UpdateTag {
        self.kind.tag()
    }

    /// Returns the JSON field name of the payload.
    pub fn kind_name(&self) -> &str {
        self.kind.name()
    }

    /// Returns the message this update is about, if any.
    ///
    /// Covers new and edited messages, channel posts, and the message a
    /// callback query's keyboard is attached to.
    pub fn effective_message(&self) -> Option<&Message> {
        match &self.kind {
            UpdateKind::Message(m)
            | UpdateKind::EditedMessage(m)
            | UpdateKind::ChannelPost(m)
            | UpdateKind::EditedChannelPost(m) => Some(m),
            UpdateKind::CallbackQuery(q) => q.message.as_deref(),
            _ => None,
        }
    }

    /// Returns the chat this update happened in, if any.
    pub fn effective_chat(&self) -> Option<&Chat> {
        match &self.kind {
            UpdateKind::MyChatMember(m) | UpdateKind::ChatMember(m) => Some(&m.chat),
            UpdateKind::ChatJoinRequest(r) => Some(&r.chat),
            UpdateKind::PollAnswer(a) => a.voter_chat.as_ref(),
            _ => self.effective_message().map(|m| &m.chat),
        }
    }

    /// Returns the user that caused this update, if any.
    pub fn effective_user(&self) -> Option<&User> {
        match &self.kind {
            UpdateKind::Message(m)
            | UpdateKind::EditedMessage(m)
            | UpdateKind::ChannelPost(m)
            | UpdateKind::EditedChannelPost(m) => m.from.as_ref(),
            UpdateKind::CallbackQuery(q) => Some(&q.from),
            UpdateKind::InlineQuery(q) => Some(&q.from),
            UpdateKind::ChosenInlineResult(r) => Some(&r.from),
            UpdateKind::ShippingQuery(q) | UpdateKind::PreCheckoutQuery(q) => Some(&q.from),
            UpdateKind::PollAnswer(a) => a.user.as_ref(),
            UpdateKind::MyChatMember(m) | UpdateKind::ChatMember(m) => Some(&m.from),
            UpdateKind::ChatJoinRequest(r) => Some(&r.from),
            UpdateKind::Poll(_) | UpdateKind::Other { .. } => None,
        }
    }

    /// Correlation key: the effective chat id.
    pub fn effective_chat_id(&self) -> Option<i64> {
        self.effective_chat().map(|c| c.id)
    }

    /// Correlation key: the effective user id.
    pub fn effective_user_id(&self) -> Option<i64> {
        self.effective_user().map(|u| u.id)
    }

    /// Returns the callback query payload, if this is one.
    pub fn callback_query(&self) -> Option<&CallbackQuery> {
        match &self.kind {
            UpdateKind::CallbackQuery(q) => Some(q),
            _ => None,
        }
    }

    /// Returns the inline query payload, if this is one.
    pub fn inline_query(&self) -> Option<&InlineQuery> {
        match &self.kind {
            UpdateKind::InlineQuery(q) => Some(q),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Update {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut object = Map::<String, Value>::deserialize(deserializer)?;
        let update_id = object
            .remove("update_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| D::Error::missing_field("update_id"))?;
        let kind = UpdateKind::from_object(object).map_err(D::Error::custom)?;
        Ok(Self { update_id, kind })
    }
}

impl Serialize for Update {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("update_id", &self.update_id)?;
        let key = self.kind.name();
        match &self.kind {
            UpdateKind::Message(m)
            | UpdateKind::EditedMessage(m)
            | UpdateKind::ChannelPost(m)
            | UpdateKind::EditedChannelPost(m) => map.serialize_entry(key, m)?,
            UpdateKind::CallbackQuery(q) => map.serialize_entry(key, q)?,
            UpdateKind::InlineQuery(q) => map.serialize_entry(key, q)?,
            UpdateKind::ChosenInlineResult(r) => map.serialize_entry(key, r)?,
            UpdateKind::ShippingQuery(q) | UpdateKind::PreCheckoutQuery(q) => {
                map.serialize_entry(key, q)?
            }
            UpdateKind::Poll(p) => map.serialize_entry(key, p)?,
            UpdateKind::PollAnswer(a) => map.serialize_entry(key, a)?,
            UpdateKind::MyChatMember(m) | UpdateKind::ChatMember(m) => {
                map.serialize_entry(key, m)?
            }
            UpdateKind::ChatJoinRequest(r) => map.serialize_entry(key, r)?,
            UpdateKind::Other { payload, .. } => map.serialize_entry(key, payload)?,
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_update(id: i64, text: &str) -> Value {
        json!({
            "update_id": id,
            "message": {
                "message_id": 7,
                "date": 1_700_000_000,
                "chat": { "id": 42, "type": "private", "first_name": "Ann" },
                "from": { "id": 1001, "is_bot": false, "first_name": "Ann" },
                "text": text,
                "entities": [{ "type": "bot_command", "offset": 0, "length": 6 }]
            }
        })
    }

    #[test]
    fn test_parse_message_update() {
        let update = Update::from_value(text_update(3, "/start now")).unwrap();
        assert_eq!(update.update_id, 3);
        assert_eq!(update.tag(), UpdateTag::Message);
        assert_eq!(update.effective_chat_id(), Some(42));
        assert_eq!(update.effective_user_id(), Some(1001));

        let message = update.effective_message().unwrap();
        assert_eq!(message.chat.kind, ChatType::Private);
        assert_eq!(message.chat.extra["first_name"], "Ann");
        assert_eq!(
            message.entity_text(&message.entities[0]).as_deref(),
            Some("/start")
        );
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 9,
            "business_message": { "message_id": 1 }
        }))
        .unwrap();

        assert_eq!(update.tag(), UpdateTag::Other);
        assert_eq!(update.kind_name(), "business_message");
        assert_eq!(update.effective_chat_id(), None);

        let back = serde_json::to_value(&update).unwrap();
        assert_eq!(back["business_message"]["message_id"], 1);
    }

    #[test]
    fn test_missing_update_id_is_rejected() {
        let result = Update::from_value(json!({ "message": {} }));
        assert!(result.is_err());
    }

    #[test]
    fn test_callback_query_accessors() {
        let update = Update::from_value(json!({
            "update_id": 11,
            "callback_query": {
                "id": "cq1",
                "from": { "id": 5, "first_name": "Bo" },
                "message": {
                    "message_id": 99,
                    "chat": { "id": -100, "type": "supergroup", "title": "Team" }
                },
                "chat_instance": "ci",
                "data": "vote:yes"
            }
        }))
        .unwrap();

        assert_eq!(update.effective_user_id(), Some(5));
        assert_eq!(update.effective_chat_id(), Some(-100));
        assert_eq!(update.effective_message().map(|m| m.message_id), Some(99));
        assert_eq!(
            update.callback_query().and_then(|q| q.data.as_deref()),
            Some("vote:yes")
        );
    }

    #[test]
    fn test_entity_text_counts_utf16_units() {
        let mut update = Update::from_value(text_update(1, "😀 /go")).unwrap();
        let UpdateKind::Message(message) = &mut update.kind else {
            unreachable!()
        };
        // The emoji takes two UTF-16 units, the space one more.
        let entity = MessageEntity {
            kind: "bot_command".into(),
            offset: 3,
            length: 3,
            extra: Extra::new(),
        };
        assert_eq!(message.entity_text(&entity).as_deref(), Some("/go"));
    }

    #[test]
    fn test_media_presence() {
        let update = Update::from_value(json!({
            "update_id": 2,
            "message": {
                "message_id": 1,
                "chat": { "id": 1, "type": "private" },
                "photo": [{ "file_id": "x", "file_unique_id": "y", "width": 1, "height": 1 }],
                "caption": "look"
            }
        }))
        .unwrap();
        let message = update.effective_message().unwrap();
        assert!(message.has("photo"));
        assert!(!message.has("voice"));
        assert_eq!(message.text_or_caption(), Some("look"));
    }
}
