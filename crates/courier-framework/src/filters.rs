//! Composable update filters.
//!
//! A [`Filter`] is a predicate over an [`Update`] that may also produce
//! match data (regex captures, command arguments). Filters combine with
//! `&`, `|` and `!`:
//!
//! ```rust,ignore
//! use courier_framework::filters;
//!
//! let plain_text = filters::text() & !filters::command();
//! let media = filters::has("photo") | filters::has("video");
//! let private_photos = filters::private() & media;
//! ```

use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use regex::Regex;

use courier_core::{ChatType, Message, Update, UpdateTag};

use crate::handler::{Captures, Matched};

type CheckFn = Arc<dyn Fn(&Update) -> Option<Matched> + Send + Sync>;

/// A predicate over updates.
#[derive(Clone)]
pub struct Filter {
    check: CheckFn,
}

impl Filter {
    /// Creates a filter from a plain predicate.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Update) -> bool + Send + Sync + 'static,
    {
        Self::with_match(move |update| predicate(update).then(Matched::new))
    }

    /// Creates a filter whose predicate also computes match data.
    pub fn with_match<F>(check: F) -> Self
    where
        F: Fn(&Update) -> Option<Matched> + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }

    /// Creates a filter over the update's effective message.
    pub fn message<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::new(move |update| update.effective_message().is_some_and(&predicate))
    }

    /// Tests `update`.
    pub fn check(&self, update: &Update) -> Option<Matched> {
        (self.check)(update)
    }

    /// Returns `true` if `update` passes.
    pub fn matches(&self, update: &Update) -> bool {
        self.check(update).is_some()
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter").finish_non_exhaustive()
    }
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        Filter::with_match(move |update| {
            let left = self.check(update)?;
            let right = rhs.check(update)?;
            Some(left.merge(right))
        })
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        Filter::with_match(move |update| self.check(update).or_else(|| rhs.check(update)))
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::new(move |update| !self.matches(update))
    }
}

// ============================================================================
// Built-in filters
// ============================================================================

/// Passes every update.
pub fn any() -> Filter {
    Filter::new(|_| true)
}

/// Updates whose payload kind is one of `kinds`.
pub fn kinds(kinds: &[UpdateTag]) -> Filter {
    let kinds = kinds.to_vec();
    Filter::new(move |update| kinds.contains(&update.tag()))
}

/// New and edited messages and channel posts.
pub fn message_like() -> Filter {
    kinds(&[
        UpdateTag::Message,
        UpdateTag::EditedMessage,
        UpdateTag::ChannelPost,
        UpdateTag::EditedChannelPost,
    ])
}

/// Edited messages and edited channel posts.
pub fn edited() -> Filter {
    kinds(&[UpdateTag::EditedMessage, UpdateTag::EditedChannelPost])
}

/// Messages with text, commands included.
pub fn text() -> Filter {
    Filter::message(|m| m.text.is_some())
}

/// Messages whose text equals one of `options`.
pub fn text_in<I, S>(options: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let options: Vec<String> = options.into_iter().map(Into::into).collect();
    Filter::message(move |m| m.text.as_ref().is_some_and(|t| options.contains(t)))
}

/// Messages with a media caption.
pub fn caption() -> Filter {
    Filter::message(|m| m.caption.is_some())
}

/// Messages that start with a bot command.
pub fn command() -> Filter {
    Filter::message(|m| parse_command(m, None).is_some())
}

/// Messages whose text or caption matches `pattern`. Provides captures.
pub fn regex(pattern: &str) -> Result<Filter, regex::Error> {
    let regex = Regex::new(pattern)?;
    Ok(Filter::with_match(move |update| {
        let text = update.effective_message()?.text_or_caption()?;
        let caps = regex.captures(text)?;
        Some(Matched::new().with_captures(Captures::from_regex(&regex, &caps)))
    }))
}

/// Callback queries whose data matches `pattern`. Provides captures.
pub fn callback_data(pattern: &str) -> Result<Filter, regex::Error> {
    let regex = Regex::new(pattern)?;
    Ok(Filter::with_match(move |update| {
        let data = update.callback_query()?.data.as_deref()?;
        let caps = regex.captures(data)?;
        Some(Matched::new().with_captures(Captures::from_regex(&regex, &caps)))
    }))
}

/// Inline queries whose query text matches `pattern`. Provides captures.
pub fn inline_query(pattern: &str) -> Result<Filter, regex::Error> {
    let regex = Regex::new(pattern)?;
    Ok(Filter::with_match(move |update| {
        let query = &update.inline_query()?.query;
        let caps = regex.captures(query)?;
        Some(Matched::new().with_captures(Captures::from_regex(&regex, &caps)))
    }))
}

/// Updates from a chat of the given type.
pub fn chat_type(kind: ChatType) -> Filter {
    Filter::new(move |update| update.effective_chat().is_some_and(|c| c.kind == kind))
}

/// Updates from private chats.
pub fn private() -> Filter {
    chat_type(ChatType::Private)
}

/// Updates from groups and supergroups.
pub fn group() -> Filter {
    chat_type(ChatType::Group) | chat_type(ChatType::Supergroup)
}

/// Updates from one of the given chats.
pub fn chat(ids: &[i64]) -> Filter {
    let ids = ids.to_vec();
    Filter::new(move |update| update.effective_chat_id().is_some_and(|id| ids.contains(&id)))
}

/// Updates from one of the given users.
pub fn user(ids: &[i64]) -> Filter {
    let ids = ids.to_vec();
    Filter::new(move |update| update.effective_user_id().is_some_and(|id| ids.contains(&id)))
}

/// Messages carrying the given content field, e.g. `"photo"` or
/// `"document"`.
pub fn has(field: &'static str) -> Filter {
    Filter::message(move |m| m.has(field))
}

/// Splits a leading bot command into its name and arguments.
///
/// The command must be a `bot_command` entity at offset zero. A
/// `@username` suffix is stripped; when `username` is given, commands
/// addressed to another bot are rejected.
pub fn parse_command(message: &Message, username: Option<&str>) -> Option<(String, Vec<String>)> {
    let entity = message
        .entities
        .iter()
        .find(|e| e.kind == "bot_command" && e.offset == 0)?;
    let command = message.entity_text(entity)?;
    let command = command.strip_prefix('/')?;

    let (name, mention) = match command.split_once('@') {
        Some((name, mention)) => (name, Some(mention)),
        None => (command, None),
    };
    if let (Some(mention), Some(username)) = (mention, username)
        && !mention.eq_ignore_ascii_case(username.trim_start_matches('@'))
    {
        return None;
    }

    let text = message.text.as_deref()?;
    let rest = utf16_suffix(text, entity.length)?;
    let args = rest.split_whitespace().map(str::to_string).collect();
    Some((name.to_lowercase(), args))
}

/// Returns `text` after its first `units` UTF-16 code units.
fn utf16_suffix(text: &str, units: usize) -> Option<&str> {
    let mut seen = 0;
    for (index, ch) in text.char_indices() {
        if seen >= units {
            return Some(&text[index..]);
        }
        seen += ch.len_utf16();
    }
    (seen >= units).then_some("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_update(chat_type: &str, text: &str, command_len: Option<usize>) -> Update {
        let entities = match command_len {
            Some(len) => json!([{ "type": "bot_command", "offset": 0, "length": len }]),
            None => json!([]),
        };
        Update::from_value(json!({
            "update_id": 1,
            "message": {
                "message_id": 1,
                "chat": { "id": 10, "type": chat_type },
                "from": { "id": 20, "first_name": "U" },
                "text": text,
                "entities": entities
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_combinators() {
        let plain = text() & !command();
        assert!(plain.matches(&message_update("private", "hello", None)));
        assert!(!plain.matches(&message_update("private", "/start", Some(6))));

        let either = chat(&[99]) | user(&[20]);
        assert!(either.matches(&message_update("group", "x", None)));
        assert!(group().matches(&message_update("supergroup", "x", None)));
        assert!(!private().matches(&message_update("group", "x", None)));
    }

    #[test]
    fn test_regex_provides_captures() {
        let filter = regex(r"^my name is (\w+)$").unwrap();
        let matched = filter
            .check(&message_update("private", "my name is Ann", None))
            .unwrap();
        assert_eq!(matched.captures.unwrap().get(1), Some("Ann"));
    }

    #[test]
    fn test_parse_command() {
        let update = message_update("group", "/Start@CourierBot  a  b", Some(17));
        let message = update.effective_message().unwrap();

        let (name, args) = parse_command(message, None).unwrap();
        assert_eq!(name, "start");
        assert_eq!(args, vec!["a", "b"]);

        assert!(parse_command(message, Some("courierbot")).is_some());
        assert!(parse_command(message, Some("other_bot")).is_none());
    }

    #[test]
    fn test_command_must_lead() {
        let update = Update::from_value(json!({
            "update_id": 1,
            "message": {
                "message_id": 1,
                "chat": { "id": 1, "type": "private" },
                "text": "hey /start",
                "entities": [{ "type": "bot_command", "offset": 4, "length": 6 }]
            }
        }))
        .unwrap();
        assert!(!command().matches(&update));
    }
}
