//! Matcher builder functions for common update kinds.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_framework::prelude::*;
//!
//! app.add_handler(on_command("start").handler(start), 0);
//! app.add_handler(on_message(filters::text() & !filters::command()).handler(echo), 0);
//! app.add_handler(on_callback_query_pattern("^vote:")?.handler(vote), 0);
//! app.add_handler(on_kind(UpdateTag::PollAnswer).handler(tally), 1);
//! ```

use courier_core::{Update, UpdateTag};

use crate::filters::{self, Filter};
use crate::handler::Matched;
use crate::matcher::Matcher;

/// Creates a matcher for the bot command `/name`.
///
/// Matches new and edited messages whose text starts with the command. A
/// `@username` suffix is accepted regardless of the username; use
/// [`on_command_as`] to restrict it. Arguments are available through the
/// [`Args`](crate::extractor::Args) extractor.
pub fn on_command(name: &str) -> Matcher {
    command_matcher(&[name], None)
}

/// Creates a matcher for any of the given commands.
pub fn on_commands(names: &[&str]) -> Matcher {
    command_matcher(names, None)
}

/// Like [`on_command`], but rejects commands addressed to other bots.
pub fn on_command_as(name: &str, username: &str) -> Matcher {
    command_matcher(&[name], Some(username.to_string()))
}

fn command_matcher(names: &[&str], username: Option<String>) -> Matcher {
    let names: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
    let label = format!("command:/{}", names.join("|/"));
    let filter = Filter::with_match(move |update| {
        if !matches!(update.tag(), UpdateTag::Message | UpdateTag::EditedMessage) {
            return None;
        }
        let message = update.effective_message()?;
        let (command, args) = filters::parse_command(message, username.as_deref())?;
        names
            .contains(&command)
            .then(|| Matched::new().with_args(args))
    });
    Matcher::new().name(label).filter(filter)
}

/// Creates a matcher for messages and channel posts passing `filter`.
///
/// New and edited messages are both covered; add [`filters::edited`] or
/// [`filters::kinds`] to narrow it.
pub fn on_message(filter: Filter) -> Matcher {
    Matcher::new()
        .name("message")
        .filter(filters::message_like() & filter)
}

/// Creates a matcher for every callback query.
pub fn on_callback_query() -> Matcher {
    on_kind(UpdateTag::CallbackQuery).name("callback_query")
}

/// Creates a matcher for callback queries whose data matches `pattern`.
pub fn on_callback_query_pattern(pattern: &str) -> Result<Matcher, regex::Error> {
    Ok(on_callback_query().filter(filters::callback_data(pattern)?))
}

/// Creates a matcher for every inline query.
pub fn on_inline_query() -> Matcher {
    on_kind(UpdateTag::InlineQuery).name("inline_query")
}

/// Creates a matcher for inline queries whose text matches `pattern`.
pub fn on_inline_query_pattern(pattern: &str) -> Result<Matcher, regex::Error> {
    Ok(on_inline_query().filter(filters::inline_query(pattern)?))
}

/// Creates a matcher for one payload kind.
pub fn on_kind(tag: UpdateTag) -> Matcher {
    Matcher::new()
        .name(tag.as_str())
        .filter(filters::kinds(&[tag]))
}

/// Creates a matcher from an arbitrary predicate.
pub fn on_update<F>(predicate: F) -> Matcher
where
    F: Fn(&Update) -> bool + Send + Sync + 'static,
{
    Matcher::new().name("update").check(predicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command_update(kind: &str, text: &str, len: usize) -> Update {
        Update::from_value(json!({
            "update_id": 5,
            kind: {
                "message_id": 1,
                "chat": { "id": 1, "type": "private" },
                "text": text,
                "entities": [{ "type": "bot_command", "offset": 0, "length": len }]
            }
        }))
        .unwrap()
    }

    async fn noop() {}

    #[test]
    fn test_on_command_args() {
        let matcher = on_command("echo").handler(noop);
        let matched = matcher
            .matches(&command_update("message", "/echo hello world", 5))
            .unwrap();
        assert_eq!(matched.args, vec!["hello", "world"]);

        assert!(matcher.matches(&command_update("message", "/other x", 6)).is_none());
        assert!(matcher.matches(&command_update("channel_post", "/echo x", 5)).is_none());
    }

    #[test]
    fn test_on_command_as() {
        let matcher = on_command_as("start", "courier_bot").handler(noop);
        assert!(matcher
            .matches(&command_update("message", "/start@courier_bot", 18))
            .is_some());
        assert!(matcher
            .matches(&command_update("message", "/start@other_bot", 16))
            .is_none());
    }

    #[test]
    fn test_on_callback_query_pattern() {
        let matcher = on_callback_query_pattern(r"^vote:(\w+)$")
            .unwrap()
            .handler(noop);
        let update = Update::from_value(json!({
            "update_id": 1,
            "callback_query": {
                "id": "q",
                "from": { "id": 1, "first_name": "A" },
                "data": "vote:yes"
            }
        }))
        .unwrap();
        let matched = matcher.matches(&update).unwrap();
        assert_eq!(matched.captures.unwrap().get(1), Some("yes"));
    }

    #[test]
    fn test_matcher_without_callback_never_matches() {
        let update = command_update("message", "/echo", 5);
        assert!(on_command("echo").matches(&update).is_none());
    }
}
