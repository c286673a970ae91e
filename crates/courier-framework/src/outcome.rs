//! Handler outcomes.
//!
//! Every handler action resolves to an [`Outcome`], which answers two
//! questions for the dispatcher:
//!
//! - **Flow**: is the group done ([`Outcome::handled`], the default), should
//!   the next handler of the same group be tried ([`Outcome::fall_through`]),
//!   or should all remaining groups be skipped ([`Outcome::stop`])?
//! - **Transition**: when the handler is a conversation route, which
//!   [`State`] comes next ([`Transition`]).
//!
//! Actions rarely build an `Outcome` by hand. Anything implementing
//! [`IntoOutcome`] can be returned instead:
//!
//! ```rust,ignore
//! async fn ask_name() -> State { State::from("NAME") }
//! async fn done() -> Transition { Transition::End }
//! async fn log_only() {}
//! async fn fallible() -> anyhow::Result<Outcome> { Ok(Outcome::stop()) }
//! ```

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handler::HandlerResult;

/// A conversation state label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Cow<'static, str>);

impl State {
    /// Creates a state from a static label, usable in `const` items.
    pub const fn from_static(label: &'static str) -> Self {
        Self(Cow::Borrowed(label))
    }

    /// Returns the label.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for State {
    fn from(label: &'static str) -> Self {
        Self::from_static(label)
    }
}

impl From<String> for State {
    fn from(label: String) -> Self {
        Self(Cow::Owned(label))
    }
}

/// What a conversation does after a route ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Transition {
    /// Keep the current state.
    #[default]
    Stay,
    /// Move to the given state.
    To(State),
    /// End the conversation and forget its record.
    End,
}

impl From<State> for Transition {
    fn from(state: State) -> Self {
        Self::To(state)
    }
}

/// How dispatch proceeds after a handler ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Flow {
    /// The group is done; continue with the next group.
    #[default]
    NextGroup,
    /// Try the next matching handler of the same group.
    FallThrough,
    /// Skip all remaining groups.
    Stop,
}

/// The result of running a handler action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    flow: Flow,
    transition: Transition,
}

impl Outcome {
    /// The update was handled; continue with the next group.
    pub fn handled() -> Self {
        Self::default()
    }

    /// The handler declined; try the next handler of the same group.
    pub fn fall_through() -> Self {
        Self {
            flow: Flow::FallThrough,
            transition: Transition::Stay,
        }
    }

    /// The update was handled; skip all remaining groups.
    pub fn stop() -> Self {
        Self {
            flow: Flow::Stop,
            transition: Transition::Stay,
        }
    }

    /// The update was handled and the conversation moves to `state`.
    pub fn goto(state: impl Into<State>) -> Self {
        Self {
            flow: Flow::NextGroup,
            transition: Transition::To(state.into()),
        }
    }

    /// The update was handled and the conversation ends.
    pub fn end() -> Self {
        Self {
            flow: Flow::NextGroup,
            transition: Transition::End,
        }
    }

    /// Additionally skips all remaining groups.
    pub fn and_stop(mut self) -> Self {
        self.flow = Flow::Stop;
        self
    }

    /// Replaces the transition.
    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transition = transition;
        self
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn transition(&self) -> &Transition {
        &self.transition
    }

    /// Returns `true` unless the handler fell through.
    pub fn is_consumed(&self) -> bool {
        self.flow != Flow::FallThrough
    }
}

impl From<Transition> for Outcome {
    fn from(transition: Transition) -> Self {
        Self::handled().with_transition(transition)
    }
}

// ============================================================================
// IntoOutcome
// ============================================================================

/// Types that can be returned from handler actions.
pub trait IntoOutcome: Send + 'static {
    /// Converts the return value into the dispatcher's view of it.
    fn into_outcome(self) -> HandlerResult;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> HandlerResult {
        Ok(Outcome::handled())
    }
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> HandlerResult {
        Ok(self)
    }
}

impl IntoOutcome for Transition {
    fn into_outcome(self) -> HandlerResult {
        Ok(self.into())
    }
}

impl IntoOutcome for State {
    fn into_outcome(self) -> HandlerResult {
        Ok(Outcome::goto(self))
    }
}

impl IntoOutcome for &'static str {
    fn into_outcome(self) -> HandlerResult {
        Ok(Outcome::goto(self))
    }
}

/// `None` keeps the current state.
impl<T: IntoOutcome> IntoOutcome for Option<T> {
    fn into_outcome(self) -> HandlerResult {
        match self {
            Some(inner) => inner.into_outcome(),
            None => Ok(Outcome::handled()),
        }
    }
}

impl<T, E> IntoOutcome for Result<T, E>
where
    T: IntoOutcome,
    E: Into<anyhow::Error> + Send + 'static,
{
    fn into_outcome(self) -> HandlerResult {
        match self {
            Ok(inner) => inner.into_outcome(),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASK_AGE: State = State::from_static("ASK_AGE");

    #[test]
    fn test_constructors() {
        assert_eq!(Outcome::handled().flow(), Flow::NextGroup);
        assert_eq!(Outcome::fall_through().flow(), Flow::FallThrough);
        assert!(!Outcome::fall_through().is_consumed());

        let outcome = Outcome::goto(ASK_AGE).and_stop();
        assert_eq!(outcome.flow(), Flow::Stop);
        assert_eq!(outcome.transition(), &Transition::To(ASK_AGE));
    }

    #[test]
    fn test_into_outcome() {
        assert_eq!(().into_outcome().unwrap(), Outcome::handled());
        assert_eq!(
            "NAME".into_outcome().unwrap().transition(),
            &Transition::To(State::from("NAME"))
        );
        assert_eq!(
            Some(Transition::End).into_outcome().unwrap(),
            Outcome::end()
        );
        assert_eq!(None::<State>.into_outcome().unwrap(), Outcome::handled());

        let failed: Result<(), std::io::Error> = Err(std::io::Error::other("boom"));
        assert!(failed.into_outcome().is_err());
    }

    #[test]
    fn test_state_serde_is_plain_string() {
        let json = serde_json::to_string(&State::from("A")).unwrap();
        assert_eq!(json, "\"A\"");
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, State::from_static("A"));
    }
}
