use std::sync::Arc;

use crate::handler::{BoxedHandler, Handler};
use crate::matcher::Matcher;
use crate::outcome::{Outcome, State, Transition};

use super::ConversationHandler;

type ResolveFn = Arc<dyn Fn(&Outcome) -> Transition + Send + Sync>;

#[derive(Clone)]
enum Resolver {
    /// Use the transition carried by the outcome.
    FromOutcome,
    /// Always apply this transition.
    Fixed(Transition),
    Custom(ResolveFn),
}

/// A handler inside a conversation, plus how its outcome picks the next
/// state.
///
/// By default the next state is whatever transition the action returned.
/// [`Route::to`] and [`Route::end`] pin it instead, which lets plain
/// callbacks that return `()` still drive the state machine:
///
/// ```rust,ignore
/// ConversationHandler::builder()
///     .entry(Route::from(on_command("start").handler(ask_name)).to("NAME"))
///     .state("NAME", [Route::from(on_message(filters::text()).handler(save_name)).end()])
/// ```
#[derive(Clone)]
pub struct Route {
    pub(crate) handler: BoxedHandler,
    resolver: Resolver,
}

impl Route {
    /// Wraps any handler.
    pub fn new<H: Handler>(handler: H) -> Self {
        Self::from_boxed(Arc::new(handler))
    }

    pub fn from_boxed(handler: BoxedHandler) -> Self {
        Self {
            handler,
            resolver: Resolver::FromOutcome,
        }
    }

    /// Moves to `state` after the action, whatever it returned.
    pub fn to(mut self, state: impl Into<State>) -> Self {
        self.resolver = Resolver::Fixed(Transition::To(state.into()));
        self
    }

    /// Ends the conversation after the action, whatever it returned.
    pub fn end(mut self) -> Self {
        self.resolver = Resolver::Fixed(Transition::End);
        self
    }

    /// Computes the transition from the action's outcome.
    pub fn resolve<F>(mut self, f: F) -> Self
    where
        F: Fn(&Outcome) -> Transition + Send + Sync + 'static,
    {
        self.resolver = Resolver::Custom(Arc::new(f));
        self
    }

    pub(crate) fn transition_for(&self, outcome: &Outcome) -> Transition {
        match &self.resolver {
            Resolver::FromOutcome => outcome.transition().clone(),
            Resolver::Fixed(transition) => transition.clone(),
            Resolver::Custom(f) => f(outcome),
        }
    }
}

impl From<Matcher> for Route {
    fn from(matcher: Matcher) -> Self {
        Self::new(matcher)
    }
}

impl From<ConversationHandler> for Route {
    fn from(conversation: ConversationHandler) -> Self {
        Self::new(conversation)
    }
}

impl From<BoxedHandler> for Route {
    fn from(handler: BoxedHandler) -> Self {
        Self::from_boxed(handler)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolver = match &self.resolver {
            Resolver::FromOutcome => "outcome".to_string(),
            Resolver::Fixed(t) => format!("{t:?}"),
            Resolver::Custom(_) => "custom".to_string(),
        };
        f.debug_struct("Route")
            .field("handler", &self.handler.name())
            .field("resolver", &resolver)
            .finish()
    }
}
