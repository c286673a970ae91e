//! Conversation state machines.
//!
//! A [`ConversationHandler`] is a single [`Handler`] that owns a private
//! set of routes and remembers, per [`ConversationKey`], which state the
//! conversation is in:
//!
//! - With no active conversation, only the **entry points** are consulted.
//! - With an active one, the entry points (only if `allow_reentry`), then
//!   the routes of the current **state**, then the **fallbacks**.
//! - If nothing matches, the update is not consumed and dispatch moves on.
//!
//! After a route ran, its [`Route`] resolver turns the outcome into a
//! [`Transition`]: stay, move to another state, or end (which forgets the
//! key).
//!
//! # Concurrency
//!
//! Updates of one key never run routes concurrently. With `block(true)`
//! (the default) a second update waits for the first; the wait is bounded
//! by the conversation timeout when one is set. With `block(false)` the
//! route runs in the background and updates arriving meanwhile go to the
//! **waiting** routes, or are dropped with a warning.
//!
//! # Timeouts
//!
//! With `timeout(d)`, every transition into a state (re)arms a per-key timer.
//! When it fires, the **timeout** routes run against the last update and the
//! conversation ends. Timers are disarmed by any later transition and by
//! application shutdown.
//!
//! # Nesting
//!
//! A conversation can be a route of another conversation. With
//! `map_to_parent(child_state, transition)`, reaching `child_state` ends the
//! child and applies `transition` to the parent.
//!
//! # Example
//!
//! ```rust,ignore
//! const NAME: State = State::from_static("NAME");
//! const AGE: State = State::from_static("AGE");
//!
//! let signup = ConversationHandler::builder()
//!     .name("signup")
//!     .persistent(true)
//!     .entry(Route::from(on_command("start").handler(ask_name)).to(NAME))
//!     .state(NAME, [Route::from(on_message(filters::text()).handler(save_name)).to(AGE)])
//!     .state(AGE, [Route::from(on_message(filters::regex(r"^\d+$")?).handler(save_age)).end()])
//!     .fallback(on_command("cancel").handler(cancel))
//!     .timeout(Duration::from_secs(300))
//!     .build()?;
//!
//! app.add_handler(signup, 0);
//! ```

mod key;
mod route;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use courier_core::Update;

use crate::context::DispatchContext;
use crate::error::{ConversationError, StopPropagation, as_stop_signal};
use crate::handler::{Handler, HandlerResult, Matched};
use crate::outcome::{Outcome, State, Transition};
use crate::store::DataStore;

pub use key::ConversationKey;
pub use route::Route;

use key::KeyStrategy;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ConversationHandler`].
#[derive(Debug)]
pub struct ConversationBuilder {
    entry_points: Vec<Route>,
    states: HashMap<State, Vec<Route>>,
    fallbacks: Vec<Route>,
    timeout_routes: Vec<Route>,
    waiting_routes: Vec<Route>,
    keys: KeyStrategy,
    allow_reentry: bool,
    block: bool,
    timeout: Option<Duration>,
    map_to_parent: HashMap<State, Transition>,
    end_to_parent: Option<Transition>,
    name: Option<String>,
    persistent: bool,
}

impl Default for ConversationBuilder {
    fn default() -> Self {
        Self {
            entry_points: Vec::new(),
            states: HashMap::new(),
            fallbacks: Vec::new(),
            timeout_routes: Vec::new(),
            waiting_routes: Vec::new(),
            keys: KeyStrategy::default(),
            allow_reentry: false,
            block: true,
            timeout: None,
            map_to_parent: HashMap::new(),
            end_to_parent: None,
            name: None,
            persistent: false,
        }
    }
}

impl ConversationBuilder {
    /// Adds an entry point.
    pub fn entry(mut self, route: impl Into<Route>) -> Self {
        self.entry_points.push(route.into());
        self
    }

    /// Adds routes for `state`.
    pub fn state<I, R>(mut self, state: impl Into<State>, routes: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Route>,
    {
        self.states
            .entry(state.into())
            .or_default()
            .extend(routes.into_iter().map(Into::into));
        self
    }

    /// Adds a fallback, tried when no route of the current state matches.
    pub fn fallback(mut self, route: impl Into<Route>) -> Self {
        self.fallbacks.push(route.into());
        self
    }

    /// Adds a route that runs when the conversation times out.
    pub fn on_timeout(mut self, route: impl Into<Route>) -> Self {
        self.timeout_routes.push(route.into());
        self
    }

    /// Adds a route for updates that arrive while a non-blocking route of
    /// the same key is still running.
    pub fn waiting(mut self, route: impl Into<Route>) -> Self {
        self.waiting_routes.push(route.into());
        self
    }

    /// Keys conversations by chat. Default `true`.
    pub fn per_chat(mut self, enabled: bool) -> Self {
        self.keys.per_chat = enabled;
        self
    }

    /// Keys conversations by user. Default `true`.
    pub fn per_user(mut self, enabled: bool) -> Self {
        self.keys.per_user = enabled;
        self
    }

    /// Keys conversations by the message a callback query belongs to.
    /// Default `false`.
    pub fn per_message(mut self, enabled: bool) -> Self {
        self.keys.per_message = enabled;
        self
    }

    /// Lets entry points restart an active conversation. Default `false`.
    pub fn allow_reentry(mut self, allow: bool) -> Self {
        self.allow_reentry = allow;
        self
    }

    /// Whether dispatch waits for routes. Default `true`.
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Ends conversations that stay idle for `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reaching `state` ends this conversation and applies `transition` to
    /// the parent conversation.
    pub fn map_to_parent(mut self, state: impl Into<State>, transition: Transition) -> Self {
        self.map_to_parent.insert(state.into(), transition);
        self
    }

    /// Ending this conversation applies `transition` to the parent.
    pub fn map_end_to_parent(mut self, transition: Transition) -> Self {
        self.end_to_parent = Some(transition);
        self
    }

    /// Names the conversation; required for persistence.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stores states in the data store so they survive restarts.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Validates the configuration.
    pub fn build(self) -> Result<ConversationHandler, ConversationError> {
        let label = self
            .name
            .clone()
            .unwrap_or_else(|| "conversation".to_string());

        if self.keys.is_empty() {
            return Err(ConversationError::NoKeyStrategy(label));
        }
        if self.entry_points.is_empty() {
            return Err(ConversationError::NoEntryPoints(label));
        }
        if self.persistent && self.name.is_none() {
            return Err(ConversationError::UnnamedPersistent);
        }
        if self.keys.per_message && !self.keys.per_chat && !self.keys.per_user {
            debug!(conversation = %label, "Keyed by message only; states are shared across users");
        }

        Ok(ConversationHandler {
            inner: Arc::new(Inner {
                label,
                name: self.name,
                entry_points: self.entry_points,
                states: self.states,
                fallbacks: self.fallbacks,
                timeout_routes: self.timeout_routes,
                waiting_routes: self.waiting_routes,
                keys: self.keys,
                allow_reentry: self.allow_reentry,
                block: self.block,
                timeout: self.timeout,
                map_to_parent: self.map_to_parent,
                end_to_parent: self.end_to_parent,
                persistent: self.persistent,
                tables: Mutex::new(Tables::default()),
            }),
        })
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct Timer {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Tables {
    states: HashMap<ConversationKey, State>,
    /// Keys with a route or timeout currently running.
    busy: HashSet<ConversationKey>,
    timers: HashMap<ConversationKey, Timer>,
    locks: HashMap<ConversationKey, Arc<AsyncMutex<()>>>,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Entry,
    State(State),
    Fallback,
}

struct Selection {
    slot: Slot,
    index: usize,
    matched: Matched,
}

/// What `check` decided, carried to `handle`.
enum Claim {
    /// A route matched for the state seen at check time.
    Route {
        key: ConversationKey,
        seen: Option<State>,
        selection: Selection,
    },
    /// The key is busy; wait for it and match again.
    Wait { key: ConversationKey },
    /// The key is busy and a waiting route matched.
    Waiting {
        key: ConversationKey,
        index: usize,
        matched: Matched,
    },
    /// The key is busy and nothing handles that.
    Busy { key: ConversationKey },
}

struct Inner {
    label: String,
    name: Option<String>,
    entry_points: Vec<Route>,
    states: HashMap<State, Vec<Route>>,
    fallbacks: Vec<Route>,
    timeout_routes: Vec<Route>,
    waiting_routes: Vec<Route>,
    keys: KeyStrategy,
    allow_reentry: bool,
    block: bool,
    timeout: Option<Duration>,
    map_to_parent: HashMap<State, Transition>,
    end_to_parent: Option<Transition>,
    persistent: bool,
    tables: Mutex<Tables>,
}

/// Exclusive access to one key. Clears the busy mark on drop.
struct KeyGuard {
    inner: Arc<Inner>,
    key: ConversationKey,
    _lock: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut tables = self.inner.tables.lock();
        tables.busy.remove(&self.key);

        // Forget the lock of an idle key nobody else is waiting on. The map
        // and this guard hold one reference each.
        let idle = !tables.states.contains_key(&self.key) && !tables.timers.contains_key(&self.key);
        if idle
            && tables
                .locks
                .get(&self.key)
                .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            tables.locks.remove(&self.key);
        }
    }
}

fn first_match(routes: &[Route], update: &Update) -> Option<(usize, Matched)> {
    routes
        .iter()
        .enumerate()
        .find_map(|(index, route)| Some((index, route.handler.check(update)?)))
}

impl Inner {
    fn state_of(&self, key: &ConversationKey) -> Option<State> {
        self.tables.lock().states.get(key).cloned()
    }

    fn routes(&self, slot: &Slot) -> &[Route] {
        match slot {
            Slot::Entry => &self.entry_points,
            Slot::State(state) => self.states.get(state).map(Vec::as_slice).unwrap_or(&[]),
            Slot::Fallback => &self.fallbacks,
        }
    }

    /// Finds the route for `update` given the current state.
    fn select(&self, state: Option<&State>, update: &Update) -> Option<Selection> {
        let mut slots = Vec::with_capacity(3);
        match state {
            None => slots.push(Slot::Entry),
            Some(state) => {
                if self.allow_reentry {
                    slots.push(Slot::Entry);
                }
                slots.push(Slot::State(state.clone()));
                slots.push(Slot::Fallback);
            }
        }

        slots.into_iter().find_map(|slot| {
            let (index, matched) = first_match(self.routes(&slot), update)?;
            Some(Selection {
                slot,
                index,
                matched,
            })
        })
    }

    fn lock_for(&self, key: &ConversationKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.tables.lock().locks.entry(key.clone()).or_default())
    }

    /// Takes exclusive access to `key`, honouring the blocking mode.
    async fn acquire(self: &Arc<Self>, key: &ConversationKey) -> Option<KeyGuard> {
        let lock = self.lock_for(key);
        let guard = if self.block {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, lock.lock_owned()).await.ok()?,
                None => lock.lock_owned().await,
            }
        } else {
            lock.try_lock_owned().ok()?
        };

        self.tables.lock().busy.insert(key.clone());
        Some(KeyGuard {
            inner: Arc::clone(self),
            key: key.clone(),
            _lock: guard,
        })
    }

    fn set_state(&self, key: &ConversationKey, state: Option<&State>, store: &DataStore) {
        {
            let mut tables = self.tables.lock();
            match state {
                Some(state) => {
                    tables.states.insert(key.clone(), state.clone());
                }
                None => {
                    tables.states.remove(key);
                }
            }
        }
        if self.persistent
            && let Some(name) = &self.name
        {
            store.set_conversation(name, key, state);
        }
    }

    /// Runs a route for `key` under its lock.
    async fn run(
        self: &Arc<Self>,
        key: ConversationKey,
        preselected: Option<(Option<State>, Selection)>,
        ctx: Arc<DispatchContext>,
    ) -> HandlerResult {
        let Some(guard) = self.acquire(&key).await else {
            return self.busy(&key, ctx).await;
        };

        let current = self.state_of(&key);
        let selection = match preselected {
            Some((seen, selection)) if seen == current => selection,
            _ => match self.select(current.as_ref(), ctx.update()) {
                Some(selection) => selection,
                None => {
                    trace!(conversation = %self.label, %key, "No route matches after waiting");
                    return Ok(Outcome::fall_through());
                }
            },
        };
        let Some(route) = self.routes(&selection.slot).get(selection.index) else {
            return Ok(Outcome::fall_through());
        };

        debug!(
            conversation = %self.label,
            %key,
            state = ?current,
            route = route.handler.name(),
            "Running conversation route"
        );
        let result = route
            .handler
            .handle(selection.matched, Arc::clone(&ctx))
            .await;

        if !result.as_ref().map_or(true, Outcome::is_consumed) {
            return result;
        }
        let transition = match &result {
            Ok(outcome) => route.transition_for(outcome),
            Err(err) => match as_stop_signal(err) {
                Some(stop) => stop.transition().cloned().unwrap_or_default(),
                None => Transition::Stay,
            },
        };
        let parent = self.apply(&key, transition, current, &ctx);
        drop(guard);

        match result {
            Ok(outcome) => Ok(outcome.with_transition(parent)),
            Err(err) if as_stop_signal(&err).is_some() => {
                Err(StopPropagation::with_transition(parent).into())
            }
            Err(err) => Err(err),
        }
    }

    /// Handles an update for a key that is already busy.
    async fn busy(self: &Arc<Self>, key: &ConversationKey, ctx: Arc<DispatchContext>) -> HandlerResult {
        if !self.block
            && let Some((index, matched)) = first_match(&self.waiting_routes, ctx.update())
        {
            return self.run_waiting(key, index, matched, ctx).await;
        }
        warn!(
            conversation = %self.label,
            %key,
            update_id = ctx.update().update_id,
            "Conversation is busy, dropping update"
        );
        Ok(Outcome::handled())
    }

    async fn run_waiting(
        &self,
        key: &ConversationKey,
        index: usize,
        matched: Matched,
        ctx: Arc<DispatchContext>,
    ) -> HandlerResult {
        let Some(route) = self.waiting_routes.get(index) else {
            return Ok(Outcome::fall_through());
        };
        debug!(conversation = %self.label, %key, route = route.handler.name(), "Running waiting route");
        let outcome = route.handler.handle(matched, ctx).await?;
        Ok(outcome.with_transition(Transition::Stay))
    }

    /// Applies `transition` to `key` and returns the transition for the
    /// parent conversation.
    fn apply(
        self: &Arc<Self>,
        key: &ConversationKey,
        transition: Transition,
        current: Option<State>,
        ctx: &Arc<DispatchContext>,
    ) -> Transition {
        let (next, parent) = match transition {
            Transition::Stay => (current.clone(), Transition::Stay),
            Transition::End => (None, self.end_to_parent.clone().unwrap_or_default()),
            Transition::To(state) => match self.map_to_parent.get(&state) {
                Some(parent) => (None, parent.clone()),
                None => {
                    if !self.states.contains_key(&state) {
                        warn!(
                            conversation = %self.label,
                            %key,
                            %state,
                            "Moving to a state without routes"
                        );
                    }
                    (Some(state), Transition::Stay)
                }
            },
        };

        if next != current {
            debug!(
                conversation = %self.label,
                %key,
                from = ?current,
                to = ?next,
                "Conversation state changed"
            );
            self.set_state(key, next.as_ref(), ctx.store());
        }

        match next {
            Some(_) => self.arm_timeout(key, ctx),
            None => self.disarm_timeout(key),
        }
        parent
    }

    fn arm_timeout(self: &Arc<Self>, key: &ConversationKey, ctx: &Arc<DispatchContext>) {
        let Some(limit) = self.timeout else {
            return;
        };

        let token = CancellationToken::new();
        let generation = {
            let mut tables = self.tables.lock();
            tables.generation += 1;
            let generation = tables.generation;
            let timer = Timer {
                generation,
                token: token.clone(),
            };
            if let Some(previous) = tables.timers.insert(key.clone(), timer) {
                previous.token.cancel();
            }
            generation
        };

        let inner = Arc::clone(self);
        let key = key.clone();
        let ctx = Arc::clone(ctx);
        let stop = ctx.env().stop_token().clone();
        let tracker = ctx.env().tracker().clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(limit) => inner.expire(key, generation, ctx).await,
            }
        });
    }

    fn disarm_timeout(&self, key: &ConversationKey) {
        if let Some(timer) = self.tables.lock().timers.remove(key) {
            timer.token.cancel();
        }
    }

    /// Ends the conversation of `key` after its timer fired.
    async fn expire(self: Arc<Self>, key: ConversationKey, generation: u64, ctx: Arc<DispatchContext>) {
        let lock = self.lock_for(&key);
        let guard = lock.lock_owned().await;
        {
            let mut tables = self.tables.lock();
            match tables.timers.get(&key) {
                Some(timer) if timer.generation == generation => {
                    tables.timers.remove(&key);
                }
                // Re-armed or disarmed while we waited for the lock.
                _ => return,
            }
            tables.busy.insert(key.clone());
        }
        let _guard = KeyGuard {
            inner: Arc::clone(&self),
            key: key.clone(),
            _lock: guard,
        };

        debug!(
            conversation = %self.label,
            %key,
            state = ?self.state_of(&key),
            "Conversation timed out"
        );
        let ctx = ctx.fork();
        for route in &self.timeout_routes {
            let Some(matched) = route.handler.check(ctx.update()) else {
                continue;
            };
            match route.handler.handle(matched, Arc::clone(&ctx)).await {
                Ok(_) => {}
                Err(err) if as_stop_signal(&err).is_some() => {
                    warn!(conversation = %self.label, "Stopping propagation has no effect in timeout routes");
                }
                Err(err) => ctx.report_error(err).await,
            }
        }
        self.set_state(&key, None, ctx.store());
    }

    fn all_routes(&self) -> impl Iterator<Item = &Route> {
        self.entry_points
            .iter()
            .chain(self.states.values().flatten())
            .chain(&self.fallbacks)
            .chain(&self.timeout_routes)
            .chain(&self.waiting_routes)
    }
}

// ============================================================================
// ConversationHandler
// ============================================================================

/// A handler that runs a per-key state machine over its routes.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConversationHandler {
    inner: Arc<Inner>,
}

impl ConversationHandler {
    pub fn builder() -> ConversationBuilder {
        ConversationBuilder::default()
    }

    /// Returns the key `update` belongs to, if it has one.
    pub fn key_for(&self, update: &Update) -> Option<ConversationKey> {
        self.inner.keys.key_for(update)
    }

    /// Returns the current state of `key`.
    pub fn state_of(&self, key: &ConversationKey) -> Option<State> {
        self.inner.state_of(key)
    }

    /// Returns all active conversations.
    pub fn active(&self) -> HashMap<ConversationKey, State> {
        self.inner.tables.lock().states.clone()
    }

    /// Returns `true` if a timeout is armed for `key`.
    pub fn has_timer(&self, key: &ConversationKey) -> bool {
        self.inner.tables.lock().timers.contains_key(key)
    }
}

#[async_trait]
impl Handler for ConversationHandler {
    fn name(&self) -> &str {
        &self.inner.label
    }

    fn check(&self, update: &Update) -> Option<Matched> {
        let inner = &self.inner;
        let key = inner.keys.key_for(update)?;
        let (busy, state) = {
            let tables = inner.tables.lock();
            (tables.busy.contains(&key), tables.states.get(&key).cloned())
        };

        let claim = if busy && inner.block {
            Claim::Wait { key }
        } else if busy {
            match first_match(&inner.waiting_routes, update) {
                Some((index, matched)) => Claim::Waiting {
                    key,
                    index,
                    matched,
                },
                None => Claim::Busy { key },
            }
        } else {
            let selection = inner.select(state.as_ref(), update)?;
            Claim::Route {
                key,
                seen: state,
                selection,
            }
        };
        Some(Matched::new().with_data(claim))
    }

    async fn handle(&self, mut matched: Matched, ctx: Arc<DispatchContext>) -> HandlerResult {
        let Some(claim) = matched.take_data::<Claim>() else {
            return Ok(Outcome::fall_through());
        };
        match claim {
            Claim::Route {
                key,
                seen,
                selection,
            } => self.inner.run(key, Some((seen, selection)), ctx).await,
            Claim::Wait { key } => self.inner.run(key, None, ctx).await,
            Claim::Waiting {
                key,
                index,
                matched,
            } => self.inner.run_waiting(&key, index, matched, ctx).await,
            Claim::Busy { key } => self.inner.busy(&key, ctx).await,
        }
    }

    fn is_blocking(&self) -> bool {
        self.inner.block
    }

    fn persistent_name(&self) -> Option<&str> {
        let inner = &self.inner;
        if inner.persistent {
            inner.name.as_deref()
        } else {
            None
        }
    }

    fn restore(&self, store: &DataStore) {
        let inner = &self.inner;
        if inner.persistent
            && let Some(name) = &inner.name
        {
            let saved = store.conversations(name);
            debug!(conversation = %inner.label, count = saved.len(), "Restored conversation states");
            inner.tables.lock().states = saved.into_iter().collect();
        }
        for route in inner.all_routes() {
            route.handler.restore(store);
        }
    }
}

impl std::fmt::Debug for ConversationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = &self.inner;
        f.debug_struct("ConversationHandler")
            .field("name", &inner.label)
            .field("entry_points", &inner.entry_points.len())
            .field("states", &inner.states.keys().collect::<Vec<_>>())
            .field("block", &inner.block)
            .field("timeout", &inner.timeout)
            .field("persistent", &inner.persistent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Matcher;

    async fn noop() {}

    fn matcher() -> Matcher {
        Matcher::new().handler(noop)
    }

    #[test]
    fn test_build_validation() {
        let no_keys = ConversationHandler::builder()
            .entry(matcher())
            .per_chat(false)
            .per_user(false)
            .build();
        assert!(matches!(no_keys, Err(ConversationError::NoKeyStrategy(_))));

        let no_entry = ConversationHandler::builder().build();
        assert!(matches!(no_entry, Err(ConversationError::NoEntryPoints(_))));

        let unnamed = ConversationHandler::builder()
            .entry(matcher())
            .persistent(true)
            .build();
        assert!(matches!(unnamed, Err(ConversationError::UnnamedPersistent)));
    }

    #[test]
    fn test_route_resolvers() {
        let pinned = Route::from(matcher()).to("B");
        assert_eq!(
            pinned.transition_for(&Outcome::goto("C")),
            Transition::To(State::from("B"))
        );

        let from_outcome = Route::from(matcher());
        assert_eq!(from_outcome.transition_for(&Outcome::end()), Transition::End);

        let custom = Route::from(matcher()).resolve(|outcome| match outcome.flow() {
            crate::outcome::Flow::Stop => Transition::End,
            _ => Transition::Stay,
        });
        assert_eq!(custom.transition_for(&Outcome::stop()), Transition::End);
    }
}
