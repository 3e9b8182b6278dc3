//! State machine definitions.
//!
//! # Responsibilities
//! - Hold the immutable set of states and transitions, shared by every
//!   instance through an `Arc`
//! - Apply events to instances: guard evaluation, hooks, history
//! - Report pull-based state timeouts as synthetic events
//!
//! # Transition Steps
//! ```text
//! terminal? → reject
//! transitions[from] matching event → first passing guard
//!     → on_exit(from) → action → enter(to) → on_enter(to)
//! ```
//!
//! # Design Decisions
//! - Transitions are indexed by source state, so an event only scans the
//!   transitions leaving the current state
//! - A rejected event leaves the instance untouched
//! - The machine never polls; callers feed `check_timeout` results back in

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::observability::metrics;
use crate::state_machine::instance::{StateMachineInstance, TransitionRecord};

/// Instance context and event payloads.
pub type Context = serde_json::Map<String, Value>;

pub type Guard = Arc<dyn Fn(&Context) -> bool + Send + Sync>;
/// Receives the instance context and the event data.
pub type Action = Arc<dyn Fn(&mut Context, &Context) + Send + Sync>;
pub type Hook = Arc<dyn Fn(&StateMachineInstance) + Send + Sync>;

/// A state in a machine definition.
#[derive(Clone)]
pub struct State {
    pub name: String,
    pub is_terminal: bool,
    pub timeout: Option<Duration>,
    on_enter: Option<Hook>,
    on_exit: Option<Hook>,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_terminal: false,
            timeout: None,
            on_enter: None,
            on_exit: None,
        }
    }

    pub fn terminal(name: impl Into<String>) -> Self {
        Self {
            is_terminal: true,
            ..Self::new(name)
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_enter(mut self, hook: impl Fn(&StateMachineInstance) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Arc::new(hook));
        self
    }

    pub fn on_exit(mut self, hook: impl Fn(&StateMachineInstance) + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Arc::new(hook));
        self
    }

    /// Name of the synthetic event reported when this state times out.
    pub fn timeout_event(&self) -> String {
        format!("{}_timeout", self.name)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("is_terminal", &self.is_terminal)
            .field("timeout", &self.timeout)
            .field("on_enter", &self.on_enter.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .finish()
    }
}

/// An edge between two states, fired by `event`.
#[derive(Clone)]
pub struct Transition {
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    guard: Option<Guard>,
    action: Option<Action>,
}

impl Transition {
    pub fn new(from_state: impl Into<String>, event: impl Into<String>, to_state: impl Into<String>) -> Self {
        Self {
            from_state: from_state.into(),
            to_state: to_state.into(),
            event: event.into(),
            guard: None,
            action: None,
        }
    }

    /// Only fire when `guard` passes on the context merged with the event data.
    pub fn guard(mut self, guard: impl Fn(&Context) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn action(mut self, action: impl Fn(&mut Context, &Context) + Send + Sync + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    fn allows(&self, merged: &Context) -> bool {
        self.guard.as_ref().map_or(true, |guard| guard(merged))
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from_state", &self.from_state)
            .field("to_state", &self.to_state)
            .field("event", &self.event)
            .field("guard", &self.guard.is_some())
            .field("action", &self.action.is_some())
            .finish()
    }
}

/// Invalid machine definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("state machine '{0}' has no states")]
    Empty(String),

    #[error("duplicate state '{0}'")]
    DuplicateState(String),

    #[error("initial state '{0}' is not defined")]
    UnknownInitialState(String),

    #[error("transition '{event}' references undefined state '{state}'")]
    UnknownState { event: String, state: String },

    #[error("terminal state '{state}' has outgoing transition '{event}'")]
    TransitionFromTerminal { state: String, event: String },
}

/// Why an event did not move an instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionRejected {
    #[error("state '{state}' is terminal")]
    Terminal { state: String },

    #[error("no transition for event '{event}' from state '{state}'")]
    NoMatchingTransition { state: String, event: String },

    #[error("all guards rejected event '{event}' from state '{state}'")]
    GuardRejected { state: String, event: String },
}

/// Builder for `StateMachine`.
#[derive(Debug)]
pub struct StateMachineBuilder {
    name: String,
    states: Vec<State>,
    transitions: Vec<Transition>,
    initial_state: Option<String>,
}

impl StateMachineBuilder {
    pub fn state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Defaults to the first state added.
    pub fn initial_state(mut self, name: impl Into<String>) -> Self {
        self.initial_state = Some(name.into());
        self
    }

    pub fn build(self) -> Result<StateMachine, DefinitionError> {
        let initial_state = match self.initial_state {
            Some(initial) => initial,
            None => self
                .states
                .first()
                .map(|s| s.name.clone())
                .ok_or_else(|| DefinitionError::Empty(self.name.clone()))?,
        };

        let mut states = HashMap::with_capacity(self.states.len());
        for state in self.states {
            if states.contains_key(&state.name) {
                return Err(DefinitionError::DuplicateState(state.name));
            }
            states.insert(state.name.clone(), state);
        }
        if !states.contains_key(&initial_state) {
            return Err(DefinitionError::UnknownInitialState(initial_state));
        }

        let mut transitions: HashMap<String, Vec<Transition>> = HashMap::new();
        for transition in self.transitions {
            for endpoint in [&transition.from_state, &transition.to_state] {
                if !states.contains_key(endpoint) {
                    return Err(DefinitionError::UnknownState {
                        event: transition.event.clone(),
                        state: endpoint.clone(),
                    });
                }
            }
            if states[&transition.from_state].is_terminal {
                return Err(DefinitionError::TransitionFromTerminal {
                    state: transition.from_state.clone(),
                    event: transition.event.clone(),
                });
            }
            transitions
                .entry(transition.from_state.clone())
                .or_default()
                .push(transition);
        }

        Ok(StateMachine {
            inner: Arc::new(Definition {
                name: self.name,
                states,
                transitions,
                initial_state,
            }),
        })
    }
}

#[derive(Debug)]
struct Definition {
    name: String,
    states: HashMap<String, State>,
    transitions: HashMap<String, Vec<Transition>>,
    initial_state: String,
}

/// A named finite-state machine. Cheap to clone; clones share the definition.
#[derive(Debug, Clone)]
pub struct StateMachine {
    inner: Arc<Definition>,
}

impl StateMachine {
    pub fn builder(name: impl Into<String>) -> StateMachineBuilder {
        StateMachineBuilder {
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial_state: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn initial_state(&self) -> &str {
        &self.inner.initial_state
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.inner.states.get(name)
    }

    /// New instance in the initial state. Fires the initial state's `on_enter`.
    pub fn create_instance(&self, instance_id: impl Into<String>, context: Option<Context>) -> StateMachineInstance {
        let instance = StateMachineInstance::new(
            instance_id.into(),
            self.inner.initial_state.clone(),
            context.unwrap_or_default(),
        );
        tracing::debug!(
            machine = %self.inner.name,
            instance = %instance.instance_id(),
            state = %instance.current_state(),
            "Created state machine instance"
        );
        if let Some(hook) = self.state(&self.inner.initial_state).and_then(|s| s.on_enter.as_ref()) {
            hook(&instance);
        }
        instance
    }

    /// Apply `event`. Returns false when the event was rejected, in which
    /// case the instance is unchanged.
    pub fn transition(&self, instance: &mut StateMachineInstance, event: &str, data: Option<Context>) -> bool {
        self.try_transition(instance, event, data).is_ok()
    }

    /// Apply `event`, reporting why it was rejected.
    pub fn try_transition(
        &self,
        instance: &mut StateMachineInstance,
        event: &str,
        data: Option<Context>,
    ) -> Result<TransitionRecord, TransitionRejected> {
        let from = instance.current_state().to_string();
        let result = self.select(instance, &from, event, data.as_ref());

        let transition = match result {
            Ok(transition) => transition,
            Err(rejected) => {
                tracing::debug!(
                    machine = %self.inner.name,
                    instance = %instance.instance_id(),
                    %rejected,
                    "Transition rejected"
                );
                return Err(rejected);
            }
        };

        if let Some(hook) = self.state(&from).and_then(|s| s.on_exit.as_ref()) {
            hook(&*instance);
        }
        let data = data.unwrap_or_default();
        if let Some(action) = &transition.action {
            action(instance.context_mut(), &data);
        }
        let record = instance.enter(&transition.to_state, event, data);
        if let Some(hook) = self.state(&transition.to_state).and_then(|s| s.on_enter.as_ref()) {
            hook(&*instance);
        }

        tracing::debug!(
            machine = %self.inner.name,
            instance = %instance.instance_id(),
            from = %record.from,
            to = %record.to,
            event,
            "State transition"
        );
        metrics::record_state_transition(&self.inner.name, event);
        Ok(record)
    }

    /// Synthetic `"{state}_timeout"` event if the current state has been
    /// held longer than its timeout.
    pub fn check_timeout(&self, instance: &StateMachineInstance) -> Option<String> {
        self.check_timeout_at(instance, Instant::now())
    }

    pub fn check_timeout_at(&self, instance: &StateMachineInstance, now: Instant) -> Option<String> {
        let state = self.state(instance.current_state())?;
        let timeout = state.timeout?;
        (instance.time_in_state(now) > timeout).then(|| state.timeout_event())
    }

    /// Events with at least one transition out of the current state, in
    /// definition order.
    pub fn get_available_events(&self, instance: &StateMachineInstance) -> Vec<String> {
        let mut seen = HashSet::new();
        self.inner
            .transitions
            .get(instance.current_state())
            .into_iter()
            .flatten()
            .filter(|t| seen.insert(t.event.as_str()))
            .map(|t| t.event.clone())
            .collect()
    }

    pub fn is_terminal(&self, instance: &StateMachineInstance) -> bool {
        self.state(instance.current_state()).is_some_and(|s| s.is_terminal)
    }

    fn select(
        &self,
        instance: &StateMachineInstance,
        from: &str,
        event: &str,
        data: Option<&Context>,
    ) -> Result<&Transition, TransitionRejected> {
        if self.state(from).map_or(true, |s| s.is_terminal) {
            return Err(TransitionRejected::Terminal { state: from.to_string() });
        }

        let mut candidates = self
            .inner
            .transitions
            .get(from)
            .into_iter()
            .flatten()
            .filter(|t| t.event == event)
            .peekable();
        if candidates.peek().is_none() {
            return Err(TransitionRejected::NoMatchingTransition {
                state: from.to_string(),
                event: event.to_string(),
            });
        }

        let mut merged = instance.context().clone();
        if let Some(data) = data {
            merged.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        candidates.find(|t| t.allows(&merged)).ok_or_else(|| TransitionRejected::GuardRejected {
            state: from.to_string(),
            event: event.to_string(),
        })
    }
}
