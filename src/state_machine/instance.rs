//! State machine instances and their transition history.

use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;

use crate::state_machine::definition::Context;

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub event: String,
    pub timestamp: SystemTime,
}

/// A tracked unit of work. Only `StateMachine` moves it between states.
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineInstance {
    instance_id: String,
    current_state: String,
    context: Context,
    #[serde(skip)]
    entered_at: Instant,
    state_entered_at: SystemTime,
    transition_history: Vec<TransitionRecord>,
}

impl StateMachineInstance {
    pub(crate) fn new(instance_id: String, initial_state: String, context: Context) -> Self {
        Self {
            instance_id,
            current_state: initial_state,
            context,
            entered_at: Instant::now(),
            state_entered_at: SystemTime::now(),
            transition_history: Vec::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn state_entered_at(&self) -> SystemTime {
        self.state_entered_at
    }

    /// Time spent in the current state as of `now`.
    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.transition_history
    }

    pub(crate) fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Move to `to`, merging `data` into the context and recording history.
    pub(crate) fn enter(&mut self, to: &str, event: &str, data: Context) -> TransitionRecord {
        let record = TransitionRecord {
            from: std::mem::replace(&mut self.current_state, to.to_string()),
            to: to.to_string(),
            event: event.to_string(),
            timestamp: SystemTime::now(),
        };
        self.context.extend(data);
        self.entered_at = Instant::now();
        self.state_entered_at = record.timestamp;
        self.transition_history.push(record.clone());
        record
    }
}
