//! Ready-made lifecycles.
//!
//! ```text
//! decision:
//!   pending → analyzing → awaiting_approval → approved → executing → completed
//!                      ↘ approved (no approval needed)            ↘ failed
//!   pending/analyzing/awaiting_approval → cancelled | rejected | expired
//!
//! incident:
//!   detected → triaging → mitigating → resolved → closed
//!        ↘ escalated ↗          ↘ escalated    ↘ triaging (reopen)
//! ```

use std::time::Duration;

use serde_json::Value;

use crate::state_machine::definition::{Context, DefinitionError, State, StateMachine, Transition};

pub const DECISION_PENDING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DECISION_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DECISION_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub const INCIDENT_DETECTED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const INCIDENT_TRIAGE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const INCIDENT_MITIGATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

fn is_true(context: &Context, key: &str) -> bool {
    context.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn has_text(context: &Context, key: &str) -> bool {
    context.get(key).and_then(Value::as_str).is_some_and(|s| !s.is_empty())
}

/// Lifecycle of a decision that may need human approval before execution.
///
/// `analysis_complete` goes to `awaiting_approval` when the context has
/// `requires_approval: true`, otherwise straight to `approved`. `approve`
/// needs a non-empty `approver`.
pub fn decision_lifecycle() -> Result<StateMachine, DefinitionError> {
    let mut builder = StateMachine::builder("decision")
        .state(State::new("pending").timeout(DECISION_PENDING_TIMEOUT))
        .state(State::new("analyzing"))
        .state(State::new("awaiting_approval").timeout(DECISION_APPROVAL_TIMEOUT))
        .state(State::new("approved"))
        .state(State::new("executing").timeout(DECISION_EXECUTION_TIMEOUT))
        .state(State::terminal("completed"))
        .state(State::terminal("failed"))
        .state(State::terminal("rejected"))
        .state(State::terminal("cancelled"))
        .state(State::terminal("expired"))
        .initial_state("pending")
        .transition(Transition::new("pending", "start_analysis", "analyzing"))
        .transition(Transition::new("pending", "pending_timeout", "expired"))
        .transition(
            Transition::new("analyzing", "analysis_complete", "awaiting_approval")
                .guard(|c| is_true(c, "requires_approval")),
        )
        .transition(Transition::new("analyzing", "analysis_complete", "approved"))
        .transition(Transition::new("analyzing", "analysis_failed", "failed"))
        .transition(Transition::new("awaiting_approval", "approve", "approved").guard(|c| has_text(c, "approver")))
        .transition(Transition::new("awaiting_approval", "reject", "rejected"))
        .transition(Transition::new("awaiting_approval", "awaiting_approval_timeout", "expired"))
        .transition(Transition::new("approved", "execute", "executing"))
        .transition(Transition::new("executing", "execution_succeeded", "completed"))
        .transition(Transition::new("executing", "execution_failed", "failed"))
        .transition(Transition::new("executing", "executing_timeout", "failed"));

    for from in ["pending", "analyzing", "awaiting_approval"] {
        builder = builder.transition(Transition::new(from, "cancel", "cancelled"));
    }
    builder.build()
}

/// Lifecycle of an operational incident.
///
/// Every timeout escalates. `close` needs a non-empty `root_cause`.
pub fn incident_lifecycle() -> Result<StateMachine, DefinitionError> {
    StateMachine::builder("incident")
        .state(State::new("detected").timeout(INCIDENT_DETECTED_TIMEOUT))
        .state(State::new("triaging").timeout(INCIDENT_TRIAGE_TIMEOUT))
        .state(State::new("escalated"))
        .state(State::new("mitigating").timeout(INCIDENT_MITIGATION_TIMEOUT))
        .state(State::new("resolved"))
        .state(State::terminal("closed"))
        .initial_state("detected")
        .transition(Transition::new("detected", "triage", "triaging"))
        .transition(Transition::new("detected", "detected_timeout", "escalated"))
        .transition(Transition::new("triaging", "mitigate", "mitigating"))
        .transition(Transition::new("triaging", "escalate", "escalated"))
        .transition(Transition::new("triaging", "triaging_timeout", "escalated"))
        .transition(Transition::new("escalated", "mitigate", "mitigating"))
        .transition(Transition::new("mitigating", "resolve", "resolved"))
        .transition(Transition::new("mitigating", "mitigation_failed", "escalated"))
        .transition(Transition::new("mitigating", "mitigating_timeout", "escalated"))
        .transition(Transition::new("resolved", "reopen", "triaging"))
        .transition(Transition::new("resolved", "close", "closed").guard(|c| has_text(c, "root_cause")))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Option<Context> {
        value.as_object().cloned()
    }

    #[test]
    fn test_decision_auto_approval_path() {
        let machine = decision_lifecycle().unwrap();
        let mut decision = machine.create_instance("d-1", None);

        for event in ["start_analysis", "analysis_complete", "execute", "execution_succeeded"] {
            assert!(machine.transition(&mut decision, event, None), "{event}");
        }
        assert_eq!(decision.current_state(), "completed");
        assert!(machine.is_terminal(&decision));
    }

    #[test]
    fn test_decision_requires_approver() {
        let machine = decision_lifecycle().unwrap();
        let mut decision = machine.create_instance("d-2", data(json!({"requires_approval": true})));

        assert!(machine.transition(&mut decision, "start_analysis", None));
        assert!(machine.transition(&mut decision, "analysis_complete", None));
        assert_eq!(decision.current_state(), "awaiting_approval");

        assert!(!machine.transition(&mut decision, "approve", None));
        assert!(machine.transition(&mut decision, "approve", data(json!({"approver": "ops"}))));
        assert_eq!(decision.current_state(), "approved");

        let mut events = machine.get_available_events(&decision);
        events.sort();
        assert_eq!(events, vec!["execute".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incident_triage_timeout_escalates() {
        let machine = incident_lifecycle().unwrap();
        let mut incident = machine.create_instance("inc-1", None);
        assert!(machine.transition(&mut incident, "triage", None));

        tokio::time::advance(INCIDENT_TRIAGE_TIMEOUT + Duration::from_secs(1)).await;
        let event = machine.check_timeout(&incident).unwrap();
        assert_eq!(event, "triaging_timeout");
        assert!(machine.transition(&mut incident, &event, None));
        assert_eq!(incident.current_state(), "escalated");
        assert_eq!(machine.check_timeout(&incident), None);
    }

    #[test]
    fn test_incident_close_needs_root_cause() {
        let machine = incident_lifecycle().unwrap();
        let mut incident = machine.create_instance("inc-2", None);
        for event in ["triage", "mitigate", "resolve"] {
            assert!(machine.transition(&mut incident, event, None));
        }
        assert!(!machine.transition(&mut incident, "close", None));
        assert!(machine.transition(&mut incident, "close", data(json!({"root_cause": "bad deploy"}))));
        assert!(machine.is_terminal(&incident));
        assert_eq!(incident.history().len(), 4);
    }
}
