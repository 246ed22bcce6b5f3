//! Pure checks over conversation state.
//!
//! None of these functions allocate errors; callers pair the boolean with
//! the `SkeinError` variant that fits their operation.

use crate::types::{AgentState, Message, TaskStatus};

/// The fixed set of legal task-status transitions.
const LEGAL_TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    (TaskStatus::Pending, TaskStatus::InProgress),
    (TaskStatus::Pending, TaskStatus::Failed),
    (TaskStatus::InProgress, TaskStatus::Completed),
    (TaskStatus::InProgress, TaskStatus::Failed),
    // retry
    (TaskStatus::Failed, TaskStatus::Pending),
];

pub fn validate_task_transition(from: TaskStatus, to: TaskStatus) -> bool {
    LEGAL_TRANSITIONS.contains(&(from, to))
}

/// True iff every message is timestamped no earlier than its predecessor.
pub fn validate_message_sequence(messages: &[Message]) -> bool {
    messages
        .windows(2)
        .all(|pair| pair[1].created_at >= pair[0].created_at)
}

/// True iff the state carries a `status` entry.
pub fn validate_agent_state(_agent_id: &str, state: &AgentState) -> bool {
    state.contains_key("status")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageMetadata, Role};
    use chrono::{Duration, Utc};

    #[test]
    fn transition_table_is_exact() {
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let expected = LEGAL_TRANSITIONS.contains(&(from, to));
                assert_eq!(validate_task_transition(from, to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn notable_transitions() {
        assert!(validate_task_transition(TaskStatus::Pending, TaskStatus::InProgress));
        assert!(validate_task_transition(TaskStatus::Failed, TaskStatus::Pending));
        assert!(!validate_task_transition(TaskStatus::Pending, TaskStatus::Completed));
        assert!(!validate_task_transition(TaskStatus::Completed, TaskStatus::InProgress));
        assert!(!validate_task_transition(TaskStatus::Completed, TaskStatus::Pending));
        assert!(!validate_task_transition(TaskStatus::InProgress, TaskStatus::InProgress));
    }

    fn msg_at(offset_secs: i64) -> Message {
        let mut m = Message::new(Role::User, "hi", MessageMetadata::default());
        m.created_at = Utc::now() + Duration::seconds(offset_secs);
        m
    }

    #[test]
    fn sequence_ordering() {
        assert!(validate_message_sequence(&[]));
        assert!(validate_message_sequence(&[msg_at(0)]));

        let a = msg_at(0);
        let mut b = a.clone();
        b.created_at = a.created_at;
        assert!(validate_message_sequence(&[a.clone(), b]));

        assert!(validate_message_sequence(&[msg_at(-10), msg_at(0), msg_at(5)]));
        assert!(!validate_message_sequence(&[msg_at(5), msg_at(-10)]));
    }

    #[test]
    fn agent_state_requires_status() {
        let mut state = AgentState::new();
        assert!(!validate_agent_state("mail", &state));
        state.insert("inbox".into(), serde_json::json!(3));
        assert!(!validate_agent_state("mail", &state));
        state.insert("status".into(), serde_json::json!("idle"));
        assert!(validate_agent_state("mail", &state));
    }
}
