use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use skein_core::config::RateLimitConfig;
use skein_core::error::{Result, SkeinError};
use skein_core::types::{
    AgentState, ErrorStats, GraphState, Message, MessageMetadata, Role, TaskOutcome, TaskRecord,
    TaskStatus,
};
use skein_core::validator::{validate_agent_state, validate_message_sequence, validate_task_transition};

use crate::rate_limit::UpdateWindow;

struct Inner {
    state: GraphState,
    window: UpdateWindow,
    error_count: u64,
    update_count: u64,
}

/// Sole writer of a conversation's `GraphState`.
///
/// Every mutation takes the same lock, validates, and either applies in
/// full or leaves the state untouched and bumps the error counter. Readers
/// get clones, never references into the live state.
pub struct StateManager {
    inner: Mutex<Inner>,
}

impl StateManager {
    pub fn new(state: GraphState, rate_limit: &RateLimitConfig) -> Self {
        Self::with_window(state, UpdateWindow::from_config(rate_limit))
    }

    pub fn with_window(state: GraphState, window: UpdateWindow) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                window,
                error_count: 0,
                update_count: 0,
            }),
        }
    }

    /// A manager over an empty state for `conversation_id`.
    pub fn fresh(conversation_id: &str, rate_limit: &RateLimitConfig) -> Self {
        Self::new(GraphState::new(conversation_id), rate_limit)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message to the conversation.
    ///
    /// Blank content is rejected and content is stored trimmed. The
    /// timestamp is clamped so the sequence never goes backwards even if
    /// the wall clock does.
    pub fn update_conversation(
        &self,
        role: Role,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<Message> {
        self.update_conversation_batch(vec![(role, content, metadata)])?
            .pop()
            .ok_or_else(|| SkeinError::State("no message appended".into()))
    }

    /// Append several messages as one update: either all land, in order,
    /// or none do. Each message counts against the rate limit.
    pub fn update_conversation_batch(
        &self,
        entries: Vec<(Role, &str, MessageMetadata)>,
    ) -> Result<Vec<Message>> {
        let mut inner = self.lock();

        if entries.iter().any(|(_, content, _)| content.trim().is_empty()) {
            return reject(&mut inner, SkeinError::Validation("message content is empty".into()));
        }

        let n = entries.len() as u32;
        if !inner.window.admit_many(Instant::now(), n) {
            return reject(
                &mut inner,
                SkeinError::StateUpdate("too many rapid state updates".into()),
            );
        }

        let mut prev = inner.state.messages.last().cloned();
        let mut appended = Vec::with_capacity(entries.len());
        for (role, content, metadata) in entries {
            let mut message = Message::new(role, content.trim(), metadata);
            if let Some(last) = prev {
                if message.created_at < last.created_at {
                    message.created_at = last.created_at;
                }
                if !validate_message_sequence(&[last, message.clone()]) {
                    return reject(
                        &mut inner,
                        SkeinError::Validation("message timestamps out of order".into()),
                    );
                }
            }
            prev = Some(message.clone());
            appended.push(message);
        }

        let state = &mut inner.state;
        for message in &appended {
            state.conversation_state.messages.push(message.clone());
            state.messages.push(message.clone());
        }
        if let Some(last) = appended.last() {
            state.conversation_state.last_updated = last.created_at;
        }
        inner.update_count += appended.len() as u64;

        debug!(
            conversation_id = %inner.state.conversation_id(),
            appended = appended.len(),
            messages = inner.state.messages.len(),
            "Conversation updated"
        );
        Ok(appended)
    }

    /// Merge `partial` into an agent's state. The merged map must carry a
    /// `status` entry.
    pub fn update_agent_state(&self, agent_id: &str, partial: AgentState) -> Result<()> {
        let mut inner = self.lock();

        let mut merged = inner
            .state
            .agent_states
            .get(agent_id)
            .cloned()
            .unwrap_or_default();
        merged.extend(partial);

        if !validate_agent_state(agent_id, &merged) {
            return reject(
                &mut inner,
                SkeinError::Validation(format!("agent state for '{}' has no status", agent_id)),
            );
        }

        inner.state.agent_states.insert(agent_id.to_string(), merged);
        Ok(())
    }

    /// Start a new task. Legal only from `Pending`.
    pub fn set_task(&self, label: &str) -> Result<()> {
        let mut inner = self.lock();

        if label.trim().is_empty() {
            return reject(&mut inner, SkeinError::Validation("task label is empty".into()));
        }
        if let Some(ref active) = inner.state.current_task {
            let err = SkeinError::State(format!("task '{}' is still active", active));
            return reject(&mut inner, err);
        }
        transition(&mut inner, TaskStatus::InProgress)?;

        let state = &mut inner.state;
        state.current_task = Some(label.to_string());
        state.task_history.push(TaskRecord {
            label: label.to_string(),
            started_at: Utc::now(),
        });
        info!(conversation_id = %state.conversation_id(), task = %label, "Task started");
        Ok(())
    }

    /// Finish the active task successfully.
    pub fn complete_task(&self, result: &str) -> Result<()> {
        let mut inner = self.lock();
        let label = active_task(&mut inner)?;
        transition(&mut inner, TaskStatus::Completed)?;

        let state = &mut inner.state;
        state
            .agent_results
            .insert(label.clone(), TaskOutcome::success(result));
        state.final_result = Some(result.to_string());
        state.current_task = None;
        info!(conversation_id = %state.conversation_id(), task = %label, "Task completed");
        Ok(())
    }

    /// Finish the active task with an error.
    pub fn fail_task(&self, error: &str) -> Result<()> {
        let mut inner = self.lock();
        let label = active_task(&mut inner)?;
        transition(&mut inner, TaskStatus::Failed)?;

        let state = &mut inner.state;
        state
            .agent_results
            .insert(label.clone(), TaskOutcome::error(error));
        state.current_task = None;
        warn!(conversation_id = %state.conversation_id(), task = %label, error = %error, "Task failed");
        Ok(())
    }

    /// Return the status to `Pending` so the next task can start.
    ///
    /// From `Failed` this is the ordinary retry transition. From `Completed`
    /// it opens a new task cycle; the finished task stays in the history and
    /// results. Refused while a task is active.
    pub fn reset_task(&self) -> Result<()> {
        let mut inner = self.lock();

        if let Some(ref active) = inner.state.current_task {
            let err = SkeinError::State(format!("task '{}' is still active", active));
            return reject(&mut inner, err);
        }

        match inner.state.status() {
            TaskStatus::Pending => Ok(()),
            TaskStatus::Failed => transition(&mut inner, TaskStatus::Pending),
            TaskStatus::Completed => {
                inner.state.conversation_state.current_task_status = TaskStatus::Pending;
                Ok(())
            }
            TaskStatus::InProgress => reject(
                &mut inner,
                SkeinError::State("task in progress without a label".into()),
            ),
        }
    }

    /// Record an outcome under an arbitrary key (for example a failed
    /// branch when no task is active).
    pub fn record_result(&self, key: &str, outcome: TaskOutcome) {
        self.lock()
            .state
            .agent_results
            .insert(key.to_string(), outcome);
    }

    pub fn rename(&self, title: &str) -> Result<()> {
        let mut inner = self.lock();
        let title = title.trim();
        if title.is_empty() {
            return reject(&mut inner, SkeinError::Validation("title is empty".into()));
        }
        inner.state.conversation_state.title = Some(title.to_string());
        Ok(())
    }

    pub fn error_stats(&self) -> ErrorStats {
        let inner = self.lock();
        ErrorStats {
            error_count: inner.error_count,
            update_count: inner.update_count,
        }
    }

    /// Deep copy of the current state.
    pub fn snapshot(&self) -> GraphState {
        self.lock().state.clone()
    }

    pub fn conversation_id(&self) -> String {
        self.lock().state.conversation_id().to_string()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().state.messages.clone()
    }

    pub fn message_count(&self) -> usize {
        self.lock().state.messages.len()
    }

    /// Messages appended after the first `offset`.
    pub fn messages_since(&self, offset: usize) -> Vec<Message> {
        self.lock()
            .state
            .messages
            .iter()
            .skip(offset)
            .cloned()
            .collect()
    }

    pub fn latest_user_content(&self) -> Option<String> {
        self.lock().state.latest_user_content().map(String::from)
    }

    pub fn latest_assistant_content(&self) -> Option<String> {
        self.lock()
            .state
            .latest_assistant_content()
            .map(String::from)
    }

    pub fn current_task(&self) -> Option<String> {
        self.lock().state.current_task.clone()
    }

    pub fn task_status(&self) -> TaskStatus {
        self.lock().state.status()
    }

    pub fn task_count(&self) -> usize {
        self.lock().state.task_history.len()
    }

    pub fn agent_state(&self, agent_id: &str) -> Option<AgentState> {
        self.lock().state.agent_states.get(agent_id).cloned()
    }

    pub fn title(&self) -> Option<String> {
        self.lock().state.conversation_state.title.clone()
    }

    /// Updates admitted in the current rate window, and the window's limit.
    pub fn rate_window_usage(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.window.used(), inner.window.max_updates())
    }
}

fn reject<T>(inner: &mut Inner, err: SkeinError) -> Result<T> {
    inner.error_count += 1;
    warn!(
        conversation_id = %inner.state.conversation_id(),
        error = %err,
        errors = inner.error_count,
        "State update rejected"
    );
    Err(err)
}

fn transition(inner: &mut Inner, to: TaskStatus) -> Result<()> {
    let from = inner.state.status();
    if !validate_task_transition(from, to) {
        return reject(inner, SkeinError::StateTransition { from, to });
    }
    inner.state.conversation_state.current_task_status = to;
    Ok(())
}

fn active_task(inner: &mut Inner) -> Result<String> {
    match inner.state.current_task.clone() {
        Some(label) => Ok(label),
        None => reject(inner, SkeinError::State("no active task".into())),
    }
}
