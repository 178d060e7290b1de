//! Conversation state as a pure reducer over an immutable message list.
//!
//! Every action produces a new `Conversation`. The message vector is shared
//! through an `Arc` and copied on write, so a snapshot handed to a renderer
//! never changes under it.

use crate::types::*;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Arc<Vec<Message>>,
    /// Index of the assistant message currently receiving deltas.
    open_slot: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationAction {
    Delta(StreamDelta),
    AppendUser(Message),
    /// A finished assistant message from a single-shot response.
    AppendAssistant(Message),
    AppendError {
        header: String,
        message: String,
    },
    CloseTurn,
    SetToolStatus {
        tool_call_id: String,
        status: ToolCallStatus,
        diff_stats: Option<DiffStats>,
    },
    Truncate(usize),
    Replace(Vec<Message>),
    AttachGenerationInfo(GenerationInfo),
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(messages),
            open_slot: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    pub fn open_slot(&self) -> Option<usize> {
        self.open_slot
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The open message, if it is still the tail of the list.
    fn open_message(&self) -> Option<&Message> {
        let idx = self.open_slot?;
        (idx + 1 == self.messages.len()).then(|| &self.messages[idx])
    }

    fn push(&mut self, message: Message) -> usize {
        let messages = Arc::make_mut(&mut self.messages);
        messages.push(message);
        messages.len() - 1
    }

    fn apply_text(&mut self, text: &str, reasoning: bool) {
        let reuse = self
            .open_message()
            .is_some_and(|m| m.role == Role::Assistant && !m.has_tool_calls());
        let idx = match (reuse, self.open_slot) {
            (true, Some(idx)) => idx,
            _ => {
                let idx = self.push(Message::assistant(""));
                self.open_slot = Some(idx);
                idx
            }
        };

        let msg = &mut Arc::make_mut(&mut self.messages)[idx];
        let field = if reasoning {
            &mut msg.reasoning
        } else {
            &mut msg.content
        };
        field.get_or_insert_with(String::new).push_str(text);
    }

    fn apply_tool_call(&mut self, call: &ToolCall) {
        let extend = self.open_message().is_some_and(Message::has_tool_calls);
        match (extend, self.open_slot) {
            (true, Some(idx)) => {
                let msg = &mut Arc::make_mut(&mut self.messages)[idx];
                msg.tool_calls.get_or_insert_with(Vec::new).push(call.clone());
            }
            _ => {
                let idx = self.push(Message::assistant_tool_calls(vec![call.clone()]));
                self.open_slot = Some(idx);
            }
        }
    }

    fn attach_generation_info(&mut self, info: GenerationInfo) {
        if self.messages.last().is_some_and(|m| m.role == Role::Assistant) {
            if let Some(last) = Arc::make_mut(&mut self.messages).last_mut() {
                last.generation_info = Some(info);
            }
        }
    }

    fn set_tool_status(&mut self, id: &str, status: ToolCallStatus, diff_stats: Option<DiffStats>) {
        let messages = Arc::make_mut(&mut self.messages);
        let call = messages
            .iter_mut()
            .rev()
            .filter_map(|m| m.tool_calls.as_mut())
            .flat_map(|calls| calls.iter_mut())
            .find(|c| c.id == id);
        match call {
            Some(call) => {
                call.status = Some(status);
                if diff_stats.is_some() {
                    call.diff_stats = diff_stats;
                }
            }
            None => tracing::warn!("No tool call with id {} to update", id),
        }
    }
}

pub fn reduce(conversation: Conversation, action: &ConversationAction) -> Conversation {
    let mut next = conversation;
    match action {
        ConversationAction::Delta(StreamDelta::Text(text)) => next.apply_text(text, false),
        ConversationAction::Delta(StreamDelta::Reasoning(text)) => next.apply_text(text, true),
        ConversationAction::Delta(StreamDelta::ToolCall(call)) => next.apply_tool_call(call),
        ConversationAction::Delta(StreamDelta::Usage(info))
        | ConversationAction::AttachGenerationInfo(info) => next.attach_generation_info(*info),
        ConversationAction::AppendUser(message) | ConversationAction::AppendAssistant(message) => {
            next.open_slot = None;
            next.push(message.clone());
        }
        ConversationAction::AppendError { header, message } => {
            next.open_slot = None;
            next.push(Message::assistant(format!("{}\n\n{}", header, message)));
        }
        ConversationAction::CloseTurn => next.open_slot = None,
        ConversationAction::SetToolStatus {
            tool_call_id,
            status,
            diff_stats,
        } => next.set_tool_status(tool_call_id, *status, *diff_stats),
        ConversationAction::Truncate(len) => {
            next.open_slot = None;
            if *len < next.messages.len() {
                Arc::make_mut(&mut next.messages).truncate(*len);
            }
        }
        ConversationAction::Replace(messages) => {
            next = Conversation::new(messages.clone());
        }
    }
    next
}
