use turnloop_model::{Message, MessageContent, Role as ModelRole};
use turnloop_store::{Message as StoreMessage, Role as StoreRole};

/// Per-step bookkeeping that governs how the materialized conversation is
/// wrapped before it becomes a `CompletionRequest`.
#[derive(Debug, Clone, Copy)]
pub struct ConversationState {
    pub is_first: bool,
    pub turns_remaining: u32,
    pub tools_enabled: bool,
    pub continuing_after_tools: bool,
}

impl ConversationState {
    pub fn compute(messages: &[StoreMessage], turns_remaining: u32, tools_enabled: bool) -> Self {
        let is_first = messages.len() <= 1;
        let continuing_after_tools =
            matches!(messages.last(), Some(m) if m.role == StoreRole::Tool);
        Self { is_first, turns_remaining, tools_enabled, continuing_after_tools }
    }
}

/// Expand one persisted [`StoreMessage`] into the model-crate `Message`
/// shape. An assistant message carrying more than one tool call becomes one
/// `Message` per call, since the wire `MessageContent::ToolCall` variant
/// carries exactly one.
pub fn to_model_messages(msg: &StoreMessage) -> Vec<Message> {
    match msg.role {
        StoreRole::System => vec![Message::system(msg.content.clone())],
        StoreRole::User => vec![Message::user(msg.content.clone())],
        StoreRole::Tool => {
            let id = msg.tool_call_id.clone().unwrap_or_default();
            vec![Message::tool_result(id, msg.content.clone())]
        }
        StoreRole::Assistant if msg.tool_calls.is_empty() => vec![Message::assistant(msg.content.clone())],
        StoreRole::Assistant => msg
            .tool_calls
            .iter()
            .map(|tc| Message {
                role: ModelRole::Assistant,
                content: MessageContent::ToolCall {
                    tool_call_id: tc.id.clone(),
                    function: turnloop_model::FunctionCall { name: tc.name.clone(), arguments: tc.arguments.clone() },
                },
            })
            .collect(),
    }
}

/// Turn-information section: present whenever more than one turn remains,
/// worded differently depending on where in the conversation we are.
fn turn_budget_section(state: &ConversationState) -> Option<String> {
    if state.turns_remaining <= 1 {
        return None;
    }
    let text = if state.is_first {
        format!(
            "You have {} turns remaining to complete this task. Use tool calls efficiently \
             — once turns run out the conversation ends even if the task is incomplete.",
            state.turns_remaining
        )
    } else if state.continuing_after_tools {
        format!(
            "{} turns remain after this one. Continue only if more work is needed; otherwise \
             reply with your final answer now.",
            state.turns_remaining
        )
    } else {
        format!("{} turns remain in this conversation.", state.turns_remaining)
    };
    Some(text)
}

/// Tool-usage guidelines: present only on the first turn of a conversation
/// where tools are registered, since a later turn has already seen this
/// guidance once.
fn tool_usage_section(state: &ConversationState) -> Option<String> {
    if state.is_first && state.tools_enabled {
        Some(
            "Tools are available for this task. Call a tool only when it moves the task \
             forward, and do not narrate a tool call you are about to make — just make it."
                .to_string(),
        )
    } else {
        None
    }
}

/// Execution-status: present when this step is re-invoking the model right
/// after tool results were appended, pointing the model at what just ran.
fn execution_status_section(state: &ConversationState) -> Option<String> {
    if state.continuing_after_tools {
        Some(
            "The tool results above are from the calls you just requested. Use them to \
             continue the task, or to produce your final answer if the task is done."
                .to_string(),
        )
    } else {
        None
    }
}

/// Build the `<system-reminder>` block for this step, or `None` if no
/// section applies — which is exactly the "no wrapping when
/// `turns_remaining <= 1` and not first and not continuing after tools"
/// rule, since every section above is gated on one of those three flags.
fn build_system_reminder(state: &ConversationState) -> Option<String> {
    let sections: Vec<String> = [turn_budget_section(state), tool_usage_section(state), execution_status_section(state)]
        .into_iter()
        .flatten()
        .collect();
    if sections.is_empty() {
        None
    } else {
        Some(format!("<system-reminder>\n{}\n</system-reminder>", sections.join("\n\n")))
    }
}

/// Flatten the materialized conversation into model messages, prepend the
/// static system prompt as its own leading message on the first turn, and
/// wrap the outgoing per-turn message in a `<system-reminder>` per 4.6.1.
pub fn build_model_messages(messages: &[StoreMessage], state: &ConversationState, system_prompt: Option<&str>) -> Vec<Message> {
    let mut out: Vec<Message> = messages.iter().flat_map(to_model_messages).collect();

    if state.is_first {
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            out.insert(0, Message::system(prompt.to_string()));
        }
    }

    if let Some(reminder) = build_system_reminder(state) {
        if state.continuing_after_tools {
            // The original user content is empty for a post-tool continuation
            // — the reminder is sent as its own message.
            out.push(Message::user(reminder));
        } else if let Some(last) = out.last_mut() {
            if let MessageContent::Text(text) = &last.content {
                last.content = MessageContent::Text(format!("{reminder}\n{text}"));
            }
        }
    }

    out
}
