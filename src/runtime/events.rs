// src/runtime/events.rs — Wire event parsing and run-reply normalization

use serde_json::Value;

use crate::infra::errors::DropchatError;

/// A single wire-level event from the agent runtime. Transient: events are
/// folded into workflow step labels and the final agent message, never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// Textual payload from an agent. An empty `text` marks agent activity
    /// without content (the runtime announces which agent is running).
    TextDelta { author: String, text: String },
    /// An internal delegation to a named function/tool.
    FunctionCall {
        author: String,
        name: String,
        args: Value,
    },
    /// End of the streamed response, carrying (or confirming) the final text.
    Terminal { text: Option<String> },
}

/// Map one decoded JSON record to a `WorkflowEvent`.
///
/// The runtime emits several record flavors across deployments; unknown
/// records map to `None` and are skipped by the decoder.
pub fn parse_event(value: &Value) -> Option<WorkflowEvent> {
    if value["terminal"].as_bool() == Some(true) || value["type"] == "end" {
        let text = value["text"]
            .as_str()
            .or_else(|| value["content"].as_str())
            .map(str::to_string);
        return Some(WorkflowEvent::Terminal { text });
    }

    let author = value["author"].as_str().unwrap_or("agent").to_string();

    if value["type"] == "message" {
        if let Some(content) = value["content"].as_str() {
            return Some(WorkflowEvent::TextDelta {
                author,
                text: content.to_string(),
            });
        }
    }

    if let Some(parts) = value["content"]["parts"].as_array() {
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                return Some(WorkflowEvent::FunctionCall {
                    author,
                    name: call["name"].as_str().unwrap_or("unknown").to_string(),
                    args: call.get("args").cloned().unwrap_or(Value::Null),
                });
            }
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    return Some(WorkflowEvent::TextDelta {
                        author,
                        text: text.to_string(),
                    });
                }
            }
        }
    }

    // Author-only record: an agent became active without emitting content yet.
    if value.get("author").is_some() {
        return Some(WorkflowEvent::TextDelta {
            author,
            text: String::new(),
        });
    }

    None
}

/// Human-readable progress label for an event, or `None` for events that
/// only update the pending text.
pub fn step_label(event: &WorkflowEvent) -> Option<String> {
    match event {
        WorkflowEvent::FunctionCall { name, .. } => Some(format!("Calling: {name}")),
        WorkflowEvent::TextDelta { author, text } if text.is_empty() => {
            Some(format!("Running: {}", display_agent_name(author)))
        }
        _ => None,
    }
}

/// User-friendly agent names, with a prettified fallback for unknown ones.
pub fn display_agent_name(name: &str) -> String {
    match name {
        "guide_agent" => "Guide Agent".into(),
        "search_agent" => "Search Agent".into(),
        "prompt_writer_agent" => "Prompt Writer Agent".into(),
        "task_master_agent" => "Task Master Agent".into(),
        "drop_agent" => "Drop Root Agent".into(),
        other => prettify(other),
    }
}

fn prettify(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The known shapes a synchronous run response arrives in. The runtime's
/// response format is not contractually stable across deployments, so the
/// client classifies instead of assuming one shape.
enum RunReply<'a> {
    /// Ordered list of heterogeneous events.
    Events(&'a [Value]),
    /// Single object with one of several possible text-bearing fields.
    Object(&'a serde_json::Map<String, Value>),
    /// Bare string.
    Text(&'a str),
}

fn classify(value: &Value) -> Option<RunReply<'_>> {
    match value {
        Value::Array(events) => Some(RunReply::Events(events)),
        Value::Object(map) => Some(RunReply::Object(map)),
        Value::String(s) => Some(RunReply::Text(s)),
        _ => None,
    }
}

const TEXT_FIELDS: &[&str] = &["response", "text", "output", "message", "content", "result"];

/// Normalize a synchronous run response into the final reply text.
///
/// This is the only place the multi-shape tolerance lives; callers receive
/// either text or `NoContent`.
pub fn extract_reply(value: &Value) -> Result<String, DropchatError> {
    match classify(value) {
        Some(RunReply::Events(events)) => reply_from_events(events),
        Some(RunReply::Object(map)) => reply_from_object(map),
        Some(RunReply::Text(s)) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(DropchatError::NoContent),
    }
}

fn reply_from_events(events: &[Value]) -> Result<String, DropchatError> {
    let mut steps: Vec<String> = Vec::new();
    let mut last_text: Option<String> = None;

    for event in events {
        let author = event["author"].as_str().unwrap_or("");
        let Some(parts) = event["content"]["parts"].as_array() else {
            continue;
        };
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                let label = format!("Calling: {}", call["name"].as_str().unwrap_or("unknown"));
                if steps.last() != Some(&label) {
                    steps.push(label);
                }
            } else if let Some(text) = part["text"].as_str() {
                // The reply is the last non-empty text not authored by the user.
                if !text.trim().is_empty() && author != "user" {
                    last_text = Some(text.to_string());
                }
            }
        }
    }

    let text = last_text.ok_or(DropchatError::NoContent)?;
    if steps.is_empty() {
        Ok(text)
    } else {
        let workflow = steps
            .iter()
            .map(|s| format!("• {s}"))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!("{workflow}\n\n{text}"))
    }
}

fn reply_from_object(map: &serde_json::Map<String, Value>) -> Result<String, DropchatError> {
    for field in TEXT_FIELDS {
        if let Some(text) = map.get(*field).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return Ok(text.to_string());
            }
        }
    }
    // Some deployments return a single event object rather than a list.
    if map.contains_key("content") {
        let event = Value::Object(map.clone());
        return reply_from_events(std::slice::from_ref(&event));
    }
    Err(DropchatError::NoContent)
}
