//! Stage prompt templates.
//!
//! Every model-driven stage renders its user prompt from a named Tera
//! template. Built-in templates can be replaced per stage through the
//! `[prompts]` config table; replacements are compiled up front so a bad
//! template is a configuration error, not a request failure.

use serde_json::{Map, Value};
use tera::{Context, Tera};

use crate::config::{Component, PromptOverrides};
use crate::error::ConfigError;

const UNDERSTANDING_TEMPLATE: &str = r#"Analyse the creative-writing request below. Answer with one JSON object and nothing else:
{"search_intent": "<what background knowledge to look up>", "keywords": ["..."], "must_include": ["..."], "must_avoid": ["..."]}

Request: {{ user_query }}
{% if characters %}Characters: {{ characters | join(sep=", ") }}
{% endif %}{% if setting %}Setting: {{ setting }}
{% endif %}{% if plot_requirements %}Plot requirements: {{ plot_requirements }}
{% endif %}{% if style %}Style: {{ style }}
{% endif %}"#;

const DIRECTOR_TEMPLATE: &str = r#"Plan the next piece of writing. Answer with one JSON object of directives, for example
{"structure": "...", "focus_points": ["..."], "tone": "...", "pacing": "..."}

Request: {{ user_query }}
Search intent: {{ search_intent }}
Target length: about {{ target_length }} characters
{% if keywords %}Keywords: {{ keywords | join(sep=", ") }}
{% endif %}{% if style %}Style: {{ style }}
{% endif %}{% if memories %}
Background:
{% for m in memories %}- [{{ m.id }}] {{ m.content }}
{% endfor %}{% endif %}"#;

const WRITER_TEMPLATE: &str = r#"Write the requested passage. Follow the plan and stay consistent with the background.

Request: {{ user_query }}
Target length: about {{ target_length }} characters
Plan:
{{ plan }}
{% if must_include %}Must include: {{ must_include | join(sep=", ") }}
{% endif %}{% if must_avoid %}Must avoid: {{ must_avoid | join(sep=", ") }}
{% endif %}{% if characters %}Characters: {{ characters | join(sep=", ") }}
{% endif %}{% if setting %}Setting: {{ setting }}
{% endif %}{% if plot_requirements %}Plot requirements: {{ plot_requirements }}
{% endif %}{% if style %}Style: {{ style }}
{% endif %}{% for key, value in hints %}{{ key }}: {{ value }}
{% endfor %}{% if memories %}
Background:
{% for m in memories %}- [{{ m.id }}] ({{ m.usage_suggestion }}) {{ m.content }}
{% endfor %}{% endif %}{% if earlier_summary %}
Earlier conversation: {{ earlier_summary }}
{% endif %}{% if history %}
Recent conversation:
{% for turn in history %}{{ turn.role }}: {{ turn.content }}
{% endfor %}{% endif %}{% if continuation %}
Continue directly from:
{{ continuation }}
{% endif %}"#;

const CONSISTENCY_TEMPLATE: &str = r#"Check the passage against the established background. Report contradictions of worldview, character, events or rules.
Answer with one JSON object and nothing else:
{"issues": [{"type": "worldview|character|event|rule", "severity": "low|medium|high|critical", "description": "...", "related_memory_id": "<id or null>"}]}
Use an empty list when there are no issues.

Passage:
{{ content }}
{% if memories %}
Background:
{% for m in memories %}- [{{ m.id }}] {{ m.content }}
{% endfor %}{% endif %}"#;

pub const UNDERSTANDING_SYSTEM: &str =
    "You extract structured search intent from creative-writing requests. Reply with JSON only.";
pub const DIRECTOR_SYSTEM: &str =
    "You are a story director. You plan structure and focus before anything is written. Reply with JSON only.";
pub const WRITER_SYSTEM: &str =
    "You are a fiction writer. Produce only the passage itself, without commentary.";
pub const CONSISTENCY_SYSTEM: &str =
    "You are a continuity editor checking fiction against established canon. Reply with JSON only.";

fn builtin(component: Component) -> &'static str {
    match component {
        Component::Understanding => UNDERSTANDING_TEMPLATE,
        Component::Director => DIRECTOR_TEMPLATE,
        Component::Writer => WRITER_TEMPLATE,
        Component::Consistency => CONSISTENCY_TEMPLATE,
    }
}

fn override_for(overrides: &PromptOverrides, component: Component) -> Option<&str> {
    match component {
        Component::Understanding => overrides.understanding.as_deref(),
        Component::Director => overrides.director.as_deref(),
        Component::Writer => overrides.writer.as_deref(),
        Component::Consistency => overrides.consistency.as_deref(),
    }
}

/// Compiled templates, one per model-driven stage.
pub struct PromptSet {
    tera: Tera,
}

impl PromptSet {
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::with_overrides(&PromptOverrides::default())
    }

    pub fn with_overrides(overrides: &PromptOverrides) -> Result<Self, ConfigError> {
        let mut tera = Tera::default();
        for component in Component::ALL {
            let source = override_for(overrides, component).unwrap_or(builtin(component));
            tera.add_raw_template(&component.to_string(), source)
                .map_err(|e| ConfigError::Validation(format!("prompts.{component}: {e}")))?;
        }
        Ok(Self { tera })
    }

    pub fn render(&self, component: Component, context: &Context) -> anyhow::Result<String> {
        let rendered = self.tera.render(&component.to_string(), context)?;
        Ok(rendered)
    }
}

/// Pull the first JSON object out of a model reply, tolerating prose or
/// code fences around it.
pub fn extract_json_object(reply: &str) -> Option<Map<String, Value>> {
    let parsed = serde_json::from_str::<Value>(reply.trim()).ok().or_else(|| {
        let start = reply.find('{')?;
        let end = reply.rfind('}')?;
        if start >= end {
            return None;
        }
        serde_json::from_str::<Value>(&reply[start..=end]).ok()
    })?;
    match parsed {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// String list under `key`, skipping non-string items.
pub(crate) fn string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}
