//! Command templates and fully resolved command specifications.
//!
//! Argument and environment values are [minijinja] templates rendered against
//! the triggering message. Undefined variables are errors, so a template that
//! references `{{ headers.ticket }}` turns a message without that header into
//! a malformed message instead of running the command with an empty argument.
//!
//! # Template context
//!
//! | Variable | Value |
//! |----------|-------|
//! | `routing_key` | The message routing key |
//! | `key` | The trigger key (routing key or configured header) |
//! | `delivery_id` | Delivery id, when the message has one |
//! | `timestamp` | Message timestamp, RFC 3339 |
//! | `redelivered` | `true` for broker redeliveries |
//! | `headers` | Map of header name to string value |
//! | `body` | Payload as UTF-8 (lossy) |
//! | `json` | Payload parsed as JSON, when it parses |
//!
//! ```toml
//! args = ["--service", "{{ key }}", "--build", "{{ json.build_id }}"]
//! env = { TICKET = "{{ headers['x-ticket'] | default('none') }}" }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::{CommandConfig, Message, TemplateError, TriggerKey};

/// How much child output to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCapture {
    /// stdout/stderr are discarded.
    Disabled,
    /// Keep up to `max_bytes` per stream; the rest is drained and dropped.
    Bounded { max_bytes: usize },
}

/// A fully resolved command invocation.
///
/// Built once per `Fire` decision and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Bytes written to the child's stdin; `None` connects stdin to null.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub capture: OutputCapture,
}

/// A validated command template.
///
/// Construction checks every template for syntax errors, so rendering can
/// only fail on missing message data.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    capture: OutputCapture,
    stdin_payload: bool,
    export_message_env: bool,
    jinja: Environment<'static>,
}

impl CommandTemplate {
    /// Compiles the templates in `config`.
    pub fn from_config(config: &CommandConfig) -> Result<Self, TemplateError> {
        let mut jinja = Environment::new();
        jinja.set_undefined_behavior(UndefinedBehavior::Strict);

        for source in config.args.iter().chain(config.env.values()) {
            jinja
                .template_from_str(source)
                .map_err(|e| TemplateError::Syntax {
                    template: source.clone(),
                    message: e.to_string(),
                })?;
        }

        let capture = if config.capture_output {
            OutputCapture::Bounded {
                max_bytes: config.max_output_bytes,
            }
        } else {
            OutputCapture::Disabled
        };

        Ok(Self {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            timeout: config.timeout,
            capture,
            stdin_payload: config.stdin_payload,
            export_message_env: config.export_message_env,
            jinja,
        })
    }

    /// Resolves the template for one message.
    pub fn render(
        &self,
        message: &Message,
        key: &TriggerKey,
    ) -> Result<CommandSpec, TemplateError> {
        let context = template_context(message, key);

        let args = self
            .args
            .iter()
            .map(|tpl| self.render_one(tpl, &context))
            .collect::<Result<Vec<_>, _>>()?;

        let mut env = BTreeMap::new();
        if self.export_message_env {
            env.insert("MQ_TRIGGER_KEY".to_string(), key.to_string());
            env.insert(
                "MQ_TRIGGER_TIMESTAMP".to_string(),
                message.timestamp().to_string(),
            );
            if let Some(rk) = message.routing_key() {
                env.insert("MQ_TRIGGER_ROUTING_KEY".to_string(), rk.to_string());
            }
            if let Some(id) = message.delivery_id() {
                env.insert("MQ_TRIGGER_DELIVERY_ID".to_string(), id.to_string());
            }
        }
        // Configured values win over the exported defaults.
        for (name, tpl) in &self.env {
            env.insert(name.clone(), self.render_one(tpl, &context)?);
        }

        Ok(CommandSpec {
            program: self.program.clone(),
            args,
            env,
            stdin: self.stdin_payload.then(|| message.payload().to_vec()),
            timeout: self.timeout,
            capture: self.capture,
        })
    }

    fn render_one(&self, template: &str, context: &Value) -> Result<String, TemplateError> {
        self.jinja
            .render_str(template, context)
            .map_err(|e| TemplateError::Render {
                template: template.to_string(),
                message: e.to_string(),
            })
    }
}

/// Builds the rendering context. Absent metadata is left out entirely so that
/// strict undefined handling reports it.
fn template_context(message: &Message, key: &TriggerKey) -> Value {
    let mut ctx = Map::new();
    ctx.insert("key".into(), Value::String(key.to_string()));
    ctx.insert(
        "timestamp".into(),
        Value::String(message.timestamp().to_string())
    );
    ctx.insert("redelivered".into(), Value::Bool(message.redelivered()));
    if let Some(rk) = message.routing_key() {
        ctx.insert("routing_key".into(), Value::String(rk.to_string()));
    }
    if let Some(id) = message.delivery_id() {
        ctx.insert("delivery_id".into(), Value::String(id.to_string()));
    }
    let headers: Map<String, Value> = message
        .headers()
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    ctx.insert("headers".into(), Value::Object(headers));
    ctx.insert(
        "body".into(),
        Value::String(String::from_utf8_lossy(message.payload()).into_owned()),
    );
    if let Ok(json) = serde_json::from_slice::<Value>(message.payload()) {
        ctx.insert("json".into(), json);
    }
    Value::Object(ctx)
}
