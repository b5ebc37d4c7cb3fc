//! Consumed host-agent capabilities
//!
//! The host registers this extension's tools and commands, delivers
//! `input`/`agent_end` events, and accepts user-visible messages enqueued
//! into its active turn. Everything here mirrors that surface as traits and
//! plain types so the core stays host-agnostic.

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How a message enters the host's turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverAs {
    /// Queued as a follow-up user message
    #[default]
    FollowUp,
    /// Injected into the current turn
    Steer,
}

/// Events observed from the host
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The user (or a peer extension) submitted input
    Input { text: String },
    /// The agent finished a turn; `output` is its final text
    AgentEnd { output: String },
}

/// Host capabilities consumed by the loop
#[async_trait]
pub trait HostAgent: Send + Sync {
    /// Enqueue a message into the host's active turn
    async fn send_user_message(&self, text: &str, deliver_as: DeliverAs) -> Result<()>;

    /// Subscribe to host events
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;
}

/// Descriptor for a tool registered with the host
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

/// Uniform tool invocation result: `{content, details, error?}`
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub content: Vec<String>,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            content: vec![message.into()],
            details: serde_json::Value::Null,
            error: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            content: vec![message.clone()],
            details: serde_json::Value::Null,
            error: Some(message),
        }
    }
}

/// Arguments accepted by the start-run tool and its slash command
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct StartRunArgs {
    pub task: String,
    pub max_cycles: Option<u32>,
    pub auto_commit: Option<bool>,
    pub ul_mode: Option<bool>,
    pub auto_approve: Option<bool>,
}

/// Parse slash-command arguments: flags may appear anywhere, everything else
/// joins into the task text
///
/// Supported flags: `--max-cycles=N`, `--no-ul-mode`, `--require-approval`,
/// `--no-commit`.
pub fn parse_slash_args(input: &str) -> StartRunArgs {
    let mut args = StartRunArgs::default();
    let mut task_words = Vec::new();

    for word in input.split_whitespace() {
        if let Some(value) = word.strip_prefix("--max-cycles=") {
            if let Ok(n) = value.parse::<u32>() {
                args.max_cycles = Some(n);
            }
        } else if word == "--no-ul-mode" {
            args.ul_mode = Some(false);
        } else if word == "--require-approval" {
            args.auto_approve = Some(false);
        } else if word == "--no-commit" {
            args.auto_commit = Some(false);
        } else if !word.starts_with("--") {
            task_words.push(word);
        }
    }

    args.task = task_words.join(" ");
    args
}

/// In-memory host for tests
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub struct MockHost {
        pub sent: Mutex<Vec<(String, DeliverAs)>>,
        tx: broadcast::Sender<HostEvent>,
    }

    impl Default for MockHost {
        fn default() -> Self {
            let (tx, _) = broadcast::channel(64);
            Self {
                sent: Mutex::new(Vec::new()),
                tx,
            }
        }
    }

    impl MockHost {
        /// Emit a host event to all subscribers
        pub fn emit(&self, event: HostEvent) {
            let _ = self.tx.send(event);
        }

        pub fn sent_messages(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("mock host lock")
                .iter()
                .map(|(text, _)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl HostAgent for MockHost {
        async fn send_user_message(&self, text: &str, deliver_as: DeliverAs) -> Result<()> {
            self.sent.lock().expect("mock host lock").push((text.to_string(), deliver_as));
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
            self.tx.subscribe()
        }
    }
}
