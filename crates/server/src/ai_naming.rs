//! AI-assisted thread slugs.
//!
//! Asks an external text-generation CLI for a `SLUG: <slug>` line, raced
//! against a deadline. Falls back to naive slugs when the model is slow,
//! missing or unparseable; `SLUG: EMPTY` means the text was a question and
//! the thread keeps its name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{info, warn};

use crate::process::{run_command_with, CommandError};
use crate::session_naming::{is_bootstrap_prompt, naive_slug_candidates, parse_slug_response, ParsedSlug};

const MAX_PROMPT_CHARS: usize = 500;

const INSTRUCTIONS: &str = "You name git branches for coding tasks. \
Given the user's request below, reply with exactly one line of the form \
`SLUG: <slug>` where <slug> is 2-4 lowercase words joined by hyphens that \
describe the task (for example `SLUG: fix-login-redirect`). If the request \
is only a question and not an actionable task, reply `SLUG: EMPTY`. \
Reply with nothing else.\n\nRequest:\n";

/// Runs the text-generation model. Returns its raw response.
#[async_trait]
pub trait SlugGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, CommandError>;
}

/// `SlugGenerator` that pipes the prompt into a configured command's stdin
/// (`claude -p` by default).
pub struct CommandSlugGenerator {
    command: Vec<String>,
}

impl CommandSlugGenerator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl SlugGenerator for CommandSlugGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, CommandError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(CommandError::Spawn {
                command: String::new(),
                message: "no slug command configured".to_string(),
            });
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        // The caller's deadline decides; this bound only stops a leaked child.
        let out = run_command_with(program, &args, None, Some(prompt), Duration::from_secs(120))
            .await?;
        Ok(out.stdout)
    }
}

/// What the naming step decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlugOutcome {
    /// Try these names in order.
    Candidates(Vec<String>),
    /// Leave the thread name alone.
    Skip,
}

pub fn build_prompt(text: &str) -> String {
    let truncated: String = text.chars().take(MAX_PROMPT_CHARS).collect();
    format!("{INSTRUCTIONS}{truncated}")
}

/// Slug candidates for `text`: the model's slug first, naive ones after.
pub async fn slug_candidates(
    generator: &dyn SlugGenerator,
    text: &str,
    deadline: Duration,
) -> SlugOutcome {
    if is_bootstrap_prompt(text) {
        return SlugOutcome::Skip;
    }
    let naive = naive_slug_candidates(text);
    let prompt = build_prompt(text);

    // Losing side is dropped: the subprocess is killed on drop, the timer
    // simply never fires.
    let response = tokio::select! {
        result = generator.generate(&prompt) => Some(result),
        _ = tokio::time::sleep(deadline) => None,
    };

    let raw = match response {
        Some(Ok(raw)) => raw,
        Some(Err(e)) => {
            warn!(
                component = "naming",
                event = "naming.slug_failed",
                error = %e,
                "Slug command failed, using naive slug"
            );
            return SlugOutcome::Candidates(naive);
        }
        None => {
            warn!(
                component = "naming",
                event = "naming.slug_timeout",
                timeout_secs = deadline.as_secs(),
                "Slug command timed out, using naive slug"
            );
            return SlugOutcome::Candidates(naive);
        }
    };

    match parse_slug_response(&raw) {
        ParsedSlug::Empty => {
            info!(
                component = "naming",
                event = "naming.slug_empty",
                "Text is not a task, keeping thread name"
            );
            SlugOutcome::Skip
        }
        ParsedSlug::Invalid => SlugOutcome::Candidates(naive),
        ParsedSlug::Slug(slug) => {
            let mut out = vec![slug.clone()];
            out.extend((2..=4).map(|n| format!("{slug}-{n}")));
            for candidate in naive {
                if !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
            SlugOutcome::Candidates(out)
        }
    }
}

/// In-flight set keyed by thread id. A thread can be claimed once at a time;
/// the claim is released when the returned token drops.
#[derive(Clone, Default)]
pub struct InFlight {
    claimed: Arc<DashSet<String>>,
}

pub struct InFlightClaim {
    claimed: Arc<DashSet<String>>,
    key: String,
}

impl InFlight {
    pub fn try_claim(&self, key: &str) -> Option<InFlightClaim> {
        self.claimed.insert(key.to_string()).then(|| InFlightClaim {
            claimed: Arc::clone(&self.claimed),
            key: key.to_string(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.claimed.contains(key)
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.claimed.remove(&self.key);
    }
}
