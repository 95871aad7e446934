//! Collision-free thread names.
//!
//! A base name (user-requested or a random adjective-noun pair) is tried
//! bare and then as `base-2 … base-9`. Random bases are re-rolled a bounded
//! number of times before giving up.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

pub const MAX_BASE_ATTEMPTS: usize = 5;
const MAX_SUFFIX: usize = 9;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "brisk", "calm", "clever", "cosmic", "crisp", "daring", "eager", "fancy",
    "gentle", "golden", "happy", "hidden", "jolly", "keen", "lively", "lucky", "mellow", "misty",
    "nimble", "noble", "proud", "quick", "quiet", "rapid", "rustic", "shiny", "silent", "silver",
    "sleek", "snowy", "steady", "sunny", "swift", "tidy", "vivid", "wild", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "cedar", "comet", "coral", "crane", "delta", "ember", "falcon", "fern",
    "fjord", "gecko", "harbor", "heron", "island", "jaguar", "kestrel", "lagoon", "lantern",
    "maple", "meadow", "nebula", "orbit", "otter", "panda", "pebble", "pine", "quartz", "raven",
    "reef", "river", "sparrow", "summit", "tiger", "tundra", "valley", "walrus", "willow", "yak",
    "zephyr",
];

/// Decides whether a candidate name is free everywhere it would be used.
#[async_trait]
pub trait NameAvailability: Send + Sync {
    async fn is_available(&self, candidate: &str) -> bool;
}

/// A freshly allocated name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedName {
    pub name: String,
    /// Came from the random generator rather than the caller.
    pub generated: bool,
}

pub fn random_base_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("brave");
    let noun = NOUNS.choose(rng).copied().unwrap_or("otter");
    format!("{adjective}-{noun}")
}

/// `base`, `base-2`, …, `base-9`.
pub fn candidates(base: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(base.to_string()).chain((2..=MAX_SUFFIX).map(move |n| format!("{base}-{n}")))
}

/// Names must be non-empty and free of path separators.
pub fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') {
        return Err(OrchestratorError::InvalidName(name.to_string()));
    }
    Ok(trimmed)
}

async fn first_available(base: &str, names: &dyn NameAvailability) -> Option<String> {
    for candidate in candidates(base) {
        if names.is_available(&candidate).await {
            return Some(candidate);
        }
        debug!(
            component = "naming",
            event = "naming.candidate_taken",
            candidate = %candidate,
            "Name candidate taken"
        );
    }
    None
}

/// Allocate a unique name from `requested`, or from random bases when no
/// name was requested.
pub async fn allocate_unique_name(
    requested: Option<&str>,
    names: &dyn NameAvailability,
    mut next_base: impl FnMut() -> String + Send,
) -> Result<AllocatedName> {
    if let Some(requested) = requested {
        let base = validate_name(requested)?;
        return match first_available(base, names).await {
            Some(name) => Ok(AllocatedName {
                name,
                generated: false,
            }),
            None => Err(OrchestratorError::NameGenerationFailed { attempts: 1 }),
        };
    }

    for _ in 0..MAX_BASE_ATTEMPTS {
        let base = next_base();
        if let Some(name) = first_available(&base, names).await {
            return Ok(AllocatedName {
                name,
                generated: true,
            });
        }
    }
    Err(OrchestratorError::NameGenerationFailed {
        attempts: MAX_BASE_ATTEMPTS,
    })
}
