use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::canon::Canonicalizer;
use super::tuple::slide;
use super::Lookup;
use crate::core::config::{defaults, SpeakConfig};
use crate::core::errors::BrainError;

/// A generated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Speech {
    pub text: String,
    /// IDs of the messages whose occurrences were sampled, in walk order.
    pub trace: Vec<Uuid>,
}

/// Bounds on a single walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakLimits {
    pub max_steps: usize,
    pub max_chars: usize,
}

impl Default for SpeakLimits {
    fn default() -> Self {
        Self {
            max_steps: defaults::MAX_STEPS,
            max_chars: defaults::MAX_CHARS,
        }
    }
}

impl From<SpeakConfig> for SpeakLimits {
    fn from(config: SpeakConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_chars: config.max_chars,
        }
    }
}

/// Random-walks the chain under `tag` from the end of `prompt`.
///
/// Each step samples uniformly over the recorded occurrences of the current
/// prefix, so suffixes learned more often are proportionally more likely.
/// The walk stops at the end sentinel, at a prefix with no occurrences, or
/// when `limits` would be exceeded. Prompt words count toward the char bound;
/// a prompt that reaches it is cut there and not continued. Returns `None` when the output would be
/// empty. A canceled walk returns [`BrainError::Canceled`] and no partial text.
#[allow(clippy::too_many_arguments)]
pub async fn walk<L, S, R>(
    brain: &L,
    order: usize,
    canon: &dyn Canonicalizer,
    cancel: &CancellationToken,
    tag: &str,
    prompt: &[S],
    limits: SpeakLimits,
    rng: &mut R,
) -> Result<Option<Speech>, BrainError>
where
    L: Lookup + ?Sized,
    S: AsRef<str> + Sync,
    R: Rng + Send,
{
    let mut window = vec![String::new(); order];
    let mut words: Vec<String> = Vec::new();
    let mut len = 0;
    let mut full = false;
    for tok in prompt {
        let tok = tok.as_ref();
        let next = len + joined_len(&words, tok);
        if next > limits.max_chars {
            full = true;
            break;
        }
        len = next;
        words.push(tok.to_string());
        slide(&mut window, canon.canonicalize(tok));
    }

    let mut trace = Vec::new();
    let steps = if full { 0 } else { limits.max_steps };
    for _ in 0..steps {
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        let occurrences = brain.lookup(cancel, tag, &window).await?;
        if occurrences.is_empty() {
            break;
        }
        let pick = &occurrences[rng.random_range(0..occurrences.len())];
        if pick.suffix.is_empty() {
            trace.push(pick.id);
            break;
        }
        let next = len + joined_len(&words, &pick.suffix);
        if next > limits.max_chars {
            break;
        }
        len = next;
        trace.push(pick.id);
        words.push(pick.suffix.clone());
        slide(&mut window, canon.canonicalize(&pick.suffix));
    }
    if cancel.is_cancelled() {
        return Err(BrainError::Canceled);
    }

    if words.is_empty() {
        return Ok(None);
    }
    Ok(Some(Speech {
        text: words.join(" "),
        trace,
    }))
}

/// Characters `tok` adds to the space-joined output.
fn joined_len(words: &[String], tok: &str) -> usize {
    let sep = if words.is_empty() { 0 } else { 1 };
    sep + tok.chars().count()
}
