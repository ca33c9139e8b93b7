//! Markov chain brain: learning, forgetting and generation over pluggable
//! storage.
//!
//! - [`tuples`] turns a token sequence into prefix/suffix records
//! - [`Learner`], [`Lookup`] and [`Eraser`] are the storage capabilities
//! - [`KvBrain`] and [`SqlBrain`] implement them on sled and SQLite
//! - [`Chain`] ties a brain to a canonicalizer and generation limits

pub mod canon;
mod kv;
mod speak;
mod sql;
mod tuple;

#[cfg(test)]
mod contract;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use canon::{CanonPolicy, Canonicalizer};
pub use kv::KvBrain;
pub use speak::{walk, SpeakLimits, Speech};
pub use sql::SqlBrain;
pub use tuple::{tuples, Tuple};

use crate::core::config::{BackendKind, BrainConfig};
use crate::core::errors::BrainError;
use crate::userhash::UserHash;

/// Metadata about a learned message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Globally unique message identifier.
    pub id: Uuid,
    /// Obfuscated author, decorrelated between rooms.
    pub user: UserHash,
    /// Namespace the message's tuples are filed under.
    pub tag: String,
    /// When the message was sent.
    pub time: DateTime<Utc>,
}

/// One recorded suffix of a prefix, attributed to the message that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub suffix: String,
    pub id: Uuid,
}

/// Records Markov chain tuples.
///
/// Implementations are shared process-wide and must make concurrent learn
/// and forget calls on the same tuple linearizable.
#[async_trait]
pub trait Learner: Send + Sync {
    /// Number of entries in each prefix. Always at least 1.
    fn order(&self) -> usize;

    /// Records every tuple, attributing each to `meta.id`.
    async fn learn(
        &self,
        cancel: &CancellationToken,
        meta: &MessageMeta,
        tuples: &[Tuple],
    ) -> Result<(), BrainError>;

    /// Removes the oldest recorded occurrence of each tuple under `tag`.
    /// Tuples with no occurrence are skipped.
    async fn forget(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        tuples: &[Tuple],
    ) -> Result<(), BrainError>;

    /// Persists buffered writes. Backends that commit durably keep the default.
    async fn flush(&self) -> Result<(), BrainError> {
        Ok(())
    }
}

/// Keyed reads used by generation.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// All occurrences recorded after `prefix` under `tag`, oldest first.
    /// `prefix` must already be canonicalized.
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prefix: &[String],
    ) -> Result<Vec<Occurrence>, BrainError>;
}

/// Provenance-wide deletion.
#[async_trait]
pub trait Eraser: Send + Sync {
    /// The recorded metadata of message `id`, if any of its occurrences remain.
    async fn message(
        &self,
        cancel: &CancellationToken,
        id: Uuid,
    ) -> Result<Option<MessageMeta>, BrainError>;

    /// Removes every occurrence learned from message `id` under `tag`.
    /// Returns the number of occurrences removed.
    async fn forget_message(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        id: Uuid,
    ) -> Result<usize, BrainError>;

    /// Removes every occurrence learned from messages by `user`, in any tag.
    /// Returns the number of occurrences removed.
    async fn forget_user(
        &self,
        cancel: &CancellationToken,
        user: &UserHash,
    ) -> Result<usize, BrainError>;
}

/// The full storage capability set.
pub trait Brain: Learner + Lookup + Eraser {}

impl<T: Learner + Lookup + Eraser + ?Sized> Brain for T {}

/// Records `toks` into `l` as one message.
pub async fn learn<L: Learner + ?Sized, S: AsRef<str> + Sync>(
    l: &L,
    canon: &dyn Canonicalizer,
    cancel: &CancellationToken,
    meta: &MessageMeta,
    toks: &[S],
) -> Result<(), BrainError> {
    let tt = tuples(toks, checked_order(l), canon);
    l.learn(cancel, meta, &tt).await
}

/// Removes one occurrence of each tuple of `toks` from `l`.
pub async fn forget<L: Learner + ?Sized, S: AsRef<str> + Sync>(
    l: &L,
    canon: &dyn Canonicalizer,
    cancel: &CancellationToken,
    tag: &str,
    toks: &[S],
) -> Result<(), BrainError> {
    let tt = tuples(toks, checked_order(l), canon);
    l.forget(cancel, tag, &tt).await
}

fn checked_order<L: Learner + ?Sized>(l: &L) -> usize {
    let n = l.order();
    assert!(n >= 1, "order must be at least 1, got {n} from brain");
    n
}

/// Opens the backend named by `config`.
pub async fn open(config: &BrainConfig) -> Result<Arc<dyn Brain>, BrainError> {
    let path = config.store_path();
    let brain: Arc<dyn Brain> = match config.backend {
        BackendKind::Kv => Arc::new(KvBrain::open(&path, config.order).await?),
        BackendKind::Sql => Arc::new(SqlBrain::with_path(path.clone(), config.order).await?),
    };
    tracing::info!(
        "Opened {:?} brain at {} with order {}",
        config.backend,
        path.display(),
        config.order
    );
    Ok(brain)
}

/// A shared brain together with the policies used to feed and read it.
#[derive(Clone)]
pub struct Chain {
    brain: Arc<dyn Brain>,
    canon: Arc<dyn Canonicalizer>,
    limits: SpeakLimits,
}

impl Chain {
    pub fn new(brain: Arc<dyn Brain>, canon: Arc<dyn Canonicalizer>, limits: SpeakLimits) -> Self {
        Self {
            brain,
            canon,
            limits,
        }
    }

    pub fn brain(&self) -> &Arc<dyn Brain> {
        &self.brain
    }

    pub async fn learn<S: AsRef<str> + Sync>(
        &self,
        cancel: &CancellationToken,
        meta: &MessageMeta,
        toks: &[S],
    ) -> Result<(), BrainError> {
        learn(self.brain.as_ref(), self.canon.as_ref(), cancel, meta, toks).await?;
        tracing::debug!(tag = %meta.tag, id = %meta.id, tokens = toks.len(), "learned");
        Ok(())
    }

    pub async fn forget<S: AsRef<str> + Sync>(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        toks: &[S],
    ) -> Result<(), BrainError> {
        forget(self.brain.as_ref(), self.canon.as_ref(), cancel, tag, toks).await?;
        tracing::debug!(tag, tokens = toks.len(), "forgot");
        Ok(())
    }

    pub async fn forget_message(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        id: Uuid,
    ) -> Result<usize, BrainError> {
        let n = self.brain.forget_message(cancel, tag, id).await?;
        tracing::debug!(tag, %id, removed = n, "forgot message");
        Ok(n)
    }

    pub async fn forget_user(
        &self,
        cancel: &CancellationToken,
        user: &UserHash,
    ) -> Result<usize, BrainError> {
        let n = self.brain.forget_user(cancel, user).await?;
        tracing::debug!(removed = n, "forgot user");
        Ok(n)
    }

    pub async fn flush(&self) -> Result<(), BrainError> {
        self.brain.flush().await
    }

    /// Generates a message from `tag`, continuing `prompt` if it is
    /// non-empty. Returns `None` when nothing could be generated.
    pub async fn speak<S: AsRef<str> + Sync>(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prompt: &[S],
    ) -> Result<Option<Speech>, BrainError> {
        let mut rng = rand::rngs::StdRng::from_os_rng();
        self.speak_with_rng(cancel, tag, prompt, &mut rng).await
    }

    pub async fn speak_with_rng<S, R>(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prompt: &[S],
        rng: &mut R,
    ) -> Result<Option<Speech>, BrainError>
    where
        S: AsRef<str> + Sync,
        R: rand::Rng + Send,
    {
        let order = checked_order(self.brain.as_ref());
        let speech = walk(
            self.brain.as_ref(),
            order,
            self.canon.as_ref(),
            cancel,
            tag,
            prompt,
            self.limits,
            rng,
        )
        .await?;
        match &speech {
            Some(s) => tracing::debug!(tag, steps = s.trace.len(), "spoke"),
            None => tracing::debug!(tag, "nothing to say"),
        }
        Ok(speech)
    }
}
