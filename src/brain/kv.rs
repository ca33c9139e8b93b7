//! Embedded key-value brain on sled.
//!
//! Every learned occurrence is its own key in the `chains` tree:
//! `tag | p0 | .. | pN | seq`, each string component written as a big-endian
//! `u32` length followed by its bytes, and `seq` a big-endian id from
//! [`sled::Db::generate_id`]. A prefix's occurrences are therefore one
//! contiguous range, oldest first, and learning never rewrites existing
//! values. The value is the bincode `(suffix, message id)`.
//!
//! Provenance lives in three more trees: `messages` maps a message id to its
//! metadata and the number of its occurrences still stored, `by_msg` indexes
//! occurrence keys by message id, and `by_user` indexes message ids by user
//! hash. A message record is dropped with its last occurrence.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::IVec;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::tuple::assert_width;
use super::{Eraser, Learner, Lookup, MessageMeta, Occurrence, Tuple};
use crate::core::errors::{BrainError, StorageError};
use crate::userhash::UserHash;

const ORDER_KEY: &[u8] = b"order";
const ID_LEN: usize = 16;
const USER_LEN: usize = 32;
const EMPTY: &[u8] = &[];

#[derive(Debug)]
enum Abort {
    Canceled,
    /// A claimed occurrence was removed by a concurrent call.
    Stale,
    Codec(bincode::Error),
}

fn codec(err: bincode::Error) -> ConflictableTransactionError<Abort> {
    ConflictableTransactionError::Abort(Abort::Codec(err))
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    meta: MessageMeta,
    live: u64,
}

#[derive(Clone)]
struct Trees {
    chains: sled::Tree,
    messages: sled::Tree,
    by_msg: sled::Tree,
    by_user: sled::Tree,
}

pub struct KvBrain {
    db: sled::Db,
    trees: Trees,
    order: usize,
    dirty: AtomicBool,
}

impl KvBrain {
    pub async fn open(path: impl AsRef<Path>, order: usize) -> Result<Self, BrainError> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || sled::open(path))
            .await
            .map_err(|err| BrainError::storage("open", "", err))?
            .map_err(|err| BrainError::storage("open", "", err))?;
        Self::with_db(db, order)
    }

    /// Wraps an open database, recording `order` on first use and refusing a
    /// database created with a different one.
    pub fn with_db(db: sled::Db, order: usize) -> Result<Self, BrainError> {
        if order < 1 {
            return Err(BrainError::Config(format!("order must be at least 1, got {order}")));
        }
        let open_tree = |name: &str| {
            db.open_tree(name)
                .map_err(|err| BrainError::storage("open", "", err))
        };
        let meta = open_tree("meta")?;
        let want = (order as u64).to_be_bytes();
        let stored = meta
            .compare_and_swap(ORDER_KEY, None as Option<&[u8]>, Some(&want[..]))
            .map_err(|err| BrainError::storage("open", "", err))?;
        if let Err(current) = stored {
            let have = current.current.as_deref().map(decode_order);
            if have != Some(Some(order as u64)) {
                return Err(BrainError::Config(format!(
                    "brain was created with order {:?}, not {}",
                    have.flatten(),
                    order
                )));
            }
        }
        let trees = Trees {
            chains: open_tree("chains")?,
            messages: open_tree("messages")?,
            by_msg: open_tree("by_msg")?,
            by_user: open_tree("by_user")?,
        };
        Ok(Self {
            db,
            trees,
            order,
            dirty: AtomicBool::new(false),
        })
    }

    async fn blocking<T, F>(
        &self,
        op: &'static str,
        tag: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, BrainError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BrainError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| BrainError::storage(op, tag, err))?
    }

    fn touched(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Drop for KvBrain {
    fn drop(&mut self) {
        // Only reached when the owner skipped `flush`.
        if self.dirty.load(Ordering::Acquire) {
            if let Err(err) = self.db.flush() {
                tracing::warn!("Failed to flush brain on close: {}", err);
            }
        }
    }
}

#[async_trait]
impl Learner for KvBrain {
    fn order(&self) -> usize {
        self.order
    }

    async fn learn(
        &self,
        cancel: &CancellationToken,
        meta: &MessageMeta,
        tuples: &[Tuple],
    ) -> Result<(), BrainError> {
        assert_width(self.order, tuples);
        let db = self.db.clone();
        let trees = self.trees.clone();
        let token = cancel.clone();
        let meta = meta.clone();
        let tuples = tuples.to_vec();
        let scope = meta.tag.clone();

        self.blocking("learn", &scope, cancel, move || {
            let tag = meta.tag.as_str();
            let mut entries = Vec::with_capacity(tuples.len());
            for t in &tuples {
                let seq = db
                    .generate_id()
                    .map_err(|err| BrainError::storage("learn", tag, err))?;
                let value = bincode::serialize(&Occurrence {
                    suffix: t.suffix.clone(),
                    id: meta.id,
                })
                .map_err(|err| BrainError::storage("learn", tag, err))?;
                entries.push((occurrence_key(tag, &t.prefix, seq), value));
            }
            let id = &meta.id.as_bytes()[..];
            let owner = user_key(&meta.user, meta.id);

            let trees = (&trees.chains, &trees.messages, &trees.by_msg, &trees.by_user);
            let res = trees.transaction(|(chains, messages, by_msg, by_user)| {
                for (key, value) in &entries {
                    chains.insert(key.as_slice(), value.as_slice())?;
                    by_msg.insert(msg_key(meta.id, key), EMPTY)?;
                }
                let live = match messages.get(id)? {
                    Some(bytes) => decode_message(&bytes).map_err(codec)?.live,
                    None => 0,
                };
                let stored = StoredMessage {
                    meta: meta.clone(),
                    live: live + entries.len() as u64,
                };
                messages.insert(id, bincode::serialize(&stored).map_err(codec)?)?;
                by_user.insert(owner.as_slice(), EMPTY)?;
                if token.is_cancelled() {
                    return Err(ConflictableTransactionError::Abort(Abort::Canceled));
                }
                Ok(())
            });
            res.map_err(|err| tx_error("learn", tag, err))
        })
        .await?;
        self.touched();
        Ok(())
    }

    async fn forget(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        tuples: &[Tuple],
    ) -> Result<(), BrainError> {
        assert_width(self.order, tuples);
        let mut wanted: BTreeMap<Vec<u8>, Vec<String>> = BTreeMap::new();
        for t in tuples {
            wanted
                .entry(record_key(tag, &t.prefix))
                .or_default()
                .push(t.suffix.clone());
        }
        let trees = self.trees.clone();
        let token = cancel.clone();
        let owned_tag = tag.to_string();

        self.blocking("forget", tag, cancel, move || {
            retry_removal("forget", &owned_tag, &trees, &token, || {
                claim(&trees.chains, &wanted)
            })
            .map(|_| ())
        })
        .await?;
        self.touched();
        Ok(())
    }

    async fn flush(&self) -> Result<(), BrainError> {
        // Cleared first so writes racing the flush stay marked.
        self.dirty.store(false, Ordering::Release);
        if let Err(err) = self.db.flush_async().await {
            self.touched();
            return Err(BrainError::storage("flush", "", err));
        }
        Ok(())
    }
}

#[async_trait]
impl Lookup for KvBrain {
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prefix: &[String],
    ) -> Result<Vec<Occurrence>, BrainError> {
        assert_eq!(
            prefix.len(),
            self.order,
            "lookup prefix has width {} but the brain has order {}",
            prefix.len(),
            self.order
        );
        let key = record_key(tag, prefix);
        let chains = self.trees.chains.clone();
        let owned_tag = tag.to_string();
        let read = self.blocking("lookup", tag, cancel, move || {
            let mut out = Vec::new();
            for entry in chains.scan_prefix(&key) {
                let (_, bytes) =
                    entry.map_err(|err| BrainError::storage("lookup", &owned_tag, err))?;
                out.push(
                    decode(&bytes).map_err(|err| BrainError::storage("lookup", &owned_tag, err))?,
                );
            }
            Ok(out)
        });
        tokio::select! {
            _ = cancel.cancelled() => Err(BrainError::Canceled),
            res = read => res,
        }
    }
}

#[async_trait]
impl Eraser for KvBrain {
    async fn message(
        &self,
        cancel: &CancellationToken,
        id: Uuid,
    ) -> Result<Option<MessageMeta>, BrainError> {
        let messages = self.trees.messages.clone();
        self.blocking("message", "", cancel, move || {
            let Some(bytes) = messages
                .get(id.as_bytes())
                .map_err(|err| BrainError::storage("message", "", err))?
            else {
                return Ok(None);
            };
            let stored =
                decode_message(&bytes).map_err(|err| BrainError::storage("message", "", err))?;
            Ok(Some(stored.meta))
        })
        .await
    }

    async fn forget_message(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        id: Uuid,
    ) -> Result<usize, BrainError> {
        let trees = self.trees.clone();
        let token = cancel.clone();
        let owned_tag = tag.to_string();
        let n = self
            .blocking("forget_message", tag, cancel, move || {
                let scope = tag_key(&owned_tag);
                retry_removal("forget_message", &owned_tag, &trees, &token, || {
                    let keys = occurrences_of(&trees.by_msg, id)
                        .map_err(|err| BrainError::storage("forget_message", &owned_tag, err))?;
                    Ok(keys.into_iter().filter(|k| k.starts_with(&scope)).collect())
                })
            })
            .await?;
        self.touched();
        Ok(n)
    }

    async fn forget_user(
        &self,
        cancel: &CancellationToken,
        user: &UserHash,
    ) -> Result<usize, BrainError> {
        let user = *user;
        let trees = self.trees.clone();
        let token = cancel.clone();
        let n = self
            .blocking("forget_user", "", cancel, move || {
                let mut ids = Vec::new();
                for entry in trees.by_user.scan_prefix(user.as_bytes()) {
                    let (key, _) =
                        entry.map_err(|err| BrainError::storage("forget_user", "", err))?;
                    let id = Uuid::from_slice(&key[USER_LEN..]).map_err(|err| {
                        BrainError::storage(
                            "forget_user",
                            "",
                            StorageError::Corrupt(format!("user index key: {err}")),
                        )
                    })?;
                    ids.push(id);
                }
                let mut n = 0;
                for id in ids {
                    n += retry_removal("forget_user", "", &trees, &token, || {
                        occurrences_of(&trees.by_msg, id)
                            .map_err(|err| BrainError::storage("forget_user", "", err))
                    })?;
                }
                Ok(n)
            })
            .await?;
        self.touched();
        Ok(n)
    }
}

/// Picks the oldest unclaimed occurrence for each wanted suffix, per record
/// key. Suffixes with no remaining occurrence are skipped.
fn claim(
    chains: &sled::Tree,
    wanted: &BTreeMap<Vec<u8>, Vec<String>>,
) -> Result<Vec<IVec>, BrainError> {
    let mut targets = Vec::new();
    for (record, suffixes) in wanted {
        let mut stored = Vec::new();
        for entry in chains.scan_prefix(record) {
            let (key, bytes) = entry.map_err(|err| BrainError::storage("forget", "", err))?;
            let occ = decode(&bytes).map_err(|err| BrainError::storage("forget", "", err))?;
            stored.push((key, occ.suffix));
        }
        let mut taken = HashSet::new();
        for suffix in suffixes {
            let free = (0..stored.len()).find(|i| !taken.contains(i) && &stored[*i].1 == suffix);
            if let Some(i) = free {
                taken.insert(i);
                targets.push(stored[i].0.clone());
            }
        }
    }
    Ok(targets)
}

/// Every occurrence key recorded for message `id`.
fn occurrences_of(by_msg: &sled::Tree, id: Uuid) -> Result<Vec<IVec>, sled::Error> {
    let mut keys = Vec::new();
    for entry in by_msg.scan_prefix(id.as_bytes()) {
        let (key, _) = entry?;
        keys.push(IVec::from(&key[ID_LEN..]));
    }
    Ok(keys)
}

/// Removes the keys chosen by `pick`, choosing again whenever a concurrent
/// call removed one of them first.
fn retry_removal<P>(
    op: &'static str,
    tag: &str,
    trees: &Trees,
    cancel: &CancellationToken,
    mut pick: P,
) -> Result<usize, BrainError>
where
    P: FnMut() -> Result<Vec<IVec>, BrainError>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(BrainError::Canceled);
        }
        let targets = pick()?;
        match remove_occurrences(trees, &targets, cancel) {
            Ok(n) => return Ok(n),
            Err(TransactionError::Abort(Abort::Stale)) => {
                tracing::trace!(op, tag, "claimed occurrence vanished, retrying");
            }
            Err(err) => return Err(tx_error(op, tag, err)),
        }
    }
}

/// Atomically removes `targets` with their index entries, dropping message
/// records whose last occurrence goes.
fn remove_occurrences(
    trees: &Trees,
    targets: &[IVec],
    cancel: &CancellationToken,
) -> Result<usize, TransactionError<Abort>> {
    if targets.is_empty() {
        return Ok(0);
    }
    let trees = (&trees.chains, &trees.messages, &trees.by_msg, &trees.by_user);
    trees.transaction(|(chains, messages, by_msg, by_user)| {
        let mut dropped: BTreeMap<Uuid, u64> = BTreeMap::new();
        for key in targets {
            let Some(bytes) = chains.remove(&key[..])? else {
                return Err(ConflictableTransactionError::Abort(Abort::Stale));
            };
            let occ = decode(&bytes).map_err(codec)?;
            by_msg.remove(msg_key(occ.id, key))?;
            *dropped.entry(occ.id).or_default() += 1;
        }
        for (id, n) in dropped {
            let id_bytes = &id.as_bytes()[..];
            let Some(bytes) = messages.get(id_bytes)? else {
                continue;
            };
            let mut stored = decode_message(&bytes).map_err(codec)?;
            stored.live = stored.live.saturating_sub(n);
            if stored.live == 0 {
                messages.remove(id_bytes)?;
                by_user.remove(user_key(&stored.meta.user, id))?;
            } else {
                messages.insert(id_bytes, bincode::serialize(&stored).map_err(codec)?)?;
            }
        }
        if cancel.is_cancelled() {
            return Err(ConflictableTransactionError::Abort(Abort::Canceled));
        }
        Ok(targets.len())
    })
}

fn tx_error(op: &'static str, tag: &str, err: TransactionError<Abort>) -> BrainError {
    match err {
        TransactionError::Abort(Abort::Canceled) => BrainError::Canceled,
        TransactionError::Abort(Abort::Stale) => BrainError::storage(
            op,
            tag,
            StorageError::Corrupt("occurrence vanished during removal".to_string()),
        ),
        TransactionError::Abort(Abort::Codec(err)) => BrainError::storage(op, tag, err),
        TransactionError::Storage(err) => BrainError::storage(op, tag, err),
    }
}

fn tag_key(tag: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + tag.len());
    push_component(&mut key, tag);
    key
}

fn record_key(tag: &str, prefix: &[String]) -> Vec<u8> {
    let mut key = tag_key(tag);
    for p in prefix {
        push_component(&mut key, p);
    }
    key
}

fn occurrence_key(tag: &str, prefix: &[String], seq: u64) -> Vec<u8> {
    let mut key = record_key(tag, prefix);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn msg_key(id: Uuid, occurrence: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN + occurrence.len());
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(occurrence);
    key
}

fn user_key(user: &UserHash, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(USER_LEN + ID_LEN);
    key.extend_from_slice(user.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn push_component(key: &mut Vec<u8>, s: &str) {
    key.extend_from_slice(&(s.len() as u32).to_be_bytes());
    key.extend_from_slice(s.as_bytes());
}

fn decode(bytes: &[u8]) -> Result<Occurrence, bincode::Error> {
    bincode::deserialize(bytes)
}

fn decode_message(bytes: &[u8]) -> Result<StoredMessage, bincode::Error> {
    bincode::deserialize(bytes)
}

fn decode_order(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}
