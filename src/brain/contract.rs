//! Behavior every brain backend must share. Each backend's tests run these
//! against a fresh store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    forget, learn, tuples, walk, Brain, CanonPolicy, Eraser, Learner, Lookup, MessageMeta,
    Occurrence, SpeakLimits,
};
use crate::userhash::UserHash;

const CANON: CanonPolicy = CanonPolicy::Lowercase;

pub async fn learn_message<B: Learner + ?Sized>(brain: &B, tag: &str, toks: &[&str]) -> Uuid {
    learn_as(brain, tag, UserHash::default(), toks).await
}

pub async fn learn_as<B: Learner + ?Sized>(
    brain: &B,
    tag: &str,
    user: UserHash,
    toks: &[&str],
) -> Uuid {
    let meta = MessageMeta {
        id: Uuid::new_v4(),
        user,
        tag: tag.to_string(),
        time: Utc::now(),
    };
    learn(brain, &CANON, &CancellationToken::new(), &meta, toks)
        .await
        .unwrap();
    meta.id
}

async fn forget_message_toks<B: Learner + ?Sized>(brain: &B, tag: &str, toks: &[&str]) {
    forget(brain, &CANON, &CancellationToken::new(), tag, toks)
        .await
        .unwrap();
}

fn start<B: Learner + ?Sized>(brain: &B) -> Vec<String> {
    vec![String::new(); brain.order()]
}

async fn at<B: Lookup + ?Sized>(brain: &B, tag: &str, prefix: &[String]) -> Vec<Occurrence> {
    brain
        .lookup(&CancellationToken::new(), tag, prefix)
        .await
        .unwrap()
}

/// Whether a message record for `id` remains, checking its tag and user.
async fn recorded<B: Eraser + ?Sized>(brain: &B, id: Uuid, tag: &str, user: UserHash) -> bool {
    match brain.message(&CancellationToken::new(), id).await.unwrap() {
        Some(meta) => {
            assert_eq!((meta.id, meta.tag.as_str(), meta.user), (id, tag, user));
            true
        }
        None => false,
    }
}

/// Occurrences stored under every distinct prefix `toks` would produce.
async fn stored<B: Brain + ?Sized>(brain: &B, tag: &str, toks: &[&str]) -> usize {
    let prefixes: BTreeSet<Vec<String>> = tuples(toks, brain.order(), &CANON)
        .into_iter()
        .map(|t| t.prefix)
        .collect();
    let mut n = 0;
    for prefix in &prefixes {
        n += at(brain, tag, prefix).await.len();
    }
    n
}

pub async fn learn_forget_round_trip<B: Brain + ?Sized>(brain: &B) {
    let anon = UserHash::default();
    let toks = ["hello", "world"];
    let id = learn_message(brain, "x", &toks).await;
    assert_eq!(stored(brain, "x", &toks).await, toks.len() + 1);
    assert!(recorded(brain, id, "x", anon).await);

    forget_message_toks(brain, "x", &toks).await;
    assert_eq!(stored(brain, "x", &toks).await, 0);
    assert!(at(brain, "x", &start(brain)).await.is_empty());
    assert!(!recorded(brain, id, "x", anon).await);

    let older = learn_message(brain, "x", &toks).await;
    let newer = learn_message(brain, "x", &toks).await;
    forget_message_toks(brain, "x", &toks).await;
    assert_eq!(stored(brain, "x", &toks).await, toks.len() + 1);
    assert!(!recorded(brain, older, "x", anon).await);
    assert!(recorded(brain, newer, "x", anon).await);
}

pub async fn repeated_tuple_in_one_message<B: Brain + ?Sized>(brain: &B) {
    assert_eq!(brain.order(), 1);
    let toks = ["a", "a", "a"];
    let id = learn_message(brain, "x", &toks).await;
    let after_a: Vec<String> = at(brain, "x", &["a".to_string()])
        .await
        .into_iter()
        .map(|o| o.suffix)
        .collect();
    assert_eq!(after_a, vec!["a", "a", ""]);

    // Both copies of ("a", "a") go in one call.
    forget_message_toks(brain, "x", &toks).await;
    assert!(at(brain, "x", &["a".to_string()]).await.is_empty());
    assert_eq!(stored(brain, "x", &toks).await, 0);
    assert!(!recorded(brain, id, "x", UserHash::default()).await);
}

pub async fn forget_absent_is_noop<B: Brain + ?Sized>(brain: &B) {
    learn_message(brain, "x", &["a", "b"]).await;
    forget_message_toks(brain, "x", &["c", "d"]).await;
    forget_message_toks(brain, "nothing here", &["a", "b"]).await;
    assert_eq!(stored(brain, "x", &["a", "b"]).await, 3);
    let first = at(brain, "x", &start(brain)).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].suffix, "a");
}

pub async fn forget_removes_oldest_single_occurrence<B: Brain + ?Sized>(brain: &B) {
    let toks = ["hello", "world"];
    let older = learn_message(brain, "x", &toks).await;
    let newer = learn_message(brain, "x", &toks).await;
    let both = at(brain, "x", &start(brain)).await;
    assert_eq!(
        both.iter().map(|o| o.id).collect::<Vec<_>>(),
        vec![older, newer]
    );

    forget_message_toks(brain, "x", &toks).await;
    let left = at(brain, "x", &start(brain)).await;
    assert_eq!(
        left,
        vec![Occurrence {
            suffix: "hello".to_string(),
            id: newer
        }]
    );
}

pub async fn tag_isolation<B: Brain + ?Sized>(brain: &B) {
    let toks = ["hello", "world"];
    learn_message(brain, "a", &toks).await;
    learn_message(brain, "b", &toks).await;
    learn_message(brain, "b", &["secret", "stuff"]).await;

    let suffixes: Vec<String> = at(brain, "a", &start(brain))
        .await
        .into_iter()
        .map(|o| o.suffix)
        .collect();
    assert_eq!(suffixes, vec!["hello".to_string()]);

    forget_message_toks(brain, "a", &toks).await;
    assert_eq!(stored(brain, "a", &toks).await, 0);
    // Tag "b" still has both messages' start occurrences.
    assert_eq!(stored(brain, "b", &toks).await, toks.len() + 2);
    let suffixes: Vec<String> = at(brain, "b", &start(brain))
        .await
        .into_iter()
        .map(|o| o.suffix)
        .collect();
    assert_eq!(suffixes, vec!["hello".to_string(), "secret".to_string()]);
}

pub async fn suffix_keeps_surface_form<B: Brain + ?Sized>(brain: &B) {
    assert_eq!(brain.order(), 1);
    learn_message(brain, "x", &["I", "Like", "TRAINS"]).await;

    let got = at(brain, "x", &["like".to_string()]).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].suffix, "TRAINS");
    assert!(at(brain, "x", &["Like".to_string()]).await.is_empty());

    // A suffix only matches its exact surface form.
    forget_message_toks(brain, "x", &["i", "like", "trains"]).await;
    assert_eq!(at(brain, "x", &["like".to_string()]).await.len(), 1);
    forget_message_toks(brain, "x", &["I", "Like", "TRAINS"]).await;
    assert!(at(brain, "x", &["like".to_string()]).await.is_empty());
}

pub async fn forget_message<B: Brain + ?Sized>(brain: &B) {
    let cancel = CancellationToken::new();
    let gone = learn_message(brain, "x", &["a", "b", "c"]).await;
    let kept = learn_message(brain, "x", &["a", "b", "d"]).await;
    let elsewhere = learn_message(brain, "y", &["q"]).await;

    assert_eq!(brain.forget_message(&cancel, "x", gone).await.unwrap(), 4);
    assert!(!recorded(brain, gone, "x", UserHash::default()).await);
    assert!(recorded(brain, kept, "x", UserHash::default()).await);
    let first = at(brain, "x", &start(brain)).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, kept);
    assert_eq!(stored(brain, "x", &["a", "b", "d"]).await, 4);

    assert_eq!(brain.forget_message(&cancel, "x", gone).await.unwrap(), 0);
    assert_eq!(brain.forget_message(&cancel, "x", elsewhere).await.unwrap(), 0);
    assert_eq!(stored(brain, "y", &["q"]).await, 2);
    assert!(recorded(brain, elsewhere, "y", UserHash::default()).await);
}

pub async fn forget_user<B: Brain + ?Sized>(brain: &B) {
    let cancel = CancellationToken::new();
    let bocchi = UserHash::from_bytes([1; 32]);
    let kita = UserHash::from_bytes([2; 32]);
    let first_msg = learn_as(brain, "x", bocchi, &["one", "two"]).await;
    let second_msg = learn_as(brain, "y", bocchi, &["three"]).await;
    let kept = learn_as(brain, "x", kita, &["one", "four"]).await;

    assert_eq!(brain.forget_user(&cancel, &bocchi).await.unwrap(), 5);
    assert!(!recorded(brain, first_msg, "x", bocchi).await);
    assert!(!recorded(brain, second_msg, "y", bocchi).await);
    assert!(recorded(brain, kept, "x", kita).await);
    let first = at(brain, "x", &start(brain)).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, kept);
    assert!(at(brain, "y", &start(brain)).await.is_empty());
    assert_eq!(stored(brain, "x", &["one", "four"]).await, 3);

    assert_eq!(brain.forget_user(&cancel, &bocchi).await.unwrap(), 0);
}

pub async fn canceled_learn_writes_nothing<B: Brain + ?Sized>(brain: &B) {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let meta = MessageMeta {
        id: Uuid::new_v4(),
        user: UserHash::default(),
        tag: "x".to_string(),
        time: Utc::now(),
    };
    let err = learn(brain, &CANON, &cancel, &meta, &["hello", "world"])
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(stored(brain, "x", &["hello", "world"]).await, 0);

    learn_message(brain, "x", &["hello", "world"]).await;
    let err = forget(brain, &CANON, &cancel, "x", &["hello", "world"])
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(stored(brain, "x", &["hello", "world"]).await, 3);
}

/// Generation reads only its own tag and always halts.
pub async fn speak_over_backend<B: Brain + ?Sized>(brain: &B) {
    async fn speak<B: Brain + ?Sized>(brain: &B, tag: &str, seed: u64) -> Option<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        let limits = SpeakLimits {
            max_steps: 32,
            max_chars: 200,
        };
        let speech = walk(
            brain,
            brain.order(),
            &CANON,
            &CancellationToken::new(),
            tag,
            &[] as &[&str],
            limits,
            &mut rng,
        )
        .await
        .unwrap();
        if let Some(s) = &speech {
            assert!(s.trace.len() <= limits.max_steps);
            assert!(s.text.chars().count() <= limits.max_chars);
        }
        speech.map(|s| s.text)
    }

    assert_eq!(speak(brain, "a", 1).await, None);

    learn_message(brain, "a", &["the", "cat", "sat"]).await;
    learn_message(brain, "a", &["the", "dog", "sat", "the", "dog", "sat"]).await;
    learn_message(brain, "b", &["the", "secret", "plan"]).await;
    learn_message(brain, "b", &["secret"]).await;

    for seed in 0..32 {
        let text = speak(brain, "a", seed).await.unwrap();
        assert!(text.starts_with("the "), "{text:?}");
        assert!(!text.contains("secret") && !text.contains("plan"), "{text:?}");
    }
    assert_eq!(speak(brain, "c", 1).await, None);
}

pub async fn concurrent_learn_forget<B: Brain + ?Sized + 'static>(brain: Arc<B>) {
    const TOKS: [&str; 2] = ["hello", "world"];
    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let brain = brain.clone();
        tasks.spawn(async move {
            learn_message(brain.as_ref(), "x", &TOKS).await;
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    // Every forget finds an occurrence, so the result is independent of
    // how the two halves interleave.
    for i in 0..16 {
        let brain = brain.clone();
        tasks.spawn(async move {
            if i % 2 == 0 {
                forget_message_toks(brain.as_ref(), "x", &TOKS).await;
            } else {
                learn_message(brain.as_ref(), "x", &TOKS).await;
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    let brain = brain.as_ref();
    assert_eq!(at(brain, "x", &start(brain)).await.len(), 16);
    assert_eq!(stored(brain, "x", &TOKS).await, 16 * (TOKS.len() + 1));
}

pub async fn concurrent_tags<B: Brain + ?Sized + 'static>(brain: Arc<B>) {
    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let brain = brain.clone();
        tasks.spawn(async move {
            let tag = format!("tag{i}");
            let word = format!("word{i}");
            learn_message(brain.as_ref(), &tag, &[word.as_str()]).await
        });
    }
    let mut ids = Vec::new();
    while let Some(res) = tasks.join_next().await {
        ids.push(res.unwrap());
    }
    assert_eq!(ids.len(), 8);

    let brain = brain.as_ref();
    for i in 0..8 {
        let got = at(brain, &format!("tag{i}"), &start(brain)).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].suffix, format!("word{i}"));
        assert!(ids.contains(&got[0].id));
    }
}
