use super::canon::Canonicalizer;

/// A single Markov chain transition: `prefix` is followed by `suffix`.
///
/// Prefix entries are canonicalized; the suffix keeps its surface form. The
/// empty string is the sentinel, padding prefixes before the start of a
/// message and standing as the suffix that ends one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub prefix: Vec<String>,
    pub suffix: String,
}

/// Builds the `toks.len() + 1` tuples recording `toks` into a chain of the
/// given order.
///
/// # Panics
///
/// Panics if `order` is zero.
pub fn tuples<S: AsRef<str>>(toks: &[S], order: usize, canon: &dyn Canonicalizer) -> Vec<Tuple> {
    assert!(order >= 1, "order must be at least 1, got {order}");
    let mut out = Vec::with_capacity(toks.len() + 1);
    let mut prefix = vec![String::new(); order];
    for tok in toks {
        let tok = tok.as_ref();
        debug_assert!(!tok.is_empty(), "empty token in learned message");
        out.push(Tuple {
            prefix: prefix.clone(),
            suffix: tok.to_string(),
        });
        slide(&mut prefix, canon.canonicalize(tok));
    }
    out.push(Tuple {
        prefix,
        suffix: String::new(),
    });
    out
}

/// Drops the oldest prefix entry and appends `next`.
pub(crate) fn slide(prefix: &mut [String], next: String) {
    prefix.rotate_left(1);
    if let Some(last) = prefix.last_mut() {
        *last = next;
    }
}

/// # Panics
///
/// Panics if any tuple's prefix is not exactly `order` entries wide.
pub(crate) fn assert_width(order: usize, tuples: &[Tuple]) {
    for t in tuples {
        assert_eq!(
            t.prefix.len(),
            order,
            "tuple prefix has width {} but the brain has order {}",
            t.prefix.len(),
            order
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::canon::CanonPolicy;

    fn tuple(prefix: &[&str], suffix: &str) -> Tuple {
        Tuple {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            suffix: suffix.to_string(),
        }
    }

    #[test]
    fn order_one_single_token() {
        let got = tuples(&["hi"], 1, &CanonPolicy::Identity);
        assert_eq!(got, vec![tuple(&[""], "hi"), tuple(&["hi"], "")]);
    }

    #[test]
    fn order_two_hello_world() {
        let got = tuples(&["hello", "world"], 2, &CanonPolicy::Identity);
        assert_eq!(
            got,
            vec![
                tuple(&["", ""], "hello"),
                tuple(&["", "hello"], "world"),
                tuple(&["hello", "world"], ""),
            ]
        );
    }

    #[test]
    fn prefixes_are_canonical_and_suffixes_are_not() {
        let got = tuples(&["Hello", "World"], 2, &CanonPolicy::Lowercase);
        assert_eq!(
            got,
            vec![
                tuple(&["", ""], "Hello"),
                tuple(&["", "hello"], "World"),
                tuple(&["hello", "world"], ""),
            ]
        );
    }

    #[test]
    fn empty_message_is_only_the_end() {
        let got = tuples::<&str>(&[], 3, &CanonPolicy::Identity);
        assert_eq!(got, vec![tuple(&["", "", ""], "")]);
    }

    #[test]
    fn count_and_entry_ramp_shape() {
        let toks: Vec<String> = (0..9).map(|i| format!("w{i}")).collect();
        for order in 1..=5 {
            for k in 0..toks.len() {
                let got = tuples(&toks[..k], order, &CanonPolicy::Identity);
                assert_eq!(got.len(), k + 1);
                assert_eq!(got.last().unwrap().suffix, "");
                for (i, t) in got.iter().enumerate().take(order.min(k)) {
                    let filled = t.prefix.iter().filter(|p| !p.is_empty()).count();
                    assert_eq!(filled, i, "order {order} tuple {i}");
                    assert_eq!(t.suffix, toks[i]);
                }
                for t in got.iter().skip(order).take(k.saturating_sub(order)) {
                    assert!(t.prefix.iter().all(|p| !p.is_empty()));
                }
            }
        }
    }

    #[test]
    fn sliding_window_uses_preceding_tokens() {
        let got = tuples(&["a", "b", "c", "d"], 2, &CanonPolicy::Identity);
        assert_eq!(got[3], tuple(&["b", "c"], "d"));
        assert_eq!(got[4], tuple(&["c", "d"], ""));
    }

    #[test]
    #[should_panic(expected = "order must be at least 1")]
    fn order_zero_panics() {
        tuples(&["x"], 0, &CanonPolicy::Identity);
    }

    #[test]
    #[should_panic(expected = "has width 1")]
    fn width_mismatch_panics() {
        assert_width(2, &[tuple(&[""], "x")]);
    }
}
