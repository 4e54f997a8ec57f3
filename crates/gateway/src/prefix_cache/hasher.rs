//! Incremental hashing over a prompt prefix.

use sha2::{Digest, Sha256};

use crate::token_counter;

/// Cumulative hasher over the ordered prompt prefix.
///
/// `Sha256` is `Clone`, which is what makes breakpoints cheap: a snapshot
/// clones the intermediate state instead of consuming the hasher, so hashing
/// continues after every boundary.
#[derive(Default)]
pub(crate) struct CumulativeHasher {
    hasher: Sha256,
    tokens: u32,
}

impl CumulativeHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            tokens: 0,
        }
    }

    /// Feed one piece of text, counting its tokens as it goes.
    pub fn feed(&mut self, text: &str) {
        self.hasher.update(text.as_bytes());
        self.tokens += token_counter::count_text(text);
    }

    /// The hash and token count so far, without consuming the hasher.
    pub fn snapshot(&self) -> (String, u32) {
        let digest = self.hasher.clone().finalize();
        (format!("{digest:x}"), self.tokens)
    }
}

/// Serialize a JSON value with object keys sorted recursively.
///
/// The breakpoint hash must be a pure function of the content, independent
/// of the key order a client happened to send.
pub(crate) fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshots_do_not_consume_the_hasher() {
        let mut hasher = CumulativeHasher::new();

        hasher.feed("prefix");
        let (first_hash, first_tokens) = hasher.snapshot();

        hasher.feed("more");
        let (second_hash, second_tokens) = hasher.snapshot();

        assert_ne!(first_hash, second_hash);
        assert!(second_tokens > first_tokens);

        // The first snapshot is reproducible from the same input.
        let mut other = CumulativeHasher::new();
        other.feed("prefix");
        assert_eq!(other.snapshot().0, first_hash);
    }

    #[test]
    fn feeding_in_fragments_matches_feeding_whole() {
        let mut fragments = CumulativeHasher::new();
        fragments.feed("hello ");
        fragments.feed("world");

        let mut whole = CumulativeHasher::new();
        whole.feed("hello world");

        assert_eq!(fragments.snapshot().0, whole.snapshot().0);
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, {"k": 2, "j": 3}]}});
        let b = json!({"a": {"y": [1, {"j": 3, "k": 2}], "z": true}, "b": 1});

        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"y":[1,{"j":3,"k":2}],"z":true},"b":1}"#
        );
    }
}
