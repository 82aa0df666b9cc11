//! AMQP topic matching.
//!
//! Routing keys and binding patterns are dot-separated words. In a pattern
//! `*` matches exactly one word and `#` matches zero or more.

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_family_wildcards() {
        assert!(topic_matches("threat.#", "threat.detected"));
        assert!(topic_matches("threat.#", "threat"));
        assert!(topic_matches("threat.*", "threat.blocked"));
        assert!(!topic_matches("threat.*", "threat"));
        assert!(!topic_matches("threat.#", "network.scan"));
        assert!(topic_matches("#", "device.data"));
        assert!(topic_matches("*.error", "system.error"));
        assert!(!topic_matches("*.error", "system.windows_log"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(topic_matches("a.#.z", "a.z"));
    }

    fn word() -> impl Strategy<Value = String> {
        "[a-z_]{1,8}"
    }

    proptest! {
        #[test]
        fn test_hash_matches_any_suffix(family in word(), rest in prop::collection::vec(word(), 0..4)) {
            let mut key = vec![family.clone()];
            key.extend(rest);
            let key = key.join(".");
            let pattern = format!("{}.#", family);
            prop_assert!(topic_matches(&pattern, &key));
            prop_assert!(topic_matches(&key, &key));
        }

        #[test]
        fn test_star_matches_exactly_one_word(words in prop::collection::vec(word(), 1..5)) {
            let key = words.join(".");
            let stars = vec!["*"; words.len()].join(".");
            prop_assert!(topic_matches(&stars, &key));
            let more = format!("{}.*", stars);
            prop_assert!(!topic_matches(&more, &key));
        }
    }
}
