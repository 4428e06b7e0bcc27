use proptest::prelude::*;
use proptest::sample::Index;
use loglens_core::WordStore;

proptest! {
    #[test]
    fn forward_then_inverse_restores_text((words, text) in words_and_text()) {
        let mut store = WordStore::in_memory();
        for word in &words {
            store.add(word, None).unwrap();
        }
        let (masked, counts) = store.forward_substitute(&text);
        prop_assert_eq!(store.inverse_substitute(&masked), text.clone());
        for word in counts.keys() {
            prop_assert!(words.contains(word));
        }
        prop_assert!(store.verify_round_trip(&text));
    }

    #[test]
    fn longer_word_beats_earlier_overlapping_word(
        long in "[a-z]{5,8}",
        lead in "[0-9]{1,2}",
        cut in 1usize..3,
    ) {
        // `short` starts before `long` in the text and overlaps its first letters.
        let short = format!("{lead}{}", &long[..cut]);
        let text = format!("{lead}{long}");
        let mut store = WordStore::in_memory();
        let short_placeholder = store.add(&short, None).unwrap();
        let long_placeholder = store.add(&long, None).unwrap();
        let (masked, counts) = store.forward_substitute(&text);
        prop_assert_eq!(&masked, &format!("{lead}{long_placeholder}"));
        prop_assert!(!masked.contains(&short_placeholder));
        prop_assert_eq!(counts.get(&long), Some(&1));
        prop_assert!(!counts.contains_key(&short));
        prop_assert_eq!(store.inverse_substitute(&masked), text);
    }

    #[test]
    fn text_without_known_words_is_untouched(text in "[A-Z0-9 ,.]{0,40}") {
        let mut store = WordStore::in_memory();
        store.add("secret", None).unwrap();
        store.add("hostname", None).unwrap();
        let (masked, counts) = store.forward_substitute(&text);
        prop_assert_eq!(&masked, &text);
        prop_assert!(counts.is_empty());
        prop_assert!(store.verify_round_trip(&text));
    }
}

/// Lowercase words none of which contains another, and a text mixing them with
/// filler.
fn words_and_text() -> impl Strategy<Value = (Vec<String>, String)> {
    let words = prop::collection::btree_set("[a-z]{3,8}", 1..8).prop_map(|set| {
        let all: Vec<String> = set.into_iter().collect();
        all.iter()
            .filter(|w| !all.iter().any(|other| other != *w && other.contains(w.as_str())))
            .cloned()
            .collect::<Vec<_>>()
    });
    let pieces = prop::collection::vec((any::<Index>(), "[a-z ,.:/-]{0,6}"), 0..12);
    (words, pieces).prop_map(|(words, pieces)| {
        let mut text = String::new();
        for (idx, filler) in pieces {
            text.push_str(&words[idx.index(words.len())]);
            text.push_str(&filler);
        }
        (words, text)
    })
}
