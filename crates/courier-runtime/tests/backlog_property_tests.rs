//! Property-based tests for the backlog queue

use std::time::Duration;

use courier_runtime::{BacklogQueue, Envelope};
use proptest::prelude::*;

fn arb_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{1,24}"
}

fn envelope(text: &str) -> Envelope {
    Envelope::new_text("alice", "bob", text).unwrap()
}

proptest! {
    #[test]
    fn single_consumer_drains_in_acceptance_order(
        texts in prop::collection::vec(arb_text(), 1..40),
        capacity in 1usize..20,
    ) {
        let backlog = BacklogQueue::new(capacity).unwrap();
        let mut accepted = Vec::new();

        for text in &texts {
            if backlog.offer(envelope(text)) {
                accepted.push(text.clone());
            }
            prop_assert!(backlog.len() <= capacity);
        }
        prop_assert_eq!(accepted.len(), texts.len().min(capacity));

        let mut drained = Vec::new();
        while let Some(envelope) = backlog.take() {
            drained.push(envelope.text().unwrap().into_owned());
        }
        prop_assert_eq!(drained, accepted);
    }

    #[test]
    fn shrinking_keeps_the_oldest(
        count in 1usize..30,
        shrink_to in 1usize..30,
    ) {
        let backlog = BacklogQueue::new(32).unwrap();
        for i in 0..count {
            let text = format!("m{}", i);
            prop_assert!(backlog.offer(envelope(&text)));
        }

        let discarded = backlog.set_capacity(shrink_to).unwrap();
        prop_assert_eq!(discarded, count.saturating_sub(shrink_to));
        prop_assert_eq!(backlog.len(), count.min(shrink_to));

        let first = backlog.take().unwrap();
        prop_assert_eq!(first.text().unwrap(), "m0");
    }

    #[test]
    fn timed_offer_on_full_backlog_gives_up(capacity in 1usize..5) {
        let backlog = BacklogQueue::new(capacity).unwrap();
        for _ in 0..capacity {
            prop_assert!(backlog.offer(envelope("filler")));
        }

        let accepted = tokio_test::block_on(
            backlog.offer_timeout(envelope("late"), Duration::from_millis(2)),
        );
        prop_assert!(!accepted);
        prop_assert_eq!(backlog.len(), capacity);
    }
}
