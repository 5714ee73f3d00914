//! Tag reorganization for the tagging QA stage

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::pipeline::{MatchedTag, RequestRecord};

/// Re-key `matched_tags` by info type, keeping the best tag per category.
///
/// Higher likelihood wins; on equal likelihood the longer quote wins, and on
/// equal length the tag seen first is kept. Running it twice is a no-op.
pub fn reorg_matched_tags(record: &mut RequestRecord) {
    let incoming = std::mem::take(&mut record.matched_tags);
    let mut by_type: BTreeMap<String, MatchedTag> = BTreeMap::new();

    for (_quote, tag) in incoming {
        match by_type.entry(tag.info_type.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(tag);
            }
            Entry::Occupied(mut slot) => {
                if outranks(&tag, slot.get()) {
                    slot.insert(tag);
                }
            }
        }
    }

    record.matched_tags = by_type;
}

fn outranks(candidate: &MatchedTag, incumbent: &MatchedTag) -> bool {
    if candidate.likelihood != incumbent.likelihood {
        return candidate.likelihood > incumbent.likelihood;
    }
    candidate.quote.len() > incumbent.quote.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(quote: &str, info_type: &str, likelihood: u8) -> MatchedTag {
        MatchedTag {
            quote: quote.to_string(),
            info_type: info_type.to_string(),
            likelihood,
            begin_byte_offset: 0,
            end_byte_offset: quote.len() as i64,
        }
    }

    fn record_with(tags: Vec<MatchedTag>) -> RequestRecord {
        let mut record = RequestRecord::default();
        for t in tags {
            record.matched_tags.insert(t.quote.clone(), t);
        }
        record
    }

    #[test]
    fn longer_quote_wins_on_equal_likelihood() {
        let mut record = record_with(vec![
            tag("123 Main Street Southeast", "STREET_ADDRESS", 4),
            tag("123 Main Street", "STREET_ADDRESS", 4),
        ]);

        reorg_matched_tags(&mut record);

        assert_eq!(record.matched_tags.len(), 1);
        let best = &record.matched_tags["STREET_ADDRESS"];
        assert_eq!(best.quote, "123 Main Street Southeast");
        assert_eq!(best.likelihood, 4);
    }

    #[test]
    fn higher_likelihood_wins_regardless_of_order() {
        for (first, second) in [(5, 4), (4, 5)] {
            let mut record = record_with(vec![
                tag("123 Main Street Southeast", "STREET_ADDRESS", first),
                tag("123 Main Street", "STREET_ADDRESS", second),
            ]);

            reorg_matched_tags(&mut record);

            assert_eq!(record.matched_tags["STREET_ADDRESS"].likelihood, 5);
        }

        let mut record = record_with(vec![
            tag("123 Main Street Southeast", "STREET_ADDRESS", 3),
            tag("123 Main Street", "STREET_ADDRESS", 5),
        ]);
        reorg_matched_tags(&mut record);
        assert_eq!(record.matched_tags["STREET_ADDRESS"].quote, "123 Main Street");
    }

    #[test]
    fn one_entry_per_info_type() {
        let mut record = record_with(vec![
            tag("555-0100", "PHONE_NUMBER", 5),
            tag("Michael", "PERSON_NAME", 3),
            tag("Mike", "PERSON_NAME", 4),
            tag("02139", "US_ZIP", 2),
        ]);

        reorg_matched_tags(&mut record);

        assert_eq!(record.matched_tags.len(), 3);
        assert_eq!(record.matched_tags["PERSON_NAME"].quote, "Mike");
        assert_eq!(record.matched_tags["PHONE_NUMBER"].quote, "555-0100");
    }

    #[test]
    fn reorg_is_idempotent() {
        let mut once = record_with(vec![
            tag("123 Main Street Southeast", "STREET_ADDRESS", 4),
            tag("123 Main Street", "STREET_ADDRESS", 4),
            tag("Michael", "PERSON_NAME", 3),
        ]);
        reorg_matched_tags(&mut once);

        let mut twice = once.clone();
        reorg_matched_tags(&mut twice);

        assert_eq!(once, twice);
    }

    #[test]
    fn empty_tags_stay_empty() {
        let mut record = RequestRecord::default();
        reorg_matched_tags(&mut record);
        assert!(record.matched_tags.is_empty());
    }
}
