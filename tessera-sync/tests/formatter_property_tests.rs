//! Property tests for format-at-read.

use proptest::prelude::*;
use tessera_core::RefNames;
use tessera_sync::{format, LabelLookup};
use tessera_test_utils::fixtures::user_names;
use tessera_test_utils::generators::{arb_metadata, arb_record};

fn ref_names() -> RefNames {
    user_names()
}

proptest! {
    #[test]
    fn prop_format_is_deterministic(
        records in prop::collection::vec(arb_record(), 0..8),
        metadata in arb_metadata(),
    ) {
        let labels = LabelLookup::new();
        let first = format(&records, &metadata, &ref_names(), &labels);
        let second = format(&records, &metadata, &ref_names(), &labels);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_format_leaves_raw_records_untouched(
        records in prop::collection::vec(arb_record(), 0..8),
        metadata in arb_metadata(),
    ) {
        let snapshot = records.clone();
        let formatted = format(&records, &metadata, &ref_names(), &LabelLookup::new());
        prop_assert_eq!(&records, &snapshot);
        prop_assert_eq!(formatted.len(), records.len());
        for (out, raw) in formatted.iter().zip(&records) {
            prop_assert_eq!(&out.raw, raw);
        }
    }

    #[test]
    fn prop_one_cell_per_visible_field(record in arb_record(), metadata in arb_metadata()) {
        let formatted = format(std::slice::from_ref(&record), &metadata, &ref_names(), &LabelLookup::new());
        let visible: Vec<&str> = metadata.visible_fields().map(|(name, _)| name).collect();
        let cells: Vec<&str> = formatted[0].cells.iter().map(|cell| cell.field.as_str()).collect();
        prop_assert_eq!(cells, visible);
    }
}
