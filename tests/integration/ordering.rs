//! Session ordering holds for arbitrary request sequences.

use proptest::prelude::*;

use rtxn::api::WriteRequest;
use rtxn::core::ErrorCode;

use crate::fixtures::ops::{parent, session, upsert_inc};
use crate::fixtures::rig::Rig;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn txn_numbers_are_admitted_monotonically(numbers in prop::collection::vec(0u64..12, 1..24)) {
        let rig = Rig::memory();
        let s = session(9);
        let mut highest: Option<u64> = None;
        let mut applied = 0i64;

        for number in numbers {
            let request = WriteRequest::retryable(parent(s, number), [upsert_inc(1, "c")]);
            let result = rig.retry.execute(&request);
            match highest {
                Some(high) if number < high => {
                    let err = result.expect_err("lower number must be rejected");
                    prop_assert_eq!(err.code(), ErrorCode::TransactionTooOld);
                }
                Some(high) if number == high => {
                    let response = result.expect("same number replays");
                    prop_assert_eq!(response.retried_stmt_ids.len(), 1);
                }
                _ => {
                    let response = result.expect("higher number executes");
                    prop_assert!(response.retried_stmt_ids.is_empty());
                    applied += 1;
                    highest = Some(number);
                }
            }
            prop_assert_eq!(rig.field(1, "c"), Some(applied));
        }
    }
}
