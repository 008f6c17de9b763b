mod common;

use chrono::{Days, NaiveDate};
use proptest::collection::{btree_map, btree_set};
use proptest::prelude::*;
use std::collections::BTreeMap;

use cob_core::models::{ExecutionMap, JobRunStatus};
use cob_core::orchestration::{
    pending_business_dates, ContextPropagator, ContextScope, ContextValue, RunContext,
};
use common::{config, date, execution_log, fail_fast, loans, steps_for, HarnessBuilder, RecordingStep, JOB};

fn context_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
    btree_map("[a-z]{1,6}", any::<i64>(), 0..8)
}

fn context_from(values: &BTreeMap<String, i64>, scope: ContextScope) -> RunContext {
    values
        .iter()
        .fold(RunContext::new(scope), |ctx, (key, value)| ctx.with(key.clone(), *value))
}

proptest! {
    /// Property: steps iterate in ascending sequence order whatever the insert order
    #[test]
    fn execution_map_iterates_ascending(orders in btree_set(0u32..10_000, 1..20), seed in any::<u64>()) {
        let mut shuffled: Vec<u32> = orders.iter().copied().collect();
        let len = shuffled.len();
        for i in 0..len {
            let j = ((seed.wrapping_add(i as u64 * 7919)) % len as u64) as usize;
            shuffled.swap(i, j);
        }

        let map = ExecutionMap::from_entries(
            "JOB",
            shuffled.iter().map(|order| (*order, format!("STEP_{order}"))),
        ).unwrap();

        let iterated: Vec<u32> = map.iter().map(|(order, _)| order).collect();
        let expected: Vec<u32> = orders.into_iter().collect();
        prop_assert_eq!(iterated, expected);
    }

    /// Property: every missed day is pending exactly once, oldest first, ending at the COB date
    #[test]
    fn pending_dates_cover_gap_exactly(gap in 0u64..120, offset in 0u32..300) {
        let cob_date = date(2022, 1, 1) + Days::new(u64::from(offset));
        let last_closed = cob_date - Days::new(gap);

        let dates = pending_business_dates(Some(last_closed), cob_date);

        prop_assert_eq!(dates.len() as u64, gap);
        if let Some(last) = dates.last() {
            prop_assert_eq!(*last, cob_date);
            prop_assert_eq!(dates[0], last_closed + Days::new(1));
        }
        prop_assert!(dates.windows(2).all(|pair| pair[1] == pair[0] + Days::new(1)));
    }

    /// Property: propagation fills absent keys and never overwrites narrower values
    #[test]
    fn propagation_never_overwrites(parent in context_strategy(), child in context_strategy()) {
        let source = context_from(&parent, ContextScope::Job);
        let mut target = context_from(&child, ContextScope::Entity);

        let copied = ContextPropagator::all().propagate(&source, &mut target);

        prop_assert_eq!(copied, parent.keys().filter(|key| !child.contains_key(*key)).count());
        for (key, value) in &child {
            prop_assert_eq!(target.get(key), Some(&ContextValue::Integer(*value)));
        }
        for key in parent.keys() {
            prop_assert!(target.contains(key));
        }
        prop_assert_eq!(target.scope(), ContextScope::Entity);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: any chunk size and worker count processes each candidate exactly once
    #[test]
    fn batch_processes_each_candidate_once(
        count in 0i64..60,
        chunk_size in 1usize..17,
        workers in 1usize..5,
    ) {
        let log = execution_log();
        let mut cfg = config(&["A", "B"], chunk_size, fail_fast());
        cfg.batch.worker_count = workers;
        let harness = HarnessBuilder::new(cfg, loans(count, date(2023, 2, 27)), date(2023, 3, 1))
            .step(RecordingStep::new("A", &log))
            .step(RecordingStep::new("B", &log))
            .build();

        let summary = tokio_test::block_on(async {
            let run_id = harness.service.run_job(JOB).await.unwrap();
            harness.service.run_status(run_id).unwrap()
        });

        prop_assert_eq!(summary.status, JobRunStatus::Completed);
        prop_assert_eq!(summary.counters.succeeded, count as u64);
        let expected_chunks = (count as usize).div_ceil(chunk_size) as u64;
        prop_assert_eq!(summary.counters.chunks_committed, expected_chunks);
        for id in 1..=count {
            prop_assert_eq!(steps_for(&log, id), vec!["A".to_string(), "B".to_string()]);
        }
        let closed: Vec<Option<NaiveDate>> = harness
            .loans
            .snapshot()
            .iter()
            .map(|loan| loan.last_closed_business_date)
            .collect();
        prop_assert!(closed.iter().all(|d| *d == Some(date(2023, 2, 28))));
    }
}
