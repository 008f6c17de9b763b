//! The contract a record must satisfy to be advanced by close-of-business.

use chrono::NaiveDate;
use std::collections::BTreeSet;

use super::EntityId;

pub trait CobEntity: Clone + Send + Sync + 'static {
    fn entity_id(&self) -> EntityId;

    /// Last business date for which the full pipeline completed
    fn last_closed_business_date(&self) -> Option<NaiveDate>;

    /// Mark the pipeline complete for `business_date`
    fn close_business_date(&mut self, business_date: NaiveDate);

    /// Steps already completed for `business_date`.
    ///
    /// Entities that checkpoint progress between steps report it here so the
    /// inline path only runs what is still pending. The default reports
    /// nothing, meaning the whole pipeline is pending.
    fn completed_steps(&self, _business_date: NaiveDate) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Whether the record takes part in nightly processing at all
    fn is_cob_eligible(&self) -> bool {
        true
    }

    /// Whether the pipeline already ran for `business_date`
    fn is_closed_for(&self, business_date: NaiveDate) -> bool {
        self.last_closed_business_date()
            .is_some_and(|closed| closed >= business_date)
    }
}
