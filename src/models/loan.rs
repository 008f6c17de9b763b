//! # Loan
//!
//! Reference entity advanced by the close-of-business job. Only the derived
//! state the nightly pipeline touches is modelled; the arithmetic that fills
//! it in belongs to the business steps supplied by the domain layer.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{CobEntity, EntityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Submitted,
    Approved,
    Active,
    Overpaid,
    ClosedObligationsMet,
    ChargedOff,
}

impl LoanStatus {
    /// Loans that take part in nightly processing
    pub fn is_open(&self) -> bool {
        matches!(self, LoanStatus::Active | LoanStatus::Overpaid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelinquencyTag {
    pub classification: String,
    pub added_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: EntityId,
    pub external_id: Option<String>,
    pub status: LoanStatus,
    pub last_closed_business_date: Option<NaiveDate>,
    pub overdue: bool,
    pub days_overdue: u32,
    /// Accrued, unposted interest in minor currency units
    pub accrued_interest_minor: i64,
    pub delinquency_tags: Vec<DelinquencyTag>,
}

impl Loan {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            external_id: None,
            status: LoanStatus::Active,
            last_closed_business_date: None,
            overdue: false,
            days_overdue: 0,
            accrued_interest_minor: 0,
            delinquency_tags: Vec::new(),
        }
    }

    pub fn with_last_closed(mut self, date: NaiveDate) -> Self {
        self.last_closed_business_date = Some(date);
        self
    }

    pub fn with_status(mut self, status: LoanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn tag_delinquency(&mut self, classification: impl Into<String>, added_on: NaiveDate) {
        self.delinquency_tags.push(DelinquencyTag {
            classification: classification.into(),
            added_on,
        });
    }
}

impl CobEntity for Loan {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn last_closed_business_date(&self) -> Option<NaiveDate> {
        self.last_closed_business_date
    }

    fn close_business_date(&mut self, business_date: NaiveDate) {
        self.last_closed_business_date = Some(business_date);
    }

    fn is_cob_eligible(&self) -> bool {
        self.status.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_closed_for_compares_against_last_closed_date() {
        let loan = Loan::new(1).with_last_closed(date(2020, 3, 2));
        assert!(loan.is_closed_for(date(2020, 3, 1)));
        assert!(loan.is_closed_for(date(2020, 3, 2)));
        assert!(!loan.is_closed_for(date(2020, 3, 3)));
        assert!(!Loan::new(2).is_closed_for(date(2020, 3, 3)));
    }

    #[test]
    fn test_close_business_date_advances_loan() {
        let mut loan = Loan::new(1);
        loan.close_business_date(date(2020, 4, 4));
        assert_eq!(loan.last_closed_business_date, Some(date(2020, 4, 4)));
    }

    #[test]
    fn test_only_active_loans_are_open() {
        assert!(LoanStatus::Active.is_open());
        assert!(LoanStatus::Overpaid.is_open());
        assert!(!LoanStatus::ClosedObligationsMet.is_open());
        assert!(!LoanStatus::Submitted.is_open());
    }
}
