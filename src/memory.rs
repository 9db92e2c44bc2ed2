//! In-memory loan store for tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::db::LoanStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{LoanRecord, NormalizedLoan};
use crate::period::AggregationFilter;

#[derive(Default)]
pub struct InMemoryLoanStore {
    loans: RwLock<Vec<LoanRecord>>,
    last_id: AtomicI64,
}

impl InMemoryLoanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, loans: &mut Vec<LoanRecord>, loan: &NormalizedLoan) -> LoanRecord {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = LoanRecord {
            id,
            loan: loan.clone(),
        };
        loans.push(record.clone());
        record
    }
}

fn stored_key<'a>(loans: &[LoanRecord], loan: &'a NormalizedLoan) -> Option<&'a str> {
    let key = loan.source_key.as_deref()?;
    loans
        .iter()
        .any(|record| record.loan.source_key.as_deref() == Some(key))
        .then_some(key)
}

#[async_trait]
impl LoanStore for InMemoryLoanStore {
    async fn insert_loan(&self, loan: &NormalizedLoan) -> StoreResult<LoanRecord> {
        let mut guard = self
            .loans
            .write()
            .map_err(|_| StoreError::Backend("loans lock poisoned".to_string()))?;
        if let Some(key) = stored_key(&guard, loan) {
            return Err(StoreError::Backend(format!(
                "loan with source key {key} is already stored"
            )));
        }
        Ok(self.push(&mut guard, loan))
    }

    async fn insert_many(&self, loans: &[NormalizedLoan]) -> StoreResult<usize> {
        let mut guard = self
            .loans
            .write()
            .map_err(|_| StoreError::Backend("loans lock poisoned".to_string()))?;
        let mut inserted = 0usize;
        for loan in loans {
            if stored_key(&guard, loan).is_none() {
                self.push(&mut guard, loan);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn fetch_loans(
        &self,
        filter: &AggregationFilter,
        prediction: Option<i32>,
    ) -> StoreResult<Vec<LoanRecord>> {
        let guard = self
            .loans
            .read()
            .map_err(|_| StoreError::Backend("loans lock poisoned".to_string()))?;
        Ok(guard
            .iter()
            .filter(|record| filter.matches(&record.loan.month, record.loan.year))
            .filter(|record| prediction.map_or(true, |flag| record.loan.prediction == Some(flag)))
            .cloned()
            .collect())
    }

    async fn delete_loan(&self, id: i64) -> StoreResult<bool> {
        let mut guard = self
            .loans
            .write()
            .map_err(|_| StoreError::Backend("loans lock poisoned".to_string()))?;
        let before = guard.len();
        guard.retain(|record| record.id != id);
        Ok(guard.len() < before)
    }

    async fn distinct_years(&self) -> StoreResult<Vec<i32>> {
        let guard = self
            .loans
            .read()
            .map_err(|_| StoreError::Backend("loans lock poisoned".to_string()))?;
        let mut years: Vec<i32> = guard.iter().map(|record| record.loan.year).collect();
        years.sort_unstable();
        years.dedup();
        Ok(years)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loan(month: &str, year: i32, prediction: Option<i32>) -> NormalizedLoan {
        NormalizedLoan {
            month: month.to_string(),
            year,
            prediction,
            ..NormalizedLoan::default()
        }
    }

    #[tokio::test]
    async fn filters_by_period_and_prediction() {
        let store = InMemoryLoanStore::new();
        store.insert_loan(&loan("September", 2026, Some(1))).await.unwrap();
        store.insert_loan(&loan("September", 2025, Some(0))).await.unwrap();
        store.insert_loan(&loan("October", 2026, Some(0))).await.unwrap();

        let september = AggregationFilter::new(Some("September"), None);
        assert_eq!(store.fetch_loans(&september, None).await.unwrap().len(), 2);
        assert_eq!(store.fetch_loans(&september, Some(0)).await.unwrap().len(), 1);

        let all = AggregationFilter::default();
        assert_eq!(store.fetch_loans(&all, Some(1)).await.unwrap().len(), 1);
        assert_eq!(store.distinct_years().await.unwrap(), vec![2025, 2026]);
    }

    #[tokio::test]
    async fn batches_skip_known_source_keys() {
        let store = InMemoryLoanStore::new();
        let mut first = loan("May", 2026, Some(0));
        first.source_key = Some("seed:1".to_string());
        let mut second = loan("May", 2026, Some(1));
        second.source_key = Some("seed:2".to_string());
        let unkeyed = loan("May", 2026, None);

        let batch = vec![first.clone(), second, unkeyed.clone(), first.clone()];
        assert_eq!(store.insert_many(&batch).await.unwrap(), 3);
        assert_eq!(store.insert_many(&batch).await.unwrap(), 1);

        let all = AggregationFilter::default();
        assert_eq!(store.fetch_loans(&all, None).await.unwrap().len(), 4);
        assert!(store.insert_loan(&first).await.is_err());
        assert!(store.insert_loan(&unkeyed).await.is_ok());
    }

    #[tokio::test]
    async fn delete_reports_missing_ids() {
        let store = InMemoryLoanStore::new();
        let record = store.insert_loan(&loan("May", 2026, None)).await.unwrap();
        assert!(store.delete_loan(record.id).await.unwrap());
        assert!(!store.delete_loan(record.id).await.unwrap());
    }
}
