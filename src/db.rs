use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgExecutor, PgPool, PgRow};
use sqlx::Row;

use crate::error::{StoreError, StoreResult};
use crate::models::{FieldValue, LoanRecord, NormalizedLoan, RiskLevel};
use crate::normalize::{normalize, normalize_gender};
use crate::period::{AggregationFilter, PeriodStamp};
use crate::risk::{attach_score, Classifier};

/// Read/write access to persisted loans.
#[async_trait]
pub trait LoanStore: Send + Sync {
    async fn insert_loan(&self, loan: &NormalizedLoan) -> StoreResult<LoanRecord>;

    /// Stores a batch all-or-nothing. Loans whose `source_key` is already
    /// stored are skipped; returns how many were inserted.
    async fn insert_many(&self, loans: &[NormalizedLoan]) -> StoreResult<usize>;

    /// Loans tagged with the filter's period, optionally narrowed to one
    /// prediction flag, in id order.
    async fn fetch_loans(
        &self,
        filter: &AggregationFilter,
        prediction: Option<i32>,
    ) -> StoreResult<Vec<LoanRecord>>;

    /// Returns false when no loan had that id.
    async fn delete_loan(&self, id: i64) -> StoreResult<bool>;

    async fn distinct_years(&self) -> StoreResult<Vec<i32>>;
}

pub async fn init_db(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const LOAN_COLUMNS: &str = "month, year, gender, age, region, income, \
     submission_of_application, approv_in_adv, credit_type, co_applicant_credit_type, \
     credit_score, credit_worthiness, open_credit, loan_type, loan_purpose, loan_amount, \
     rate_of_interest, term, loan_limit, business_or_commercial, ltv, secured_by, \
     security_type, construction_type, occupancy_type, total_units, neg_ammortization, \
     interest_only, lump_sum_payment, prediction, probability, risk_level, source_key";

#[derive(Clone)]
pub struct PgLoanStore {
    pool: PgPool,
}

impl PgLoanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoanStore for PgLoanStore {
    async fn insert_loan(&self, loan: &NormalizedLoan) -> StoreResult<LoanRecord> {
        let Some(id) = insert_row(&self.pool, loan).await? else {
            return Err(StoreError::Backend(format!(
                "loan with source key {} is already stored",
                loan.source_key.as_deref().unwrap_or_default()
            )));
        };

        tracing::info!(id, month = %loan.month, year = loan.year, "stored loan");
        Ok(LoanRecord {
            id,
            loan: loan.clone(),
        })
    }

    async fn insert_many(&self, loans: &[NormalizedLoan]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for loan in loans {
            if insert_row(&mut *tx, loan).await?.is_some() {
                inserted += 1;
            }
        }

        tx.commit().await?;
        tracing::info!(inserted, skipped = loans.len() - inserted, "stored loan batch");
        Ok(inserted)
    }

    async fn fetch_loans(
        &self,
        filter: &AggregationFilter,
        prediction: Option<i32>,
    ) -> StoreResult<Vec<LoanRecord>> {
        let mut query = format!("SELECT id, {LOAN_COLUMNS} FROM loans WHERE TRUE");
        let mut placeholder = 0;

        if filter.month.is_some() {
            placeholder += 1;
            query.push_str(&format!(" AND month = ${placeholder}"));
        }
        if filter.year.is_some() {
            placeholder += 1;
            query.push_str(&format!(" AND year = ${placeholder}"));
        }
        if prediction.is_some() {
            placeholder += 1;
            query.push_str(&format!(" AND prediction = ${placeholder}"));
        }
        query.push_str(" ORDER BY id");

        let mut rows = sqlx::query(&query);
        if let Some(month) = &filter.month {
            rows = rows.bind(month);
        }
        if let Some(year) = filter.year {
            rows = rows.bind(year);
        }
        if let Some(prediction) = prediction {
            rows = rows.bind(prediction);
        }

        let records = rows.fetch_all(&self.pool).await?;
        let mut loans = Vec::with_capacity(records.len());
        for row in records {
            loans.push(loan_from_row(&row)?);
        }

        debug_assert!(loans
            .iter()
            .all(|record| filter.matches(&record.loan.month, record.loan.year)));
        tracing::debug!(period = %filter.label(), count = loans.len(), "fetched loans");
        Ok(loans)
    }

    async fn delete_loan(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM loans WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn distinct_years(&self) -> StoreResult<Vec<i32>> {
        let rows = sqlx::query("SELECT DISTINCT year FROM loans ORDER BY year")
            .fetch_all(&self.pool)
            .await?;
        let mut years = Vec::with_capacity(rows.len());
        for row in rows {
            years.push(row.try_get("year")?);
        }
        Ok(years)
    }
}

/// Returns `None` when a loan with the same `source_key` is already stored.
async fn insert_row<'e, E>(executor: E, loan: &NormalizedLoan) -> StoreResult<Option<i64>>
where
    E: PgExecutor<'e>,
{
    let query = format!(
        "INSERT INTO loans ({LOAN_COLUMNS}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
          $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33) \
         ON CONFLICT (source_key) DO NOTHING \
         RETURNING id"
    );

    let row = sqlx::query(&query)
        .bind(&loan.month)
        .bind(loan.year)
        .bind(loan.gender.map(|gender| gender.as_str()))
        .bind(&loan.age)
        .bind(&loan.region)
        .bind(loan.income)
        .bind(&loan.submission_of_application)
        .bind(&loan.approv_in_adv)
        .bind(&loan.credit_type)
        .bind(&loan.co_applicant_credit_type)
        .bind(loan.credit_score)
        .bind(&loan.credit_worthiness)
        .bind(&loan.open_credit)
        .bind(&loan.loan_type)
        .bind(&loan.loan_purpose)
        .bind(loan.loan_amount)
        .bind(loan.rate_of_interest)
        .bind(&loan.term)
        .bind(loan.loan_limit)
        .bind(&loan.business_or_commercial)
        .bind(loan.ltv)
        .bind(&loan.secured_by)
        .bind(&loan.security_type)
        .bind(&loan.construction_type)
        .bind(&loan.occupancy_type)
        .bind(&loan.total_units)
        .bind(&loan.neg_ammortization)
        .bind(&loan.interest_only)
        .bind(&loan.lump_sum_payment)
        .bind(loan.prediction)
        .bind(loan.probability)
        .bind(loan.risk_level.map(|level| level.as_str()))
        .bind(&loan.source_key)
        .fetch_optional(executor)
        .await?;

    match row {
        Some(row) => Ok(Some(row.try_get("id")?)),
        None => Ok(None),
    }
}

fn loan_from_row(row: &PgRow) -> StoreResult<LoanRecord> {
    let gender: Option<String> = row.try_get("gender")?;
    let risk_level: Option<String> = row.try_get("risk_level")?;
    let prediction: Option<i32> = row.try_get("prediction")?;

    if let Some(flag) = prediction {
        if flag != 0 && flag != 1 {
            return Err(StoreError::InvalidData {
                column: "prediction",
                value: flag.to_string(),
            });
        }
    }

    let risk_level = match risk_level {
        Some(text) => Some(RiskLevel::parse(&text).ok_or(StoreError::InvalidData {
            column: "risk_level",
            value: text,
        })?),
        None => None,
    };

    Ok(LoanRecord {
        id: row.try_get("id")?,
        loan: NormalizedLoan {
            month: row.try_get("month")?,
            year: row.try_get("year")?,
            gender: match FieldValue::from(gender.as_deref()) {
                FieldValue::Missing => None,
                value => Some(normalize_gender(&value)),
            },
            age: row.try_get("age")?,
            region: row.try_get("region")?,
            income: row.try_get("income")?,
            submission_of_application: row.try_get("submission_of_application")?,
            approv_in_adv: row.try_get("approv_in_adv")?,
            credit_type: row.try_get("credit_type")?,
            co_applicant_credit_type: row.try_get("co_applicant_credit_type")?,
            credit_score: row.try_get("credit_score")?,
            credit_worthiness: row.try_get("credit_worthiness")?,
            open_credit: row.try_get("open_credit")?,
            loan_type: row.try_get("loan_type")?,
            loan_purpose: row.try_get("loan_purpose")?,
            loan_amount: row.try_get("loan_amount")?,
            rate_of_interest: row.try_get("rate_of_interest")?,
            term: row.try_get("term")?,
            loan_limit: row.try_get("loan_limit")?,
            business_or_commercial: row.try_get("business_or_commercial")?,
            ltv: row.try_get("ltv")?,
            secured_by: row.try_get("secured_by")?,
            security_type: row.try_get("security_type")?,
            construction_type: row.try_get("construction_type")?,
            occupancy_type: row.try_get("occupancy_type")?,
            total_units: row.try_get("total_units")?,
            neg_ammortization: row.try_get("neg_ammortization")?,
            interest_only: row.try_get("interest_only")?,
            lump_sum_payment: row.try_get("lump_sum_payment")?,
            prediction,
            probability: row.try_get("probability")?,
            risk_level,
            source_key: row.try_get("source_key")?,
        },
    })
}

/// Normalizes, scores and stores one raw submission.
pub async fn submit_loan(
    store: &dyn LoanStore,
    classifier: &dyn Classifier,
    raw: &Map<String, Value>,
    stamp: &PeriodStamp,
) -> StoreResult<LoanRecord> {
    store.insert_loan(&prepare_loan(classifier, raw, stamp)).await
}

fn prepare_loan(
    classifier: &dyn Classifier,
    raw: &Map<String, Value>,
    stamp: &PeriodStamp,
) -> NormalizedLoan {
    let mut loan = normalize(raw, stamp);
    attach_score(classifier, &mut loan);
    loan
}

fn seed_rows() -> Vec<Value> {
    vec![
        serde_json::json!({
            "loan_limit": "cf", "Gender": "Male", "approv_in_adv": "nopre",
            "loan_type": "type1", "loan_purpose": "p1", "Credit_Worthiness": "l1",
            "open_credit": "nopc", "business_or_commercial": "nob/c", "loan_amount": 116500,
            "rate_of_interest": 3.99, "term": "360", "Neg_ammortization": "not_neg",
            "interest_only": "not_int", "lump_sum_payment": "not_lpsm",
            "construction_type": "sb", "occupancy_type": "pr", "Secured_by": "home",
            "total_units": "1U", "income": 1740, "Credit_type": "EXP", "Credit_Score": 758,
            "co-applicant_credit_type": "CIB", "Age": "25-34",
            "submission_of_application": "to_inst", "LTV": 98.73, "Region": "south",
            "Security_Type": "direct"
        }),
        serde_json::json!({
            "loan_limit": "cf", "Gender": "Male", "approv_in_adv": "nopre",
            "loan_type": "type2", "loan_purpose": "p1", "Credit_Worthiness": "l1",
            "open_credit": "nopc", "business_or_commercial": "b/c", "loan_amount": 206500,
            "term": "360", "Neg_ammortization": "not_neg", "interest_only": "not_int",
            "lump_sum_payment": "lpsm", "construction_type": "sb", "occupancy_type": "pr",
            "Secured_by": "home", "total_units": "1U", "income": 4980, "Credit_type": "EQUI",
            "Credit_Score": 552, "co-applicant_credit_type": "EXP", "Age": "55-64",
            "submission_of_application": "to_inst", "Region": "North", "Security_Type": "direct"
        }),
        serde_json::json!({
            "loan_limit": "cf", "Gender": "Sex Not Available", "approv_in_adv": "pre",
            "loan_type": "type1", "loan_purpose": "p4", "Credit_Worthiness": "l1",
            "open_credit": "nopc", "business_or_commercial": "nob/c", "loan_amount": 706500,
            "rate_of_interest": 4.56, "term": "360", "Neg_ammortization": "neg_amm",
            "interest_only": "not_int", "lump_sum_payment": "not_lpsm",
            "construction_type": "sb", "occupancy_type": "pr", "Secured_by": "home",
            "total_units": "1U", "income": 9480, "Credit_type": "EXP", "Credit_Score": 834,
            "co-applicant_credit_type": "CIB", "Age": "35-44",
            "submission_of_application": "to_inst", "LTV": 80.02, "Region": "south",
            "Security_Type": "direct"
        }),
        serde_json::json!({
            "loan_limit": "ncf", "Gender": "Joint", "approv_in_adv": "nopre",
            "loan_type": "type1", "loan_purpose": "p4", "Credit_Worthiness": "l1",
            "open_credit": "nopc", "business_or_commercial": "nob/c", "loan_amount": 346500,
            "rate_of_interest": 4.25, "term": "360", "Neg_ammortization": "not_neg",
            "interest_only": "int_only", "lump_sum_payment": "not_lpsm",
            "construction_type": "sb", "occupancy_type": "ir", "Secured_by": "home",
            "total_units": "1U", "income": 11880, "Credit_type": "CRIF", "Credit_Score": 587,
            "co-applicant_credit_type": "CIB", "Age": "45-54",
            "submission_of_application": "not_inst", "LTV": 69.37, "Region": "central",
            "Security_Type": "direct"
        }),
        serde_json::json!({
            "loan_limit": "cf", "Gender": "Female", "approv_in_adv": "nopre",
            "loan_type": "type3", "loan_purpose": "p3", "Credit_Worthiness": "l2",
            "open_credit": "opc", "business_or_commercial": "nob/c", "loan_amount": 2200000,
            "rate_of_interest": 5.5, "term": "180", "Neg_ammortization": "neg_amm",
            "interest_only": "not_int", "lump_sum_payment": "not_lpsm",
            "construction_type": "mh", "occupancy_type": "sr", "Secured_by": "land",
            "total_units": "2U", "income": 2400, "Credit_type": "EQUI", "Credit_Score": 640,
            "co-applicant_credit_type": "EXP", "Age": ">74",
            "submission_of_application": "not_inst", "LTV": 112.5, "Region": "North-East",
            "Security_Type": "Indriect"
        }),
    ]
}

/// Seed rows are keyed `seed:<n>`, so running the seed again inserts nothing.
pub async fn seed(
    store: &dyn LoanStore,
    classifier: &dyn Classifier,
    stamp: &PeriodStamp,
) -> anyhow::Result<usize> {
    let mut loans = Vec::new();
    for (index, row) in seed_rows().into_iter().enumerate() {
        if let Value::Object(raw) = row {
            let mut loan = prepare_loan(classifier, &raw, stamp);
            loan.source_key = Some(format!("seed:{}", index + 1));
            loans.push(loan);
        }
    }

    Ok(store.insert_many(&loans).await?)
}

/// Reads the whole file before writing anything. Rows are keyed by their
/// `source_key` column when present, otherwise by file name and row number,
/// so a re-run of the same export skips rows already stored.
pub async fn import_csv(
    store: &dyn LoanStore,
    classifier: &dyn Classifier,
    csv_path: &std::path::Path,
    stamp: &PeriodStamp,
) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let file_name = csv_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| csv_path.display().to_string());
    let mut loans = Vec::new();

    for (index, result) in reader.deserialize::<HashMap<String, String>>().enumerate() {
        let mut row = result.with_context(|| format!("{file_name}: bad row {}", index + 1))?;
        let source_key = row
            .remove("source_key")
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| format!("import:{file_name}:{}", index + 1));

        let raw: Map<String, Value> = row
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();

        let mut loan = prepare_loan(classifier, &raw, stamp);
        loan.source_key = Some(source_key);
        loans.push(loan);
    }

    let inserted = store.insert_many(&loans).await?;
    if inserted < loans.len() {
        tracing::info!(
            skipped = loans.len() - inserted,
            file = %file_name,
            "skipped rows already imported"
        );
    }
    Ok(inserted)
}
