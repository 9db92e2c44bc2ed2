use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::models::{FieldValue, Gender, NormalizedLoan};
use crate::period::PeriodStamp;

/// Numeric value stored for a conforming ("cf") loan limit.
pub const CONFORMING_LIMIT: f64 = 500_000.0;

/// Input columns accepted on the write path. Outcome columns and the period
/// tag are deliberately absent: they are set by the write path itself.
const COLUMNS: &[&str] = &[
    "gender",
    "age",
    "region",
    "income",
    "submission_of_application",
    "approv_in_adv",
    "credit_type",
    "co_applicant_credit_type",
    "credit_score",
    "credit_worthiness",
    "open_credit",
    "loan_type",
    "loan_purpose",
    "loan_amount",
    "rate_of_interest",
    "term",
    "loan_limit",
    "business_or_commercial",
    "ltv",
    "secured_by",
    "security_type",
    "construction_type",
    "occupancy_type",
    "total_units",
    "neg_ammortization",
    "interest_only",
    "lump_sum_payment",
];

/// Spellings used by the loan-default dataset and older form builds.
const ALIASES: &[(&str, &str)] = &[
    ("co-applicant_credit_type", "co_applicant_credit_type"),
    ("Gender", "gender"),
    ("Age", "age"),
    ("Region", "region"),
    ("Credit_type", "credit_type"),
    ("Credit_Score", "credit_score"),
    ("Credit_Worthiness", "credit_worthiness"),
    ("Secured_by", "secured_by"),
    ("Security_Type", "security_type"),
    ("LTV", "ltv"),
    ("Neg_ammortization", "neg_ammortization"),
];

pub fn normalize(raw: &Map<String, Value>, stamp: &PeriodStamp) -> NormalizedLoan {
    let mut fields: HashMap<&'static str, &Value> = HashMap::new();

    for (key, value) in raw {
        if let Some(column) = COLUMNS.iter().find(|column| **column == key.as_str()) {
            fields.insert(*column, value);
        }
    }

    for (key, value) in raw {
        if let Some((_, column)) = ALIASES.iter().find(|(alias, _)| *alias == key.as_str()) {
            fields.entry(*column).or_insert(value);
        } else if !COLUMNS.contains(&key.as_str()) {
            tracing::debug!(field = %key, "dropping unknown loan field");
        }
    }

    let field = |name: &str| FieldValue::from_json(fields.get(name).copied());
    let text = |name: &str| field(name).as_text();
    let number = |name: &str| field(name).as_f64();

    NormalizedLoan {
        month: stamp.month.clone(),
        year: stamp.year,
        gender: Some(normalize_gender(&field("gender"))),
        age: text("age"),
        region: text("region"),
        income: number("income"),
        submission_of_application: text("submission_of_application"),
        approv_in_adv: text("approv_in_adv"),
        credit_type: text("credit_type"),
        co_applicant_credit_type: text("co_applicant_credit_type"),
        credit_score: number("credit_score"),
        credit_worthiness: text("credit_worthiness"),
        open_credit: text("open_credit"),
        loan_type: text("loan_type"),
        loan_purpose: text("loan_purpose"),
        loan_amount: number("loan_amount"),
        rate_of_interest: number("rate_of_interest"),
        term: text("term"),
        loan_limit: normalize_loan_limit(&field("loan_limit")),
        business_or_commercial: text("business_or_commercial"),
        ltv: number("ltv"),
        secured_by: text("secured_by"),
        security_type: text("security_type"),
        construction_type: text("construction_type"),
        occupancy_type: text("occupancy_type"),
        total_units: text("total_units"),
        neg_ammortization: text("neg_ammortization"),
        interest_only: text("interest_only"),
        lump_sum_payment: text("lump_sum_payment"),
        prediction: None,
        probability: None,
        risk_level: None,
        source_key: None,
    }
}

/// "female" has to be checked first since it contains "male".
pub fn normalize_gender(value: &FieldValue) -> Gender {
    let lowered = value.as_text().unwrap_or_default().to_lowercase();
    if lowered.contains("female") {
        Gender::Female
    } else if lowered.contains("male") {
        Gender::Male
    } else {
        Gender::NotAvailable
    }
}

pub fn normalize_loan_limit(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Text(text) => match text.trim().to_lowercase().as_str() {
            "cf" => Some(CONFORMING_LIMIT),
            "ncf" => Some(0.0),
            _ => value.as_f64(),
        },
        _ => value.as_f64(),
    }
}

/// Renders a stored limit back in the form encoding.
pub fn loan_limit_label(limit: f64) -> String {
    if limit == 0.0 {
        "ncf".to_string()
    } else if limit >= CONFORMING_LIMIT {
        "cf".to_string()
    } else {
        limit.to_string()
    }
}
