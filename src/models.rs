use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;

/// A raw input field before coercion. Form posts and CSV exports carry the
/// same attribute as either a JSON number or a string, so every numeric
/// field goes through this instead of an implicit cast.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Numeric(f64),
    Text(String),
    Missing,
}

impl FieldValue {
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(number)) => number
                .as_f64()
                .map(FieldValue::Numeric)
                .unwrap_or(FieldValue::Missing),
            Some(Value::String(text)) if !text.trim().is_empty() => {
                FieldValue::Text(text.trim().to_string())
            }
            Some(Value::Bool(flag)) => FieldValue::Text(flag.to_string()),
            _ => FieldValue::Missing,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        let parsed = match self {
            FieldValue::Numeric(value) => Some(*value),
            FieldValue::Text(text) => text.trim().parse::<f64>().ok(),
            FieldValue::Missing => None,
        };
        parsed.filter(|value| value.is_finite())
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Numeric(value) => Some(value.to_string()),
            FieldValue::Text(text) => Some(text.clone()),
            FieldValue::Missing => None,
        }
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map(FieldValue::Numeric).unwrap_or(FieldValue::Missing)
    }
}

impl From<Option<&str>> for FieldValue {
    fn from(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(text) if !text.is_empty() => FieldValue::Text(text.to_string()),
            _ => FieldValue::Missing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Gender {
    Male,
    Female,
    #[serde(rename = "Sex Not Av")]
    NotAvailable,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
            Gender::NotAvailable => "Sex Not Av",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "unknown" => Some(RiskLevel::Unknown),
            _ => None,
        }
    }
}

/// A loan application after field normalization, ready to be scored and stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedLoan {
    pub month: String,
    pub year: i32,
    pub gender: Option<Gender>,
    pub age: Option<String>,
    pub region: Option<String>,
    pub income: Option<f64>,
    pub submission_of_application: Option<String>,
    pub approv_in_adv: Option<String>,
    pub credit_type: Option<String>,
    pub co_applicant_credit_type: Option<String>,
    pub credit_score: Option<f64>,
    pub credit_worthiness: Option<String>,
    pub open_credit: Option<String>,
    pub loan_type: Option<String>,
    pub loan_purpose: Option<String>,
    pub loan_amount: Option<f64>,
    pub rate_of_interest: Option<f64>,
    pub term: Option<String>,
    #[serde(serialize_with = "serialize_loan_limit")]
    pub loan_limit: Option<f64>,
    pub business_or_commercial: Option<String>,
    pub ltv: Option<f64>,
    pub secured_by: Option<String>,
    pub security_type: Option<String>,
    pub construction_type: Option<String>,
    pub occupancy_type: Option<String>,
    pub total_units: Option<String>,
    pub neg_ammortization: Option<String>,
    pub interest_only: Option<String>,
    pub lump_sum_payment: Option<String>,
    pub prediction: Option<i32>,
    pub probability: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    /// Natural key for batch loads; a second load with the same key is skipped.
    #[serde(skip)]
    pub source_key: Option<String>,
}

impl NormalizedLoan {
    pub fn is_default(&self) -> bool {
        self.prediction == Some(1)
    }

    pub fn is_active(&self) -> bool {
        self.prediction == Some(0)
    }

    /// Numeric attribute lookup by column name, used by scorecard models.
    pub fn numeric_feature(&self, name: &str) -> Option<Option<f64>> {
        let value = match name {
            "income" => self.income,
            "credit_score" => self.credit_score,
            "loan_amount" => self.loan_amount,
            "rate_of_interest" => self.rate_of_interest,
            "loan_limit" => self.loan_limit,
            "ltv" => self.ltv,
            "age" => FieldValue::from(self.age.as_deref()).as_f64(),
            _ => return None,
        };
        Some(value)
    }

    /// Categorical attribute lookup by column name, used by scorecard models.
    pub fn text_feature(&self, name: &str) -> Option<Option<&str>> {
        let value = match name {
            "gender" => self.gender.map(Gender::as_str),
            "age" => self.age.as_deref(),
            "region" => self.region.as_deref(),
            "submission_of_application" => self.submission_of_application.as_deref(),
            "approv_in_adv" => self.approv_in_adv.as_deref(),
            "credit_type" => self.credit_type.as_deref(),
            "co_applicant_credit_type" => self.co_applicant_credit_type.as_deref(),
            "credit_worthiness" => self.credit_worthiness.as_deref(),
            "open_credit" => self.open_credit.as_deref(),
            "loan_type" => self.loan_type.as_deref(),
            "loan_purpose" => self.loan_purpose.as_deref(),
            "term" => self.term.as_deref(),
            "business_or_commercial" => self.business_or_commercial.as_deref(),
            "secured_by" => self.secured_by.as_deref(),
            "security_type" => self.security_type.as_deref(),
            "construction_type" => self.construction_type.as_deref(),
            "occupancy_type" => self.occupancy_type.as_deref(),
            "total_units" => self.total_units.as_deref(),
            "neg_ammortization" => self.neg_ammortization.as_deref(),
            "interest_only" => self.interest_only.as_deref(),
            "lump_sum_payment" => self.lump_sum_payment.as_deref(),
            _ => return None,
        };
        Some(value)
    }
}

/// A persisted loan application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanRecord {
    pub id: i64,
    #[serde(flatten)]
    pub loan: NormalizedLoan,
}

fn serialize_loan_limit<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(limit) => serializer.serialize_str(&crate::normalize::loan_limit_label(*limit)),
        None => serializer.serialize_none(),
    }
}

/// Grouping key of a dashboard breakdown entry. The loan type/limit block is
/// keyed by a pair and serializes as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum GroupKey {
    Label(String),
    Pair(String, String),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Label(label) => f.write_str(label),
            GroupKey::Pair(first, second) => write!(f, "{first} / {second}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupRate {
    pub key: GroupKey,
    pub count: usize,
    pub default_rate_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityGroup {
    pub group_name: String,
    pub total: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Kpis {
    pub total_loans: usize,
    pub total_active_loans: usize,
    pub avg_loan_amount: f64,
    pub avg_overdue_rate_percent: f64,
    pub total_overdue_amount: f64,
    pub recovery_rate_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardPayload {
    #[serde(flatten)]
    pub kpis: Kpis,
    pub model_accuracy: f64,
    pub gender_risk: Vec<GroupRate>,
    pub region_risk: Vec<GroupRate>,
    pub loan_type_limit: Vec<GroupRate>,
    pub loan_purpose: Vec<GroupRate>,
    pub special_terms: Vec<GroupRate>,
    pub occupancy_risk: Vec<GroupRate>,
    pub submission_risk: Vec<GroupRate>,
    pub credit_worthiness_risk: Vec<GroupRate>,
    pub age_group_risk: Vec<GroupRate>,
    pub loan_amount_risk: Vec<GroupRate>,
    pub interest_rate_risk: Vec<GroupRate>,
    pub credit_capacity: Vec<CapacityGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub details: String,
}

/// What the dashboard boundary hands back: a payload, or a structured error
/// in place of one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DashboardOutcome {
    Ready(DashboardPayload),
    Failed(ErrorBody),
}
