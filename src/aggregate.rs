use std::collections::BTreeMap;

use crate::models::{
    CapacityGroup, DashboardPayload, FieldValue, GroupKey, GroupRate, Kpis, LoanRecord,
    NormalizedLoan,
};
use crate::normalize::CONFORMING_LIMIT;
use crate::period::AggregationFilter;
use crate::report::{assemble, empty_payload, GroupBlocks};

pub const AGE_BUCKETS: [&str; 7] = ["<25", "25-34", "35-44", "45-54", "55-64", "65-74", ">74"];
pub const AMOUNT_BUCKETS: [&str; 4] = ["<300k", "300k-900k", "900k-2M", ">2M"];
pub const RATE_BUCKETS: [&str; 4] = ["<3%", "3-4%", "4-5%", ">=5%"];
pub const CREDIT_BANDS: [&str; 5] = ["Poor", "Fair", "Good", "Very Good", "Excellent"];

/// Breakdown dimensions reported on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Gender,
    Region,
    LoanTypeLimit,
    LoanPurpose,
    SpecialTerms,
    Occupancy,
    Submission,
    CreditWorthiness,
    AgeGroup,
    LoanAmount,
    InterestRate,
}

impl Dimension {
    pub const ALL: [Dimension; 11] = [
        Dimension::Gender,
        Dimension::Region,
        Dimension::LoanTypeLimit,
        Dimension::LoanPurpose,
        Dimension::SpecialTerms,
        Dimension::Occupancy,
        Dimension::Submission,
        Dimension::CreditWorthiness,
        Dimension::AgeGroup,
        Dimension::LoanAmount,
        Dimension::InterestRate,
    ];

    pub fn payload_key(self) -> &'static str {
        match self {
            Dimension::Gender => "gender_risk",
            Dimension::Region => "region_risk",
            Dimension::LoanTypeLimit => "loan_type_limit",
            Dimension::LoanPurpose => "loan_purpose",
            Dimension::SpecialTerms => "special_terms",
            Dimension::Occupancy => "occupancy_risk",
            Dimension::Submission => "submission_risk",
            Dimension::CreditWorthiness => "credit_worthiness_risk",
            Dimension::AgeGroup => "age_group_risk",
            Dimension::LoanAmount => "loan_amount_risk",
            Dimension::InterestRate => "interest_rate_risk",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Dimension::Gender => "Gender",
            Dimension::Region => "Region",
            Dimension::LoanTypeLimit => "Loan Type and Limit",
            Dimension::LoanPurpose => "Loan Purpose",
            Dimension::SpecialTerms => "Interest-Only Terms",
            Dimension::Occupancy => "Occupancy Type",
            Dimension::Submission => "Submission Method",
            Dimension::CreditWorthiness => "Credit Worthiness",
            Dimension::AgeGroup => "Age Group",
            Dimension::LoanAmount => "Loan Amount",
            Dimension::InterestRate => "Interest Rate",
        }
    }

    /// Key of `loan` in this dimension; `None` leaves the loan out of the block.
    pub fn key(self, loan: &NormalizedLoan) -> Option<GroupKey> {
        match self {
            Dimension::Gender => loan.gender.map(|gender| label(gender.as_str())),
            Dimension::Region => text_key(&loan.region),
            Dimension::LoanTypeLimit => {
                let loan_type = non_blank(&loan.loan_type)?;
                let class = limit_class(&FieldValue::from(loan.loan_limit));
                Some(GroupKey::Pair(loan_type.to_string(), class.to_string()))
            }
            Dimension::LoanPurpose => text_key(&loan.loan_purpose),
            Dimension::SpecialTerms => text_key(&loan.interest_only),
            Dimension::Occupancy => text_key(&loan.occupancy_type),
            Dimension::Submission => text_key(&loan.submission_of_application),
            Dimension::CreditWorthiness => text_key(&loan.credit_worthiness),
            Dimension::AgeGroup => age_bucket(&FieldValue::from(loan.age.as_deref())).map(label),
            Dimension::LoanAmount => loan.loan_amount.map(amount_bucket).map(label),
            Dimension::InterestRate => loan.rate_of_interest.map(rate_bucket).map(label),
        }
    }

    fn bucket_order(self) -> Option<&'static [&'static str]> {
        match self {
            Dimension::AgeGroup => Some(&AGE_BUCKETS[..]),
            Dimension::LoanAmount => Some(&AMOUNT_BUCKETS[..]),
            Dimension::InterestRate => Some(&RATE_BUCKETS[..]),
            _ => None,
        }
    }
}

fn label(value: &str) -> GroupKey {
    GroupKey::Label(value.to_string())
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|text| !text.is_empty())
}

fn text_key(value: &Option<String>) -> Option<GroupKey> {
    non_blank(value).map(label)
}

/// Half away from zero, two places. Every percentage and amount goes through here.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(100.0 * part as f64 / whole as f64)
}

pub fn safe_float(value: &FieldValue) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

pub fn limit_class(limit: &FieldValue) -> &'static str {
    if safe_float(limit) >= CONFORMING_LIMIT {
        "CF"
    } else {
        "NCF"
    }
}

/// Ages arrive either as a number or as one of the bucket labels the intake
/// form submits. Anything else stays out of the age breakdown.
pub fn age_bucket(age: &FieldValue) -> Option<&'static str> {
    if let FieldValue::Text(text) = age {
        if let Some(bucket) = AGE_BUCKETS.iter().find(|bucket| **bucket == text.trim()) {
            return Some(*bucket);
        }
    }

    let age = age.as_f64()?;
    let bucket = if age < 25.0 {
        "<25"
    } else if age < 35.0 {
        "25-34"
    } else if age < 45.0 {
        "35-44"
    } else if age < 55.0 {
        "45-54"
    } else if age < 65.0 {
        "55-64"
    } else if age < 75.0 {
        "65-74"
    } else {
        ">74"
    };
    Some(bucket)
}

pub fn amount_bucket(amount: f64) -> &'static str {
    if amount < 300_000.0 {
        "<300k"
    } else if amount < 900_000.0 {
        "300k-900k"
    } else if amount <= 2_000_000.0 {
        "900k-2M"
    } else {
        ">2M"
    }
}

pub fn rate_bucket(rate: f64) -> &'static str {
    if rate < 3.0 {
        "<3%"
    } else if rate < 4.0 {
        "3-4%"
    } else if rate < 5.0 {
        "4-5%"
    } else {
        ">=5%"
    }
}

pub fn credit_band(score: f64) -> &'static str {
    if score < 580.0 {
        "Poor"
    } else if score < 670.0 {
        "Fair"
    } else if score < 740.0 {
        "Good"
    } else if score < 800.0 {
        "Very Good"
    } else {
        "Excellent"
    }
}

pub fn compute_kpis(records: &[LoanRecord]) -> Kpis {
    let total = records.len();
    let active = records.iter().filter(|r| r.loan.is_active()).count();
    let overdue = records.iter().filter(|r| r.loan.is_default()).count();

    let overdue_amount: f64 = records
        .iter()
        .filter(|r| r.loan.is_default())
        .filter_map(|r| r.loan.loan_amount)
        .sum();

    let amounts: Vec<f64> = records.iter().filter_map(|r| r.loan.loan_amount).collect();
    let avg_loan_amount = if amounts.is_empty() {
        0.0
    } else {
        round2(amounts.iter().sum::<f64>() / amounts.len() as f64)
    };

    Kpis {
        total_loans: total,
        total_active_loans: active,
        avg_loan_amount,
        avg_overdue_rate_percent: percent(overdue, total),
        total_overdue_amount: round2(overdue_amount),
        recovery_rate_percent: percent(total - overdue, total),
    }
}

pub fn group_rates(records: &[LoanRecord], dimension: Dimension) -> Vec<GroupRate> {
    let mut groups: BTreeMap<GroupKey, (usize, usize)> = BTreeMap::new();

    for record in records {
        let Some(key) = dimension.key(&record.loan) else {
            continue;
        };
        let entry = groups.entry(key).or_insert((0, 0));
        entry.0 += 1;
        if record.loan.is_default() {
            entry.1 += 1;
        }
    }

    let mut rates: Vec<GroupRate> = groups
        .into_iter()
        .map(|(key, (count, defaults))| GroupRate {
            key,
            count,
            default_rate_percent: percent(defaults, count),
        })
        .collect();

    if let Some(order) = dimension.bucket_order() {
        rates.sort_by_key(|rate| match &rate.key {
            GroupKey::Label(name) => order.iter().position(|bucket| *bucket == name.as_str()),
            GroupKey::Pair(..) => None,
        });
    }

    rates
}

/// Share of the filtered portfolio in each credit-score band, relative to the
/// full filtered total. Loans without a score are left out.
pub fn credit_capacity(records: &[LoanRecord]) -> Vec<CapacityGroup> {
    let total = records.len();
    let mut counts = [0usize; CREDIT_BANDS.len()];

    for score in records.iter().filter_map(|r| r.loan.credit_score) {
        let band = credit_band(score);
        if let Some(index) = CREDIT_BANDS.iter().position(|name| *name == band) {
            counts[index] += 1;
        }
    }

    CREDIT_BANDS
        .iter()
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .map(|(name, count)| CapacityGroup {
            group_name: name.to_string(),
            total: count,
            percentage: percent(count, total),
        })
        .collect()
}

pub fn aggregate(
    records: &[LoanRecord],
    filter: &AggregationFilter,
    model_accuracy: f64,
) -> DashboardPayload {
    if records.is_empty() {
        tracing::info!(period = %filter.label(), "no loans for period");
        return empty_payload(model_accuracy);
    }

    let kpis = compute_kpis(records);
    let mut blocks = GroupBlocks::default();
    for dimension in Dimension::ALL {
        blocks.insert(dimension, group_rates(records, dimension));
    }
    blocks.credit_capacity = credit_capacity(records);

    tracing::debug!(
        period = %filter.label(),
        total_loans = kpis.total_loans,
        overdue_rate = kpis.avg_overdue_rate_percent,
        "aggregated dashboard"
    );

    assemble(kpis, model_accuracy, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Gender;

    fn loan(id: i64, prediction: Option<i32>) -> LoanRecord {
        LoanRecord {
            id,
            loan: NormalizedLoan {
                month: "September".to_string(),
                year: 2026,
                prediction,
                ..NormalizedLoan::default()
            },
        }
    }

    fn sample() -> Vec<LoanRecord> {
        let mut records = Vec::new();

        let mut a = loan(1, Some(1));
        a.loan.gender = Some(Gender::Male);
        a.loan.region = Some("North".to_string());
        a.loan.loan_type = Some("type1".to_string());
        a.loan.loan_limit = Some(500000.0);
        a.loan.loan_amount = Some(250000.0);
        a.loan.age = Some("25-34".to_string());
        a.loan.rate_of_interest = Some(4.25);
        a.loan.credit_score = Some(560.0);
        records.push(a);

        let mut b = loan(2, Some(0));
        b.loan.gender = Some(Gender::Female);
        b.loan.region = Some("south".to_string());
        b.loan.loan_type = Some("type1".to_string());
        b.loan.loan_limit = Some(0.0);
        b.loan.loan_amount = Some(1_000_000.0);
        b.loan.age = Some("70".to_string());
        b.loan.rate_of_interest = Some(3.99);
        b.loan.credit_score = Some(805.0);
        records.push(b);

        let mut c = loan(3, Some(1));
        c.loan.gender = Some(Gender::Male);
        c.loan.region = Some("North".to_string());
        c.loan.loan_type = Some("type2".to_string());
        c.loan.loan_amount = Some(100000.5);
        c.loan.age = Some("unknown".to_string());
        c.loan.credit_score = Some(700.0);
        records.push(c);

        let mut d = loan(4, Some(0));
        d.loan.region = Some("  ".to_string());
        d.loan.loan_amount = Some(3_000_000.0);
        d.loan.age = Some("<25".to_string());
        d.loan.rate_of_interest = Some(2.5);
        records.push(d);

        records
    }

    fn find<'a>(rates: &'a [GroupRate], key: &str) -> &'a GroupRate {
        rates
            .iter()
            .find(|rate| rate.key == GroupKey::Label(key.to_string()))
            .unwrap_or_else(|| panic!("missing group {key}"))
    }

    #[test]
    fn age_bucket_boundaries() {
        let age = |n: f64| age_bucket(&FieldValue::Numeric(n));
        assert_eq!(age(24.0), Some("<25"));
        assert_eq!(age(25.0), Some("25-34"));
        assert_eq!(age(34.0), Some("25-34"));
        assert_eq!(age(35.0), Some("35-44"));
        assert_eq!(age(74.0), Some("65-74"));
        assert_eq!(age(75.0), Some(">74"));
        assert_eq!(age_bucket(&FieldValue::Text("45-54".to_string())), Some("45-54"));
        assert_eq!(age_bucket(&FieldValue::Text("61".to_string())), Some("55-64"));
        assert_eq!(age_bucket(&FieldValue::Text("old".to_string())), None);
        assert_eq!(age_bucket(&FieldValue::Missing), None);
    }

    #[test]
    fn amount_bucket_boundaries() {
        assert_eq!(amount_bucket(299_999.0), "<300k");
        assert_eq!(amount_bucket(300_000.0), "300k-900k");
        assert_eq!(amount_bucket(899_999.0), "300k-900k");
        assert_eq!(amount_bucket(900_000.0), "900k-2M");
        assert_eq!(amount_bucket(2_000_000.0), "900k-2M");
        assert_eq!(amount_bucket(2_000_001.0), ">2M");
    }

    #[test]
    fn rate_and_credit_bands() {
        assert_eq!(rate_bucket(2.99), "<3%");
        assert_eq!(rate_bucket(3.0), "3-4%");
        assert_eq!(rate_bucket(4.99), "4-5%");
        assert_eq!(rate_bucket(5.0), ">=5%");
        assert_eq!(credit_band(579.0), "Poor");
        assert_eq!(credit_band(580.0), "Fair");
        assert_eq!(credit_band(739.0), "Good");
        assert_eq!(credit_band(740.0), "Very Good");
        assert_eq!(credit_band(800.0), "Excellent");
    }

    #[test]
    fn limit_class_never_fails() {
        assert_eq!(limit_class(&FieldValue::Numeric(500000.0)), "CF");
        assert_eq!(limit_class(&FieldValue::Numeric(499999.0)), "NCF");
        assert_eq!(limit_class(&FieldValue::Text("garbage".to_string())), "NCF");
        assert_eq!(limit_class(&FieldValue::Missing), "NCF");
        assert_eq!(safe_float(&FieldValue::Text("12.5".to_string())), 12.5);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round2(2.675_000_1), 2.68);
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(-0.125), -0.13);
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(2, 3), 66.67);
        assert_eq!(percent(5, 0), 0.0);
    }

    #[test]
    fn kpis_match_raw_counts() {
        let records = sample();
        let kpis = compute_kpis(&records);
        assert_eq!(kpis.total_loans, 4);
        assert_eq!(kpis.total_active_loans, 2);
        assert_eq!(kpis.avg_overdue_rate_percent, 50.0);
        assert_eq!(kpis.recovery_rate_percent, 50.0);
        assert_eq!(kpis.total_overdue_amount, 350000.5);
        assert_eq!(kpis.avg_loan_amount, 1087500.13);

        let overdue = records.len() - kpis.total_active_loans;
        assert_eq!(
            kpis.avg_overdue_rate_percent,
            round2(100.0 * overdue as f64 / kpis.total_loans as f64)
        );
    }

    #[test]
    fn unscored_loans_count_toward_recovery() {
        let records = vec![loan(1, Some(1)), loan(2, None), loan(3, Some(0))];
        let kpis = compute_kpis(&records);
        assert_eq!(kpis.total_active_loans, 1);
        assert_eq!(kpis.avg_overdue_rate_percent, 33.33);
        assert_eq!(kpis.recovery_rate_percent, 66.67);
        assert_eq!(kpis.avg_loan_amount, 0.0);
    }

    #[test]
    fn blank_keys_are_left_out_of_groups() {
        let records = sample();
        let regions = group_rates(&records, Dimension::Region);
        assert_eq!(regions.len(), 2);
        assert_eq!(find(&regions, "North").count, 2);
        assert_eq!(find(&regions, "North").default_rate_percent, 100.0);
        assert_eq!(find(&regions, "south").default_rate_percent, 0.0);

        let genders = group_rates(&records, Dimension::Gender);
        let grouped: usize = genders.iter().map(|g| g.count).sum();
        assert_eq!(grouped, 3);
        assert!(grouped <= records.len());
    }

    #[test]
    fn loan_type_limit_uses_pair_keys() {
        let records = sample();
        let rates = group_rates(&records, Dimension::LoanTypeLimit);
        let keys: Vec<GroupKey> = rates.iter().map(|rate| rate.key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                GroupKey::Pair("type1".to_string(), "CF".to_string()),
                GroupKey::Pair("type1".to_string(), "NCF".to_string()),
                GroupKey::Pair("type2".to_string(), "NCF".to_string()),
            ]
        );

        let json = serde_json::to_value(&rates[0]).unwrap();
        assert_eq!(json["key"], serde_json::json!(["type1", "CF"]));
        assert_eq!(json["default_rate_percent"], 100.0);
    }

    #[test]
    fn loans_without_a_type_stay_out_of_type_limit() {
        let mut untyped = loan(1, Some(1));
        untyped.loan.loan_limit = Some(0.0);
        assert!(group_rates(&[untyped], Dimension::LoanTypeLimit).is_empty());
    }

    #[test]
    fn buckets_come_out_in_ascending_order() {
        let records = sample();

        let ages = group_rates(&records, Dimension::AgeGroup);
        let labels: Vec<String> = ages.iter().map(|a| a.key.to_string()).collect();
        assert_eq!(labels, vec!["<25", "25-34", "65-74"]);

        let amounts = group_rates(&records, Dimension::LoanAmount);
        let labels: Vec<String> = amounts.iter().map(|a| a.key.to_string()).collect();
        assert_eq!(labels, vec!["<300k", "900k-2M", ">2M"]);
        assert_eq!(amounts.iter().map(|a| a.count).sum::<usize>(), 4);

        let rates = group_rates(&records, Dimension::InterestRate);
        let labels: Vec<String> = rates.iter().map(|a| a.key.to_string()).collect();
        assert_eq!(labels, vec!["<3%", "3-4%", "4-5%"]);
    }

    #[test]
    fn credit_capacity_is_share_of_total() {
        let records = sample();
        let capacity = credit_capacity(&records);
        let names: Vec<&str> = capacity.iter().map(|c| c.group_name.as_str()).collect();
        assert_eq!(names, vec!["Poor", "Good", "Excellent"]);
        assert!(capacity.iter().all(|c| c.total == 1 && c.percentage == 25.0));
    }

    #[test]
    fn empty_set_returns_empty_payload() {
        let filter = AggregationFilter::new(Some("9"), Some(2026));
        assert_eq!(aggregate(&[], &filter, 90.4), empty_payload(90.4));
        assert_eq!(
            aggregate(&[], &AggregationFilter::default(), 90.4),
            empty_payload(90.4)
        );
    }

    #[test]
    fn aggregation_is_idempotent() {
        let records = sample();
        let filter = AggregationFilter::new(Some("September"), Some(2026));
        let first = serde_json::to_string(&aggregate(&records, &filter, 90.4)).unwrap();
        let second = serde_json::to_string(&aggregate(&records, &filter, 90.4)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn payload_carries_every_block() {
        let records = sample();
        let payload = aggregate(&records, &AggregationFilter::default(), 90.4);
        assert_eq!(payload.kpis.total_loans, 4);
        assert_eq!(payload.model_accuracy, 90.4);
        assert_eq!(payload.gender_risk.len(), 2);
        assert_eq!(payload.special_terms.len(), 0);
        assert_eq!(payload.age_group_risk.len(), 3);
        assert_eq!(payload.credit_capacity.len(), 3);

        let json = serde_json::to_value(&payload).unwrap();
        for dimension in Dimension::ALL {
            assert!(json[dimension.payload_key()].is_array(), "{}", dimension.payload_key());
        }
        assert_eq!(json["total_loans"], 4);
        assert_eq!(json["gender_risk"][0]["key"], "Female");
    }
}
