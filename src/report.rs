use std::collections::BTreeMap;
use std::fmt::Write;

use crate::aggregate::Dimension;
use crate::models::{CapacityGroup, DashboardPayload, GroupRate, Kpis};
use crate::period::AggregationFilter;

/// Grouped blocks produced by the aggregation engine, keyed by dimension.
#[derive(Debug, Clone, Default)]
pub struct GroupBlocks {
    by_dimension: BTreeMap<Dimension, Vec<GroupRate>>,
    pub credit_capacity: Vec<CapacityGroup>,
}

impl GroupBlocks {
    pub fn insert(&mut self, dimension: Dimension, rates: Vec<GroupRate>) {
        self.by_dimension.insert(dimension, rates);
    }

    fn take(&mut self, dimension: Dimension) -> Vec<GroupRate> {
        self.by_dimension.remove(&dimension).unwrap_or_default()
    }
}

/// Merges the KPI block with every grouped block. A dimension that was not
/// computed comes out as an empty array, never as a missing key.
pub fn assemble(kpis: Kpis, model_accuracy: f64, mut blocks: GroupBlocks) -> DashboardPayload {
    DashboardPayload {
        kpis,
        model_accuracy,
        gender_risk: blocks.take(Dimension::Gender),
        region_risk: blocks.take(Dimension::Region),
        loan_type_limit: blocks.take(Dimension::LoanTypeLimit),
        loan_purpose: blocks.take(Dimension::LoanPurpose),
        special_terms: blocks.take(Dimension::SpecialTerms),
        occupancy_risk: blocks.take(Dimension::Occupancy),
        submission_risk: blocks.take(Dimension::Submission),
        credit_worthiness_risk: blocks.take(Dimension::CreditWorthiness),
        age_group_risk: blocks.take(Dimension::AgeGroup),
        loan_amount_risk: blocks.take(Dimension::LoanAmount),
        interest_rate_risk: blocks.take(Dimension::InterestRate),
        credit_capacity: blocks.credit_capacity,
    }
}

pub fn empty_payload(model_accuracy: f64) -> DashboardPayload {
    assemble(Kpis::default(), model_accuracy, GroupBlocks::default())
}

impl DashboardPayload {
    pub fn block(&self, dimension: Dimension) -> &[GroupRate] {
        match dimension {
            Dimension::Gender => &self.gender_risk,
            Dimension::Region => &self.region_risk,
            Dimension::LoanTypeLimit => &self.loan_type_limit,
            Dimension::LoanPurpose => &self.loan_purpose,
            Dimension::SpecialTerms => &self.special_terms,
            Dimension::Occupancy => &self.occupancy_risk,
            Dimension::Submission => &self.submission_risk,
            Dimension::CreditWorthiness => &self.credit_worthiness_risk,
            Dimension::AgeGroup => &self.age_group_risk,
            Dimension::LoanAmount => &self.loan_amount_risk,
            Dimension::InterestRate => &self.interest_rate_risk,
        }
    }
}

/// Highest default rates first; ties keep the block's own order.
pub fn riskiest_groups(payload: &DashboardPayload, limit: usize) -> Vec<(Dimension, &GroupRate)> {
    let mut ranked: Vec<(Dimension, &GroupRate)> = Dimension::ALL
        .iter()
        .flat_map(|dimension| {
            payload
                .block(*dimension)
                .iter()
                .map(move |rate| (*dimension, rate))
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.1.default_rate_percent
            .partial_cmp(&a.1.default_rate_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(limit);
    ranked
}

pub fn build_report(filter: &AggregationFilter, payload: &DashboardPayload) -> String {
    let mut output = String::new();
    let kpis = &payload.kpis;

    let _ = writeln!(output, "# Loan Risk Dashboard");
    let _ = writeln!(output, "Generated for {}", filter.label());
    let _ = writeln!(output);
    let _ = writeln!(output, "## Portfolio");

    if kpis.total_loans == 0 {
        let _ = writeln!(output, "No loans recorded for this period.");
        return output;
    }

    let _ = writeln!(output, "- Total loans: {}", kpis.total_loans);
    let _ = writeln!(output, "- Active loans: {}", kpis.total_active_loans);
    let _ = writeln!(output, "- Average loan amount: {:.2}", kpis.avg_loan_amount);
    let _ = writeln!(
        output,
        "- Overdue rate: {:.2}% ({:.2} overdue)",
        kpis.avg_overdue_rate_percent, kpis.total_overdue_amount
    );
    let _ = writeln!(output, "- Recovery rate: {:.2}%", kpis.recovery_rate_percent);
    let _ = writeln!(output, "- Model accuracy: {:.2}%", payload.model_accuracy);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Segments");
    for (dimension, rate) in riskiest_groups(payload, 5) {
        let _ = writeln!(
            output,
            "- {} {}: {:.2}% default across {} loans",
            dimension.title(),
            rate.key,
            rate.default_rate_percent,
            rate.count
        );
    }

    for dimension in Dimension::ALL {
        let rates = payload.block(dimension);
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", dimension.title());

        if rates.is_empty() {
            let _ = writeln!(output, "No data.");
            continue;
        }

        for rate in rates {
            let _ = writeln!(
                output,
                "- {}: {:.2}% default ({} loans)",
                rate.key, rate.default_rate_percent, rate.count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Credit Capacity");
    if payload.credit_capacity.is_empty() {
        let _ = writeln!(output, "No credit scores recorded.");
    } else {
        for group in &payload.credit_capacity {
            let _ = writeln!(
                output,
                "- {}: {} loans ({:.2}%)",
                group.group_name, group.total, group.percentage
            );
        }
    }

    output
}
