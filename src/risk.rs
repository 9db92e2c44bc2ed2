use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;
use crate::models::{NormalizedLoan, RiskLevel};

/// Raw model output before the risk-level policy is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrediction {
    pub label: i32,
    pub probability: Option<f64>,
}

pub trait Classifier: Send + Sync {
    fn predict(&self, loan: &NormalizedLoan) -> Result<RawPrediction, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub prediction: i32,
    pub probability: Option<f64>,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictOutcome {
    Scored(Score),
    Failed { error: String },
}

/// Applies to every model regardless of how it produced the probability.
pub fn risk_level(probability: Option<f64>) -> RiskLevel {
    match probability {
        Some(p) if p > 0.7 => RiskLevel::High,
        Some(p) if p > 0.4 => RiskLevel::Medium,
        Some(_) => RiskLevel::Low,
        None => RiskLevel::Unknown,
    }
}

pub fn score(classifier: &dyn Classifier, loan: &NormalizedLoan) -> Result<Score, ClassifierError> {
    let raw = classifier.predict(loan)?;

    if raw.label != 0 && raw.label != 1 {
        return Err(ClassifierError::InvalidOutput(format!(
            "prediction must be 0 or 1, got {}",
            raw.label
        )));
    }

    if let Some(p) = raw.probability {
        if !(0.0..=1.0).contains(&p) {
            return Err(ClassifierError::InvalidOutput(format!(
                "probability must be within [0, 1], got {p}"
            )));
        }
    }

    let probability = raw.probability.map(|p| (p * 10_000.0).round() / 10_000.0);
    Ok(Score {
        prediction: raw.label,
        probability,
        risk_level: risk_level(probability),
    })
}

/// Scores a loan for the predict endpoint; failures come back as an error
/// body instead of a score.
pub fn predict(classifier: &dyn Classifier, loan: &NormalizedLoan) -> PredictOutcome {
    match score(classifier, loan) {
        Ok(score) => {
            tracing::info!(
                prediction = score.prediction,
                probability = ?score.probability,
                risk_level = score.risk_level.as_str(),
                "scored loan"
            );
            PredictOutcome::Scored(score)
        }
        Err(err) => {
            tracing::warn!(error = %err, "prediction failed");
            PredictOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}

/// Copies the outcome columns onto a loan headed for storage. An unscorable
/// loan is stored without a prediction and an "unknown" risk level.
pub fn attach_score(classifier: &dyn Classifier, loan: &mut NormalizedLoan) {
    match score(classifier, loan) {
        Ok(score) => {
            loan.prediction = Some(score.prediction);
            loan.probability = score.probability;
            loan.risk_level = Some(score.risk_level);
        }
        Err(err) => {
            tracing::warn!(error = %err, "storing loan without a prediction");
            loan.prediction = None;
            loan.probability = None;
            loan.risk_level = Some(RiskLevel::Unknown);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NumericTerm {
    pub weight: f64,
    #[serde(default)]
    pub mean: f64,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

fn default_cutoff() -> f64 {
    0.5
}

/// Logistic scorecard exported from the training notebook. Missing numeric
/// inputs are imputed at the term mean; unseen categories contribute nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct Scorecard {
    pub intercept: f64,
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,
    #[serde(default)]
    pub numeric: BTreeMap<String, NumericTerm>,
    #[serde(default)]
    pub categorical: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Scorecard {
    pub fn from_path(path: &Path) -> Result<Self, ClassifierError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ClassifierError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ClassifierError> {
        let scorecard: Scorecard = serde_json::from_str(contents)?;
        scorecard.validate()?;
        Ok(scorecard)
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        let probe = NormalizedLoan::default();

        if !(0.0..=1.0).contains(&self.cutoff) {
            return Err(ClassifierError::InvalidScorecard(format!(
                "cutoff {} is outside [0, 1]",
                self.cutoff
            )));
        }

        for (name, term) in &self.numeric {
            if probe.numeric_feature(name).is_none() {
                return Err(ClassifierError::InvalidScorecard(format!(
                    "unknown numeric feature {name}"
                )));
            }
            if !(term.scale > 0.0) {
                return Err(ClassifierError::InvalidScorecard(format!(
                    "feature {name} has non-positive scale {}",
                    term.scale
                )));
            }
        }

        for name in self.categorical.keys() {
            if probe.text_feature(name).is_none() {
                return Err(ClassifierError::InvalidScorecard(format!(
                    "unknown categorical feature {name}"
                )));
            }
        }

        Ok(())
    }

    pub fn probability(&self, loan: &NormalizedLoan) -> f64 {
        let mut logit = self.intercept;

        for (name, term) in &self.numeric {
            if let Some(Some(value)) = loan.numeric_feature(name) {
                logit += term.weight * (value - term.mean) / term.scale;
            }
        }

        for (name, levels) in &self.categorical {
            if let Some(Some(value)) = loan.text_feature(name) {
                logit += levels.get(value).copied().unwrap_or(0.0);
            }
        }

        1.0 / (1.0 + (-logit).exp())
    }
}

impl Default for Scorecard {
    fn default() -> Self {
        let numeric = [
            ("credit_score", -0.35, 700.0, 115.0),
            ("rate_of_interest", 0.45, 4.05, 0.56),
            ("ltv", 0.40, 72.7, 39.9),
            ("income", -0.30, 6957.0, 6496.0),
            ("loan_amount", 0.10, 331117.0, 183909.0),
        ]
        .into_iter()
        .map(|(name, weight, mean, scale)| {
            (name.to_string(), NumericTerm { weight, mean, scale })
        })
        .collect();

        let categorical = [
            ("credit_type", vec![("EQUI", 3.2), ("CIB", -0.15), ("CRIF", -0.1)]),
            ("submission_of_application", vec![("not_inst", 0.35)]),
            ("neg_ammortization", vec![("neg_amm", 0.4)]),
            ("lump_sum_payment", vec![("lpsm", 0.9)]),
            ("business_or_commercial", vec![("b/c", 0.2)]),
            ("approv_in_adv", vec![("pre", -0.2)]),
        ]
        .into_iter()
        .map(|(name, levels)| {
            let levels = levels
                .into_iter()
                .map(|(level, weight)| (level.to_string(), weight))
                .collect();
            (name.to_string(), levels)
        })
        .collect();

        Self {
            intercept: -1.1,
            cutoff: default_cutoff(),
            numeric,
            categorical,
        }
    }
}

impl Classifier for Scorecard {
    fn predict(&self, loan: &NormalizedLoan) -> Result<RawPrediction, ClassifierError> {
        let probability = self.probability(loan);
        if !probability.is_finite() {
            return Err(ClassifierError::InvalidOutput(
                "scorecard produced a non-finite probability".to_string(),
            ));
        }

        Ok(RawPrediction {
            label: i32::from(probability >= self.cutoff),
            probability: Some(probability),
        })
    }
}
