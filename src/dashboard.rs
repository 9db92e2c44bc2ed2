use crate::aggregate::aggregate;
use crate::db::LoanStore;
use crate::models::{DashboardOutcome, ErrorBody};
use crate::period::AggregationFilter;

/// Default reported accuracy of the deployed default-risk model.
pub const DEFAULT_MODEL_ACCURACY: f64 = 90.4;

/// Reads the period's loans and aggregates them. Store failures are logged
/// and come back as an error body; they never propagate to the caller.
pub async fn load_dashboard(
    store: &dyn LoanStore,
    filter: &AggregationFilter,
    model_accuracy: f64,
) -> DashboardOutcome {
    match store.fetch_loans(filter, None).await {
        Ok(loans) => DashboardOutcome::Ready(aggregate(&loans, filter, model_accuracy)),
        Err(err) => {
            tracing::error!(period = %filter.label(), error = %err, "dashboard query failed");
            DashboardOutcome::Failed(ErrorBody {
                error: "Database query failed".to_string(),
                details: err.to_string(),
            })
        }
    }
}
