//! Guarded counter increments on allow-listed collections.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use ledger_firestore::{
    Delta, FieldPath, FieldTransform, GuardOutcome, GuardScope, LedgerConfig, WriteOp,
    GUARDS_SUBCOLLECTION,
};

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::metrics::record_counter_increment;
use crate::state::AppState;

/// Increment request. The guard lives under the target document, keyed by
/// the transaction key and field path.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IncrementRequest {
    #[validate(length(min = 1, max = 512))]
    pub collection: String,
    #[validate(length(min = 1, max = 256))]
    pub document_id: String,
    #[validate(length(min = 1, max = 256))]
    pub field: String,
    pub delta: serde_json::Number,
    #[validate(length(min = 1, max = 256))]
    pub transaction_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementResponse {
    pub success: bool,
    pub idempotent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_path: Option<&'static str>,
}

/// Integral JSON numbers stay integers; everything else is a double.
fn parse_delta(number: &serde_json::Number) -> ApiResult<Delta> {
    if let Some(i) = number.as_i64() {
        return Ok(Delta::Int(i));
    }
    match number.as_f64() {
        Some(f) if f.is_finite() => Ok(Delta::Double(f)),
        _ => Err(ApiError::bad_request("delta must be a finite number")),
    }
}

/// Reject targets outside the configured counter collections.
///
/// Guard documents and the ledger's own collections are never writable
/// here, even when listed.
fn check_counter_target(
    collection: &str,
    config: &ApiConfig,
    ledger: &LedgerConfig,
) -> ApiResult<()> {
    let root = collection.split('/').next().unwrap_or_default();

    // Collection ids sit at even positions of the path
    let guarded = collection
        .split('/')
        .step_by(2)
        .any(|segment| segment == GUARDS_SUBCOLLECTION);
    if guarded {
        return Err(ApiError::bad_request("guard documents cannot be incremented"));
    }

    let reserved = [
        ledger.coupons_collection.as_str(),
        ledger.orders_collection.as_str(),
        ledger.affiliate_collection.as_str(),
    ];
    if reserved.contains(&root) {
        return Err(ApiError::bad_request(format!(
            "collection {} is managed by the coupon ledger",
            root
        )));
    }

    if !config.allows_counter_collection(root) {
        return Err(ApiError::bad_request(format!(
            "collection {} is not open for counter increments",
            root
        )));
    }
    Ok(())
}

/// Apply an increment at most once per transaction key.
pub async fn increment_counter(
    State(state): State<AppState>,
    Json(request): Json<IncrementRequest>,
) -> ApiResult<Json<IncrementResponse>> {
    request.validate()?;
    let transaction_key = request.transaction_key.trim();
    if transaction_key.is_empty() {
        return Err(ApiError::bad_request("transactionKey must not be blank"));
    }
    check_counter_target(&request.collection, &state.config, state.ledger.config())?;
    let field = FieldPath::parse(&request.field)?.to_string();
    let delta = parse_delta(&request.delta)?;

    let scope = GuardScope::new(request.collection.as_str(), request.document_id.as_str());
    let writes = vec![WriteOp::transform(
        request.collection.as_str(),
        request.document_id.as_str(),
        vec![FieldTransform::increment(field.as_str(), delta)],
    )];

    let outcome = state
        .ledger
        .guard()
        .apply(&scope, &field, transaction_key, writes)
        .await?;

    let response = match outcome {
        GuardOutcome::Applied(path) => {
            info!(
                document = %scope.path(),
                field = %field,
                apply_path = path.as_str(),
                "Counter incremented"
            );
            record_counter_increment(path.as_str());
            IncrementResponse {
                success: true,
                idempotent: false,
                apply_path: Some(path.as_str()),
            }
        }
        GuardOutcome::AlreadyApplied => {
            record_counter_increment("idempotent");
            IncrementResponse {
                success: true,
                idempotent: true,
                apply_path: None,
            }
        }
    };
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delta() {
        let int: serde_json::Number = serde_json::from_str("3").unwrap();
        let float: serde_json::Number = serde_json::from_str("2.5").unwrap();
        assert_eq!(parse_delta(&int).unwrap(), Delta::Int(3));
        assert_eq!(parse_delta(&float).unwrap(), Delta::Double(2.5));
    }

    #[test]
    fn test_counter_target_rules() {
        let config = ApiConfig {
            counter_collections: vec!["pages".into(), "coupons".into()],
            ..ApiConfig::default()
        };
        let ledger = LedgerConfig::default();

        assert!(check_counter_target("pages", &config, &ledger).is_ok());
        assert!(check_counter_target("pages/home/stats", &config, &ledger).is_ok());
        assert!(check_counter_target("pages/home/guards", &config, &ledger).is_err());
        assert!(check_counter_target("coupons", &config, &ledger).is_err());
        assert!(check_counter_target("orders/o1/guards", &config, &ledger).is_err());
        assert!(check_counter_target("affiliateUsage", &config, &ledger).is_err());
        assert!(check_counter_target("users", &config, &ledger).is_err());
    }
}
