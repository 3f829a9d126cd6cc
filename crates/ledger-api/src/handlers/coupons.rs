//! Coupon ledger handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use ledger_models::{
    AffiliateUsageEntry, ApplyCouponResult, BatchApplyResult, BatchCouponInput, CouponEligibility,
    CouponRecord, LedgerErrorCode, OrderMeta, normalize_code,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Maximum affiliate usage entries returned per request.
const MAX_USAGE_LIMIT: u32 = 100;

/// Coupon creation request.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[serde(default)]
    pub is_affiliate: bool,
    #[validate(length(min = 1, max = 64))]
    pub affiliate_code: Option<String>,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub min_amount: f64,
    #[validate(range(min = 0.0))]
    pub max_discount: Option<f64>,
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub usage_limit: i64,
    pub is_active: Option<bool>,
}

impl CreateCouponRequest {
    fn into_record(self) -> CouponRecord {
        let mut record = CouponRecord::new(&self.code)
            .with_min_amount(self.min_amount)
            .with_usage_limit(self.usage_limit);
        if self.is_affiliate || self.affiliate_code.is_some() {
            let affiliate = self.affiliate_code.unwrap_or_else(|| record.code.clone());
            record = record.with_affiliate(normalize_code(&affiliate));
        }
        if let Some(valid_until) = self.valid_until {
            record = record.with_valid_until(valid_until);
        }
        record.max_discount = self.max_discount;
        record.is_active = self.is_active.unwrap_or(true);
        record
    }
}

/// Single coupon application request.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(length(min = 1, max = 256))]
    pub order_id: String,
    /// Overrides the coupon's own affiliate flag when present
    pub is_affiliate: Option<bool>,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub payout_amount: f64,
    #[validate(length(min = 1, max = 256))]
    pub transaction_key: String,
    #[validate(range(min = 0.0))]
    pub order_amount: Option<f64>,
    #[validate(email)]
    pub customer_email: Option<String>,
}

/// Batch coupon application request.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ApplyBatchRequest {
    #[validate(length(min = 1, max = 20))]
    pub coupons: Vec<BatchCouponInput>,
    #[validate(length(min = 1, max = 256))]
    pub order_id: String,
    #[validate(length(min = 1, max = 256))]
    pub transaction_key: String,
    #[validate(range(min = 0.0))]
    pub order_amount: Option<f64>,
    #[validate(email)]
    pub customer_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_usage_limit")]
    pub limit: u32,
}

fn default_usage_limit() -> u32 {
    50
}

#[derive(Serialize)]
pub struct CouponResponse {
    pub success: bool,
    pub coupon: CouponRecord,
}

#[derive(Serialize)]
pub struct EligibilityResponse {
    pub success: bool,
    #[serde(flatten)]
    pub eligibility: CouponEligibility,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateUsageResponse {
    pub success: bool,
    pub affiliate_code: String,
    pub entries: Vec<AffiliateUsageEntry>,
}

/// Create a coupon.
pub async fn create_coupon(
    State(state): State<AppState>,
    Json(request): Json<CreateCouponRequest>,
) -> ApiResult<(StatusCode, Json<CouponResponse>)> {
    request.validate()?;
    let coupon = state.ledger.create_coupon(request.into_record()).await?;
    Ok((
        StatusCode::CREATED,
        Json(CouponResponse {
            success: true,
            coupon,
        }),
    ))
}

/// Get a coupon by code.
pub async fn get_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<CouponResponse>> {
    state
        .ledger
        .get_coupon(&code)
        .await?
        .map(|coupon| {
            Json(CouponResponse {
                success: true,
                coupon,
            })
        })
        .ok_or_else(|| ApiError::not_found(format!("Coupon {} not found", normalize_code(&code))))
}

/// Check whether a coupon can be redeemed for an order amount.
pub async fn validate_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<ValidateQuery>,
) -> ApiResult<Json<EligibilityResponse>> {
    if !query.amount.is_finite() || query.amount < 0.0 {
        return Err(ApiError::bad_request("amount must be a non-negative number"));
    }
    let eligibility = state
        .ledger
        .validate_coupon(&code, query.amount, Utc::now())
        .await?;
    Ok(Json(EligibilityResponse {
        success: true,
        eligibility,
    }))
}

/// Apply one coupon to an order.
pub async fn apply_coupon(
    State(state): State<AppState>,
    Json(request): Json<ApplyCouponRequest>,
) -> ApiResult<(StatusCode, Json<ApplyCouponResult>)> {
    request.validate()?;
    let meta = OrderMeta {
        order_amount: request.order_amount,
        customer_email: request.customer_email,
    };

    let result = state
        .ledger
        .apply_coupon_with_meta(
            &request.code,
            &request.order_id,
            request.is_affiliate,
            request.payout_amount,
            &meta,
            &request.transaction_key,
        )
        .await?;

    let status = match result.error_code {
        None => StatusCode::OK,
        Some(LedgerErrorCode::CouponNotFound) => StatusCode::NOT_FOUND,
        Some(LedgerErrorCode::InvalidInput) => StatusCode::BAD_REQUEST,
        Some(LedgerErrorCode::StoreFailure) => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((status, Json(result)))
}

/// Apply several coupons to one order.
pub async fn apply_batch(
    State(state): State<AppState>,
    Json(request): Json<ApplyBatchRequest>,
) -> ApiResult<Json<BatchApplyResult>> {
    request.validate()?;
    let meta = OrderMeta {
        order_amount: request.order_amount,
        customer_email: request.customer_email,
    };

    let result = state
        .ledger
        .batch_apply_coupons_for_order(
            &request.coupons,
            &request.order_id,
            &meta,
            &request.transaction_key,
        )
        .await;
    Ok(Json(result))
}

/// List affiliate audit entries, newest first.
pub async fn list_affiliate_usage(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<AffiliateUsageResponse>> {
    let limit = query.limit.clamp(1, MAX_USAGE_LIMIT);
    let entries = state.ledger.list_affiliate_usage(&code, limit).await?;
    Ok(Json(AffiliateUsageResponse {
        success: true,
        affiliate_code: normalize_code(&code),
        entries,
    }))
}
