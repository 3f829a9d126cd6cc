//! Coupon usage ledger.
//!
//! Applies a coupon to an order exactly once per transaction key:
//! - the guard lives under `orders/{orderId}/guards/{sha1(txKey|CODE)}`
//! - `usageCount` and `payoutUsage` are bumped with server-side increments
//! - affiliate coupons also get an audit entry at `affiliateUsage/{guardKey}`
//!
//! All of it goes out in one atomic commit. Eligibility (active, expiry,
//! limits) is not enforced here: the ledger records usage for orders that
//! were already paid. Use `validate_coupon` before checkout for that.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledger_models::{
    normalize_code, AffiliateUsageEntry, ApplyCouponResult, BatchApplyResult, BatchCouponInput,
    BatchItemResult, CouponEligibility, CouponRecord, LedgerErrorCode, OrderMeta,
};
use tracing::{info, warn};

use crate::codec::parse_timestamp;
use crate::error::{FirestoreError, FirestoreResult};
use crate::guard::{guard_key, GuardOutcome, GuardScope, IdempotencyGuard};
use crate::metrics::record_coupon_apply;
use crate::store::{Delta, Direction, DocumentQuery, DocumentStore, FieldTransform, StoredDocument, WriteOp};
use crate::transform::FallbackPolicy;
use crate::value::{FieldValue, Fields, FieldsExt};

// =============================================================================
// Configuration
// =============================================================================

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub coupons_collection: String,
    pub orders_collection: String,
    pub affiliate_collection: String,
    /// Flat commission credited per affiliate use in batch applies
    pub affiliate_commission: f64,
    pub fallback: FallbackPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            coupons_collection: "coupons".to_string(),
            orders_collection: "orders".to_string(),
            affiliate_collection: "affiliateUsage".to_string(),
            affiliate_commission: 10.0,
            fallback: FallbackPolicy::Enabled,
        }
    }
}

impl LedgerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let affiliate_commission = match std::env::var("LEDGER_AFFILIATE_COMMISSION") {
            Ok(raw) => raw.trim().parse::<f64>().map_err(|_| {
                FirestoreError::Config(format!("LEDGER_AFFILIATE_COMMISSION {:?} is not a number", raw))
            })?,
            Err(_) => 10.0,
        };

        if !affiliate_commission.is_finite() || affiliate_commission < 0.0 {
            return Err(FirestoreError::Config(
                "LEDGER_AFFILIATE_COMMISSION must be a non-negative number".into(),
            ));
        }

        Ok(Self {
            affiliate_commission,
            fallback: FallbackPolicy::from_env(),
            ..Self::default()
        })
    }
}

// =============================================================================
// Record conversion
// =============================================================================

/// Timestamps may also be stored as RFC 3339 strings by other writers.
fn timestamp_field(fields: &Fields, name: &str) -> Option<DateTime<Utc>> {
    match fields.get(name)? {
        FieldValue::Timestamp(ts) => Some(*ts),
        FieldValue::Str(s) => parse_timestamp(s),
        _ => None,
    }
}

pub fn coupon_to_fields(record: &CouponRecord) -> Fields {
    let mut fields = Fields::new();
    fields.insert("code".into(), FieldValue::from(record.code.as_str()));
    fields.insert("usageCount".into(), FieldValue::Int(record.usage_count));
    fields.insert("payoutUsage".into(), FieldValue::Double(record.payout_usage));
    fields.insert("isActive".into(), FieldValue::Bool(record.is_active));
    fields.insert("isAffiliate".into(), FieldValue::Bool(record.is_affiliate));
    if let Some(affiliate) = &record.affiliate_code {
        fields.insert("affiliateCode".into(), FieldValue::from(affiliate.as_str()));
    }
    fields.insert("minAmount".into(), FieldValue::Double(record.min_amount));
    if let Some(max) = record.max_discount {
        fields.insert("maxDiscount".into(), FieldValue::Double(max));
    }
    if let Some(until) = record.valid_until {
        fields.insert("validUntil".into(), FieldValue::Timestamp(until));
    }
    fields.insert("usageLimit".into(), FieldValue::Int(record.usage_limit));
    fields.insert("createdAt".into(), FieldValue::Timestamp(record.created_at));
    fields
}

/// Missing fields take the same defaults as a freshly created coupon.
pub fn coupon_from_fields(doc_id: &str, fields: &Fields) -> CouponRecord {
    CouponRecord {
        code: fields
            .get_str("code")
            .map(normalize_code)
            .unwrap_or_else(|| normalize_code(doc_id)),
        usage_count: fields.get_i64("usageCount").unwrap_or(0),
        payout_usage: fields.get_f64("payoutUsage").unwrap_or(0.0),
        is_active: fields.get_bool("isActive").unwrap_or(true),
        is_affiliate: fields.get_bool("isAffiliate").unwrap_or(false),
        affiliate_code: fields.get_str("affiliateCode").map(str::to_string),
        min_amount: fields.get_f64("minAmount").unwrap_or(0.0),
        max_discount: fields.get_f64("maxDiscount"),
        valid_until: timestamp_field(fields, "validUntil"),
        usage_limit: fields.get_i64("usageLimit").unwrap_or(0),
        created_at: timestamp_field(fields, "createdAt").unwrap_or_default(),
    }
}

pub fn affiliate_entry_to_fields(entry: &AffiliateUsageEntry) -> Fields {
    let mut fields = Fields::new();
    fields.insert("orderId".into(), FieldValue::from(entry.order_id.as_str()));
    fields.insert("couponCode".into(), FieldValue::from(entry.coupon_code.as_str()));
    fields.insert(
        "affiliateCode".into(),
        FieldValue::from(entry.affiliate_code.as_str()),
    );
    fields.insert("amount".into(), FieldValue::Double(entry.amount));
    fields.insert("commission".into(), FieldValue::Double(entry.commission));
    if let Some(email) = &entry.customer_email {
        fields.insert("customerEmail".into(), FieldValue::from(email.as_str()));
    }
    fields.insert("createdAt".into(), FieldValue::Timestamp(entry.created_at));
    fields
}

pub fn affiliate_entry_from_fields(fields: &Fields) -> AffiliateUsageEntry {
    let text = |name: &str| fields.get_str(name).unwrap_or_default().to_string();
    AffiliateUsageEntry {
        order_id: text("orderId"),
        coupon_code: text("couponCode"),
        affiliate_code: text("affiliateCode"),
        amount: fields.get_f64("amount").unwrap_or(0.0),
        commission: fields.get_f64("commission").unwrap_or(0.0),
        customer_email: fields.get_str("customerEmail").map(str::to_string),
        created_at: timestamp_field(fields, "createdAt").unwrap_or_default(),
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Idempotent coupon usage ledger.
#[derive(Clone)]
pub struct CouponLedger {
    store: Arc<dyn DocumentStore>,
    guard: IdempotencyGuard,
    config: LedgerConfig,
}

impl CouponLedger {
    pub fn new(store: Arc<dyn DocumentStore>, config: LedgerConfig) -> Self {
        let guard = IdempotencyGuard::new(store.clone(), config.fallback);
        Self {
            store,
            guard,
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// Find a coupon document by exact match on its normalized `code`.
    async fn find_coupon(&self, code: &str) -> FirestoreResult<Option<StoredDocument>> {
        let query = DocumentQuery::new().eq("code", code).limit(1);
        let mut docs = self
            .store
            .query_documents(&self.config.coupons_collection, &query)
            .await?;
        Ok(docs.pop())
    }

    /// Apply a coupon to an order once per transaction key.
    ///
    /// `payout_amount` is credited to `payoutUsage` for affiliate coupons;
    /// non-affiliate uses count 1.
    pub async fn apply_coupon_for_order(
        &self,
        code: &str,
        order_id: &str,
        is_affiliate: bool,
        payout_amount: f64,
        transaction_key: &str,
    ) -> FirestoreResult<ApplyCouponResult> {
        self.apply_coupon_with_meta(
            code,
            order_id,
            Some(is_affiliate),
            payout_amount,
            &OrderMeta::default(),
            transaction_key,
        )
        .await
    }

    /// Apply a coupon with order metadata for the affiliate audit trail.
    ///
    /// When `is_affiliate` is `None` the coupon record's own flag decides.
    pub async fn apply_coupon_with_meta(
        &self,
        code: &str,
        order_id: &str,
        is_affiliate: Option<bool>,
        payout_amount: f64,
        meta: &OrderMeta,
        transaction_key: &str,
    ) -> FirestoreResult<ApplyCouponResult> {
        let code = normalize_code(code);
        let order_id = order_id.trim();
        let transaction_key = transaction_key.trim();

        if code.is_empty() || order_id.is_empty() || transaction_key.is_empty() {
            record_coupon_apply("invalid");
            return Ok(ApplyCouponResult::failed(
                LedgerErrorCode::InvalidInput,
                "Coupon code, order id and transaction key are required",
            ));
        }
        if order_id.contains('/') {
            record_coupon_apply("invalid");
            return Ok(ApplyCouponResult::failed(
                LedgerErrorCode::InvalidInput,
                "Order id must not contain '/'",
            ));
        }
        if !payout_amount.is_finite() || payout_amount < 0.0 {
            record_coupon_apply("invalid");
            return Ok(ApplyCouponResult::failed(
                LedgerErrorCode::InvalidInput,
                "Payout amount must be a non-negative number",
            ));
        }

        let scope = GuardScope::new(self.config.orders_collection.as_str(), order_id);
        if self.guard.find(&scope, &code, transaction_key).await?.is_some() {
            info!(code = %code, order_id = %order_id, "Coupon already applied for transaction");
            record_coupon_apply("idempotent");
            return Ok(ApplyCouponResult::already_applied());
        }

        let Some(doc) = self.find_coupon(&code).await? else {
            record_coupon_apply("not_found");
            return Ok(ApplyCouponResult::failed(
                LedgerErrorCode::CouponNotFound,
                format!("Coupon {} not found", code),
            ));
        };
        let coupon = coupon_from_fields(&doc.id, &doc.fields);
        let is_affiliate = is_affiliate.unwrap_or(coupon.is_affiliate);

        let payout = if is_affiliate { payout_amount } else { 1.0 };
        let mut writes = vec![WriteOp::transform(
            self.config.coupons_collection.as_str(),
            doc.id.as_str(),
            vec![
                FieldTransform::increment("usageCount", 1i64),
                FieldTransform::increment("payoutUsage", Delta::from_amount(payout)),
            ],
        )];

        if is_affiliate {
            let entry = AffiliateUsageEntry {
                order_id: order_id.to_string(),
                coupon_code: code.clone(),
                affiliate_code: normalize_code(coupon.effective_affiliate_code()),
                amount: meta.order_amount.unwrap_or(0.0),
                commission: payout_amount,
                customer_email: meta.customer_email.clone(),
                created_at: Utc::now(),
            };
            writes.push(WriteOp::create(
                self.config.affiliate_collection.as_str(),
                guard_key(transaction_key, &code),
                affiliate_entry_to_fields(&entry),
            ));
        }

        match self
            .guard
            .commit_guarded(&scope, &code, transaction_key, writes)
            .await?
        {
            GuardOutcome::Applied(path) => {
                info!(
                    code = %code,
                    order_id = %order_id,
                    affiliate = is_affiliate,
                    apply_path = path.as_str(),
                    "Coupon applied"
                );
                record_coupon_apply(path.as_str());
                Ok(ApplyCouponResult::applied(doc.id))
            }
            GuardOutcome::AlreadyApplied => {
                record_coupon_apply("idempotent");
                Ok(ApplyCouponResult::already_applied())
            }
        }
    }

    /// Apply several coupons to one order, each independently.
    ///
    /// Affiliate uses are credited the configured flat commission. A store
    /// failure on one code becomes that item's error.
    pub async fn batch_apply_coupons_for_order(
        &self,
        coupons: &[BatchCouponInput],
        order_id: &str,
        meta: &OrderMeta,
        transaction_key: &str,
    ) -> BatchApplyResult {
        let mut results = Vec::with_capacity(coupons.len());

        for input in coupons {
            let code = normalize_code(&input.code);
            let result = match self
                .apply_coupon_with_meta(
                    &code,
                    order_id,
                    input.is_affiliate,
                    self.config.affiliate_commission,
                    meta,
                    transaction_key,
                )
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(code = %code, order_id = %order_id, error = %e, "Batch coupon apply failed");
                    record_coupon_apply("error");
                    ApplyCouponResult::failed(LedgerErrorCode::StoreFailure, e.to_string())
                }
            };
            results.push(BatchItemResult { code, result });
        }

        BatchApplyResult::from_results(results)
    }

    /// Create a coupon at `coupons/{CODE}`; never overwrites an existing one.
    pub async fn create_coupon(&self, record: CouponRecord) -> FirestoreResult<CouponRecord> {
        let record = CouponRecord {
            code: normalize_code(&record.code),
            affiliate_code: record.affiliate_code.as_deref().map(normalize_code),
            ..record
        };
        if record.code.is_empty() {
            return Err(FirestoreError::validation("coupon code must not be empty"));
        }
        if self.find_coupon(&record.code).await?.is_some() {
            return Err(FirestoreError::AlreadyExists(format!(
                "{}/{}",
                self.config.coupons_collection, record.code
            )));
        }

        self.store
            .create_document(
                &self.config.coupons_collection,
                &record.code,
                &coupon_to_fields(&record),
            )
            .await?;
        info!(code = %record.code, affiliate = record.is_affiliate, "Coupon created");
        Ok(record)
    }

    pub async fn get_coupon(&self, code: &str) -> FirestoreResult<Option<CouponRecord>> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Ok(None);
        }
        Ok(self
            .find_coupon(&code)
            .await?
            .map(|doc| coupon_from_fields(&doc.id, &doc.fields)))
    }

    /// Check whether a coupon can be redeemed for an order amount at `now`.
    pub async fn validate_coupon(
        &self,
        code: &str,
        order_amount: f64,
        now: DateTime<Utc>,
    ) -> FirestoreResult<CouponEligibility> {
        let code = normalize_code(code);
        let Some(doc) = (if code.is_empty() { None } else { self.find_coupon(&code).await? }) else {
            return Ok(CouponEligibility::rejected(
                LedgerErrorCode::CouponNotFound.as_str(),
                format!("Coupon {} not found", code),
            ));
        };

        let coupon = coupon_from_fields(&doc.id, &doc.fields);
        Ok(match coupon.check_eligibility(order_amount, now) {
            Ok(()) => CouponEligibility::eligible(doc.id, coupon.max_discount),
            Err(e) => CouponEligibility::rejected(e.code(), e.to_string()),
        })
    }

    /// Affiliate audit entries for a partner, newest first.
    pub async fn list_affiliate_usage(
        &self,
        affiliate_code: &str,
        limit: u32,
    ) -> FirestoreResult<Vec<AffiliateUsageEntry>> {
        let query = DocumentQuery::new()
            .eq("affiliateCode", normalize_code(affiliate_code))
            .order_by("createdAt", Direction::Descending)
            .limit(limit.max(1));

        Ok(self
            .store
            .query_documents(&self.config.affiliate_collection, &query)
            .await?
            .iter()
            .map(|doc| affiliate_entry_from_fields(&doc.fields))
            .collect())
    }
}
