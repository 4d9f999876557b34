use std::sync::Arc;

use audit_store::PageRequest;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use platform_core::{ErrorCode, ResponseEnvelope};
use rental_domain::{
    Account, AccountId, AuditEntry, Identity, Money, PaymentSession, PaymentSessionId, Role,
    Transaction, UserId,
};
use serde::{Deserialize, Serialize};
use settlement::{
    CheckoutOptions, ExtendRequest, PurchaseMethod, PurchaseOutcome, PurchaseStatus,
    SettlementError, SettlementOrchestrator,
};
use tracing::{info, warn};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: Money,
    pub display: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    /// Decimal string, e.g. "40.00".
    pub amount: String,
    pub pay_currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoRenewRequest {
    pub enabled: bool,
}

/// Exactly one of `months` or `expire_at`.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminExtendRequest {
    pub months: Option<u32>,
    pub expire_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSuspendRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminRefundRequest {
    pub amount: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageQuery {
    fn to_page(self) -> PageRequest {
        let default = PageRequest::default();
        PageRequest {
            limit: self.limit.unwrap_or(default.limit).clamp(1, 500),
            offset: self.offset.unwrap_or(default.offset),
        }
    }
}

/// Error half of every handler: an HTTP status plus the envelope body.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::RequestInvalid, message)
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        let (status, code) = match &err {
            SettlementError::Validation(_) => (StatusCode::BAD_REQUEST, ErrorCode::RequestInvalid),
            SettlementError::InsufficientFunds { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, ErrorCode::InsufficientFunds)
            }
            SettlementError::Gateway(_) => (StatusCode::BAD_GATEWAY, ErrorCode::GatewayUnavailable),
            SettlementError::Conflict(_) => (StatusCode::CONFLICT, ErrorCode::Conflict),
            SettlementError::NotFound { .. } => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
            SettlementError::Forbidden(_) => (StatusCode::FORBIDDEN, ErrorCode::Forbidden),
            SettlementError::Storage(_) => {
                warn!(error = %err, "storage failure surfaced to http caller");
                return Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::StorageError,
                    "storage unavailable",
                );
            }
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ResponseEnvelope::<()>::err(self.code, self.message)),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<Json<ResponseEnvelope<T>>, ApiError>;

fn respond<T>(data: T) -> ApiResult<T> {
    Ok(Json(ResponseEnvelope::ok(data)))
}

/// Caller identity from the headers the upstream auth provider sets.
#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity(pub Identity);

impl<S: Send + Sync> FromRequestParts<S> for CallerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let user_id = header(USER_ID_HEADER)
            .as_deref()
            .and_then(UserId::parse)
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    ErrorCode::Unauthenticated,
                    format!("missing or invalid {USER_ID_HEADER} header"),
                )
            })?;
        let role = match header(USER_ROLE_HEADER) {
            None => Role::Advertiser,
            Some(raw) => Role::parse(&raw)
                .ok_or_else(|| ApiError::invalid(format!("unknown role {raw:?}")))?,
        };
        Ok(Self(Identity { user_id, role }))
    }
}

#[derive(Clone)]
pub struct OpsState {
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub service_name: String,
}

impl std::fmt::Debug for OpsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsState")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

pub fn build_router_with_state(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/checkout/options", get(checkout_options))
        .route("/purchases", post(create_purchase))
        .route("/purchases/{id}", get(purchase_status))
        .route("/deposits", post(create_deposit))
        .route("/users/{id}/balance", get(user_balance))
        .route("/users/{id}/transactions", get(user_transactions))
        .route("/users/{id}/accounts", get(user_accounts))
        .route("/accounts/{id}", get(account_detail))
        .route("/accounts/{id}/rename", post(rename_account))
        .route("/accounts/{id}/auto-renew", post(set_auto_renew))
        .route("/accounts/{id}/audit", get(account_audit))
        .route("/admin/accounts/{id}/extend", post(admin_extend))
        .route("/admin/accounts/{id}/suspend", post(admin_suspend))
        .route("/admin/accounts/{id}/reactivate", post(admin_reactivate))
        .route("/admin/users/{id}/refund", post(admin_refund))
        .with_state(state)
}

fn parse_account_id(raw: &str) -> Result<AccountId, ApiError> {
    AccountId::parse(raw).ok_or_else(|| ApiError::invalid(format!("invalid account id {raw:?}")))
}

fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    UserId::parse(raw).ok_or_else(|| ApiError::invalid(format!("invalid user id {raw:?}")))
}

fn parse_session_id(raw: &str) -> Result<PaymentSessionId, ApiError> {
    PaymentSessionId::parse(raw)
        .ok_or_else(|| ApiError::invalid(format!("invalid payment session id {raw:?}")))
}

fn parse_amount(raw: &str) -> Result<Money, ApiError> {
    Money::parse_decimal(raw).map_err(|err| ApiError::invalid(err.to_string()))
}

async fn health(State(state): State<OpsState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: state.service_name,
    })
}

async fn checkout_options(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
) -> ApiResult<CheckoutOptions> {
    respond(state.orchestrator.checkout_options(&identity).await?)
}

async fn create_purchase(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Json(method): Json<PurchaseMethod>,
) -> ApiResult<PurchaseOutcome> {
    info!(route = "/purchases", user_id = %identity.user_id.0, "ops http request");
    let outcome = state
        .orchestrator
        .initiate_purchase(&identity, method)
        .await?;
    if let PurchaseOutcome::AwaitingPayment { session } = &outcome {
        watch_polling(&state.orchestrator, session.id);
    }
    respond(outcome)
}

async fn create_deposit(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Json(request): Json<DepositRequest>,
) -> ApiResult<PaymentSession> {
    info!(route = "/deposits", user_id = %identity.user_id.0, "ops http request");
    let amount = parse_amount(&request.amount)?;
    let session = state
        .orchestrator
        .initiate_deposit(&identity, amount, &request.pay_currency)
        .await?;
    watch_polling(&state.orchestrator, session.id);
    respond(session)
}

/// Polls the session in the background and logs how the poll ended.
fn watch_polling(
    orchestrator: &SettlementOrchestrator,
    session_id: PaymentSessionId,
) -> tokio::task::JoinHandle<()> {
    let poll = orchestrator.start_polling(session_id);
    tokio::spawn(async move {
        match poll.await {
            Ok(Ok(status)) => info!(
                session_id = %session_id.0,
                status = status.as_str(),
                "session polling finished"
            ),
            Ok(Err(err)) => warn!(
                session_id = %session_id.0,
                error = %err,
                "session polling stopped"
            ),
            Err(err) => warn!(
                session_id = %session_id.0,
                error = %err,
                "session poller task ended abnormally"
            ),
        }
    })
}

async fn purchase_status(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<PurchaseStatus> {
    let session_id = parse_session_id(&id)?;
    respond(
        state
            .orchestrator
            .get_purchase_status(&identity, session_id)
            .await?,
    )
}

async fn user_balance(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<BalanceResponse> {
    let user_id = parse_user_id(&id)?;
    let balance = state.orchestrator.balance(&identity, user_id).await?;
    respond(BalanceResponse {
        user_id,
        balance,
        display: balance.to_string(),
    })
}

async fn user_transactions(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Vec<Transaction>> {
    let user_id = parse_user_id(&id)?;
    respond(
        state
            .orchestrator
            .list_transactions(&identity, user_id)
            .await?,
    )
}

async fn user_accounts(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Vec<Account>> {
    let user_id = parse_user_id(&id)?;
    respond(state.orchestrator.list_accounts(&identity, user_id).await?)
}

async fn account_detail(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Account> {
    let account_id = parse_account_id(&id)?;
    respond(state.orchestrator.get_account(&identity, account_id).await?)
}

async fn rename_account(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Account> {
    let account_id = parse_account_id(&id)?;
    respond(
        state
            .orchestrator
            .rename_account(&identity, account_id, &request.name)
            .await?,
    )
}

async fn set_auto_renew(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
    Json(request): Json<AutoRenewRequest>,
) -> ApiResult<Account> {
    let account_id = parse_account_id(&id)?;
    respond(
        state
            .orchestrator
            .set_auto_renew(&identity, account_id, request.enabled)
            .await?,
    )
}

async fn account_audit(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Vec<AuditEntry>> {
    let account_id = parse_account_id(&id)?;
    respond(
        state
            .orchestrator
            .account_audit(&identity, account_id, page.to_page())
            .await?,
    )
}

async fn admin_extend(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
    Json(request): Json<AdminExtendRequest>,
) -> ApiResult<Account> {
    info!(route = "/admin/accounts/:id/extend", account_id = %id, "ops http request");
    let account_id = parse_account_id(&id)?;
    let extend = match (request.months, request.expire_at) {
        (Some(months), None) => ExtendRequest::ByMonths(months),
        (None, Some(at)) => ExtendRequest::Until(at),
        _ => {
            return Err(ApiError::invalid(
                "provide exactly one of months or expire_at",
            ));
        }
    };
    respond(
        state
            .orchestrator
            .extend_account(&identity, account_id, extend, request.note)
            .await?,
    )
}

async fn admin_suspend(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
    Json(request): Json<AdminSuspendRequest>,
) -> ApiResult<Account> {
    info!(route = "/admin/accounts/:id/suspend", account_id = %id, "ops http request");
    let account_id = parse_account_id(&id)?;
    respond(
        state
            .orchestrator
            .suspend_account(&identity, account_id, &request.reason)
            .await?,
    )
}

async fn admin_reactivate(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Account> {
    info!(route = "/admin/accounts/:id/reactivate", account_id = %id, "ops http request");
    let account_id = parse_account_id(&id)?;
    respond(
        state
            .orchestrator
            .reactivate_account(&identity, account_id)
            .await?,
    )
}

async fn admin_refund(
    State(state): State<OpsState>,
    CallerIdentity(identity): CallerIdentity,
    Path(id): Path<String>,
    Json(request): Json<AdminRefundRequest>,
) -> ApiResult<Transaction> {
    info!(route = "/admin/users/:id/refund", user_id = %id, "ops http request");
    let user_id = parse_user_id(&id)?;
    let amount = parse_amount(&request.amount)?;
    respond(
        state
            .orchestrator
            .refund_user(&identity, user_id, amount, &request.reason)
            .await?,
    )
}
