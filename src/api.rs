//! JSON HTTP API over the ledger, the loan book and the calculator.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use welfund_core::{
    amortization, AppendEntryCommand, Direction, EntryReference, FundKind, Installment,
    LedgerError, Loan, LoanPosition, RateBasis, StorageError, TransactionKind,
};

use crate::{
    ledger::{reject, Ledger},
    loans::{LoanApplication, LoanBook, RepaymentRequest, TermsRevision},
    reconcile::BalanceCache,
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub loans: LoanBook,
    pub cache: BalanceCache,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/funds", get(list_funds).post(create_fund))
        .route("/funds/:fund/balance", get(fund_balance))
        .route("/funds/:fund/summary", get(fund_summary))
        .route("/funds/:fund/statement", get(fund_statement))
        .route("/funds/:fund/entries", get(list_entries).post(record_entry))
        .route("/entries/:id/reverse", post(reverse_entry))
        .route("/calculator", post(calculate))
        .route("/calculator/debt-to-income", post(debt_to_income))
        .route("/loans", get(list_loans).post(apply_for_loan))
        .route("/loans/:id", get(get_loan))
        .route("/loans/:id/terms", post(revise_terms))
        .route("/loans/:id/approve", post(approve_loan))
        .route("/loans/:id/reject", post(reject_loan))
        .route("/loans/:id/disburse", post(disburse_loan))
        .route("/loans/:id/default", post(default_loan))
        .route("/loans/:id/write-off", post(write_off_loan))
        .route("/loans/:id/repayments", get(list_repayments).post(record_repayment))
        .with_state(state)
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Ledger(LedgerError),
    BadRequest(String),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Ledger(err) if err.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Ledger(err) => match err {
                LedgerError::InvalidStatusTransition { .. }
                | LedgerError::TermsLocked(_)
                | LedgerError::AlreadyReversed(_)
                | LedgerError::Storage(StorageError::FundAlreadyExists(_))
                | LedgerError::Storage(StorageError::LoanAlreadyExists(_)) => StatusCode::CONFLICT,
                LedgerError::Storage(StorageError::FundNotFound(_))
                | LedgerError::Storage(StorageError::EntryNotFound(_))
                | LedgerError::Storage(StorageError::LoanNotFound(_)) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Ledger(err) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %err, "Storage failure");
                "Internal server error".to_string()
            }
            ApiError::Ledger(err) => err.to_string(),
        };

        let body = Json(json!({
            "success": false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_entry_id(id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest(format!("invalid entry id: {}", id)))
}

// ===== Health & metrics =====

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

// ===== Funds & ledger =====

#[derive(Debug, Deserialize)]
struct CreateFundRequest {
    id: String,
    name: String,
    kind: FundKind,
}

async fn list_funds(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.list_funds()?))
}

async fn create_fund(
    State(state): State<AppState>,
    Json(req): Json<CreateFundRequest>,
) -> ApiResult<impl IntoResponse> {
    let fund = state.ledger.create_fund(&req.id, &req.name, req.kind)?;
    Ok((StatusCode::CREATED, Json(fund)))
}

#[derive(Debug, Default, Deserialize)]
struct BalanceQuery {
    #[serde(default)]
    cached: bool,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    fund_id: String,
    balance: Decimal,
    cached: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    reconciled_at: Option<OffsetDateTime>,
}

async fn fund_balance(
    State(state): State<AppState>,
    Path(fund): Path<String>,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.cached {
        if let Some(cached) = state.cache.get(&fund) {
            return Ok(Json(BalanceResponse {
                fund_id: fund,
                balance: cached.balance,
                cached: true,
                reconciled_at: Some(cached.reconciled_at),
            }));
        }
    }

    let balance = state.ledger.current_balance(&fund)?;
    Ok(Json(BalanceResponse {
        fund_id: fund,
        balance,
        cached: false,
        reconciled_at: None,
    }))
}

async fn fund_summary(
    State(state): State<AppState>,
    Path(fund): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let summary = state.ledger.summary(&fund)?;
    Ok(Json(json!({
        "fund_id": summary.fund_id,
        "total_credits": summary.total_credits,
        "total_debits": summary.total_debits,
        "balance": summary.balance(),
        "entry_count": summary.entry_count,
    })))
}

async fn fund_statement(
    State(state): State<AppState>,
    Path(fund): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.statement(&fund)?))
}

async fn list_entries(
    State(state): State<AppState>,
    Path(fund): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ledger.entries(&fund)?))
}

#[derive(Debug, Deserialize)]
struct RecordEntryRequest {
    kind: String,
    amount: Decimal,
    is_credit: bool,
    #[serde(default)]
    description: String,
    #[serde(default)]
    reference: Option<EntryReference>,
    #[serde(default)]
    actor: Option<String>,
}

async fn record_entry(
    State(state): State<AppState>,
    Path(fund): Path<String>,
    Json(req): Json<RecordEntryRequest>,
) -> ApiResult<impl IntoResponse> {
    let kind = TransactionKind::parse(&req.kind).map_err(|e| reject("record", e))?;
    let mut command = AppendEntryCommand::new(
        &fund,
        kind,
        req.amount,
        Direction::from_credit_flag(req.is_credit),
        &req.description,
    )
    .with_actor(req.actor.as_deref());
    command.reference = req.reference;

    let entry = state.ledger.record(&command)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Default, Deserialize)]
struct ReverseRequest {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    actor: Option<String>,
}

async fn reverse_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ReverseRequest>>,
) -> ApiResult<impl IntoResponse> {
    let entry_id = parse_entry_id(&id)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let description = req
        .description
        .unwrap_or_else(|| format!("Reversal of {}", entry_id));
    let entry = state
        .ledger
        .reverse(entry_id, &description, req.actor.as_deref())?;
    Ok((StatusCode::CREATED, Json(entry)))
}

// ===== Calculator =====

#[derive(Debug, Deserialize)]
struct CalculatorRequest {
    principal: Decimal,
    rate: Decimal,
    term_months: i64,
    #[serde(default)]
    basis: RateBasis,
    #[serde(default)]
    include_schedule: bool,
}

#[derive(Debug, Serialize)]
struct CalculatorResponse {
    monthly_payment: Decimal,
    total_interest: Decimal,
    total_amount: Decimal,
    basis: RateBasis,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<Vec<Installment>>,
}

async fn calculate(Json(req): Json<CalculatorRequest>) -> ApiResult<impl IntoResponse> {
    let term = u32::try_from(req.term_months).map_err(|_| {
        reject(
            "calculate",
            LedgerError::InvalidLoanParameters(format!("invalid term: {}", req.term_months)),
        )
    })?;

    let figures = amortization::calculate_with_basis(req.principal, req.rate, term, req.basis)
        .map_err(|e| reject("calculate", e))?;
    let schedule = if req.include_schedule {
        Some(amortization::schedule(req.principal, req.rate, term, req.basis)?)
    } else {
        None
    };

    Ok(Json(CalculatorResponse {
        monthly_payment: figures.monthly_payment,
        total_interest: figures.total_interest,
        total_amount: figures.total_amount,
        basis: req.basis,
        schedule,
    }))
}

#[derive(Debug, Deserialize)]
struct DebtToIncomeRequest {
    existing_debt: Decimal,
    monthly_income: Decimal,
}

async fn debt_to_income(Json(req): Json<DebtToIncomeRequest>) -> Json<serde_json::Value> {
    Json(json!({
        "debt_to_income_ratio": amortization::debt_to_income_ratio(req.existing_debt, req.monthly_income),
    }))
}

// ===== Loans =====

#[derive(Debug, Serialize)]
struct LoanView {
    #[serde(flatten)]
    loan: Loan,
    position: LoanPosition,
}

async fn list_loans(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.loans.list_loans()?))
}

async fn apply_for_loan(
    State(state): State<AppState>,
    Json(req): Json<LoanApplication>,
) -> ApiResult<impl IntoResponse> {
    let loan = state.loans.apply(&req)?;
    Ok((StatusCode::CREATED, Json(loan)))
}

async fn get_loan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let loan = state.loans.get_loan(&id)?;
    let position = state.loans.position(&id)?;
    Ok(Json(LoanView { loan, position }))
}

async fn revise_terms(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TermsRevision>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.loans.revise_terms(&id, &req)?))
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    #[serde(default)]
    approved_amount: Option<Decimal>,
    approved_by: String,
}

async fn approve_loan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.loans.approve(&id, req.approved_amount, &req.approved_by)?))
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
}

async fn reject_loan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.loans.reject(&id, &req.reason)?))
}

#[derive(Debug, Default, Deserialize)]
struct DisburseRequest {
    #[serde(default)]
    actor: Option<String>,
}

async fn disburse_loan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<DisburseRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.loans.disburse(&id, req.actor.as_deref())?))
}

async fn default_loan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.loans.mark_defaulted(&id)?))
}

async fn write_off_loan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.loans.write_off(&id)?))
}

async fn list_repayments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.loans.repayments(&id)?))
}

async fn record_repayment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RepaymentRequest>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state.loans.record_repayment(&id, &req)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use serde_json::Value;
    use tower::ServiceExt;
    use welfund_memory::InMemoryStorage;

    use super::*;
    use crate::loans::LoanPolicy;

    fn app() -> Router {
        let ledger = Ledger::new(Arc::new(InMemoryStorage::new()));
        ledger.create_fund("welfare", "Welfare Fund", FundKind::Welfare).unwrap();
        ledger.create_fund("loan_kitty", "Loan Kitty", FundKind::LoanKitty).unwrap();
        let loans = LoanBook::new(ledger.clone(), LoanPolicy::default());
        router(AppState {
            ledger,
            loans,
            cache: BalanceCache::new(),
            metrics: None,
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_record_and_balance() {
        let app = app();
        let (status, _) = send(
            &app,
            "POST",
            "/funds/welfare/entries",
            Some(json!({"kind": "contribution", "amount": "5000", "is_credit": true, "description": "Monthly dues"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            &app,
            "POST",
            "/funds/welfare/entries",
            Some(json!({"kind": "disbursement", "amount": "2000", "is_credit": false, "description": "Medical support"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, "GET", "/funds/welfare/balance", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], "3000");
        assert_eq!(body["cached"], false);
    }

    #[tokio::test]
    async fn test_validation_and_not_found_errors() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/funds/welfare/entries",
            Some(json!({"kind": "lottery", "amount": "10", "is_credit": true})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &app,
            "POST",
            "/funds/welfare/entries",
            Some(json!({"kind": "contribution", "amount": "-1", "is_credit": true})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(&app, "GET", "/funds/nope/balance", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let (status, _) = send(&app, "POST", "/entries/not-a-uuid/reverse", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_calculator() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/calculator",
            Some(json!({"principal": "100000", "rate": "5", "term_months": 12, "basis": "annual"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["monthly_payment"], "8560.75");
        assert_eq!(body["total_interest"], "2729.00");
        assert!(body.get("schedule").is_none());

        let (status, body) = send(
            &app,
            "POST",
            "/calculator",
            Some(json!({"principal": "1200", "rate": "0", "term_months": 12, "include_schedule": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schedule"].as_array().unwrap().len(), 12);

        let (status, _) = send(
            &app,
            "POST",
            "/calculator",
            Some(json!({"principal": "1000", "rate": "5", "term_months": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(
            &app,
            "POST",
            "/calculator",
            Some(json!({"principal": "1000", "rate": "0", "term_months": 4294967295u64, "include_schedule": true})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("600"));
    }

    #[tokio::test]
    async fn test_entry_references_reserved_for_reversal() {
        let app = app();
        let (status, original) = send(
            &app,
            "POST",
            "/funds/welfare/entries",
            Some(json!({"kind": "writeoff", "amount": "100", "is_credit": false, "description": "Bad debt"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(original["kind"], "write_off");
        let id = original["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            "POST",
            "/funds/welfare/entries",
            Some(json!({
                "kind": "expense",
                "amount": "1",
                "is_credit": false,
                "reference": {"type": "entry", "id": id}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&app, "POST", &format!("/entries/{}/reverse", id), None).await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, body) = send(&app, "GET", "/funds/welfare/balance", None).await;
        assert_eq!(body["balance"], "0");
    }

    #[tokio::test]
    async fn test_loan_flow_over_http() {
        let app = app();
        let (status, loan) = send(
            &app,
            "POST",
            "/loans",
            Some(json!({
                "member_id": "m-1",
                "loan_type": "emergency",
                "amount": "3000",
                "interest_rate": "0",
                "term_months": 3,
                "purpose": "hospital bill"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = loan["id"].as_str().unwrap().to_string();

        let (status, _) = send(&app, "POST", &format!("/loans/{}/approve", id), Some(json!({"approved_by": "chair"}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "POST", &format!("/loans/{}/terms", id), Some(json!({"term_months": 6}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, "POST", &format!("/loans/{}/disburse", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, receipt) = send(
            &app,
            "POST",
            &format!("/loans/{}/repayments", id),
            Some(json!({"amount": "1000", "payment_method": "mpesa"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(receipt["position"]["balance_remaining"], "2000");
        assert_eq!(receipt["loan"]["status"], "repaying");

        let (status, view) = send(&app, "GET", &format!("/loans/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["position"]["repayment_count"], 1);

        let (status, body) = send(&app, "GET", "/funds/loan_kitty/balance", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], "-2000");
    }
}
