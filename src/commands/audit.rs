use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::analytics::UsageReport;
use crate::audit::{AuditFilter, Page};
use crate::auth::{Capability, Principal};
use crate::db::models::{LogCategory, LogEntry, LogLevel};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogParams {
    pub user_id: Option<String>,
    pub category: Option<LogCategory>,
    pub level: Option<LogLevel>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn list_audit_logs(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<AuditLogParams>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    principal.require(Capability::ViewAuditLogs)?;

    let filter = AuditFilter {
        user_id: params.user_id,
        category: params.category,
        level: params.level,
        start_date: params.start_date,
        end_date: params.end_date,
    };
    let page = Page {
        offset: params.offset.unwrap_or(0),
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    };
    Ok(Json(state.audit.query(&filter, Some(page))))
}

pub async fn clear_audit_logs(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<StatusCode, ApiError> {
    principal.require(Capability::ViewAuditLogs)?;
    let cleared = state.audit.len();
    state.audit.clear();
    tracing::info!(user = %principal.id, cleared, "audit log cleared");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsParams {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

pub async fn get_analytics(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<UsageReport>, ApiError> {
    principal.require(Capability::ViewAnalytics)?;

    let filter = AuditFilter {
        start_date: params.start_date,
        end_date: params.end_date,
        ..AuditFilter::default()
    };
    let entries = state.audit.query(&filter, None);
    Ok(Json(UsageReport::from_entries(&entries)))
}
