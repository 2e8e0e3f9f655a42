//! Tenant listing.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use tether_core::auth::Permission;
use tether_core::resource::budget::BudgetAmount;
use tether_core::resource::POLICY_NAME;

use super::error::ApiError;
use crate::state::AppState;
use crate::trace::trace_id_from;

/// Summary of a tenant's policy for the tenant list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySummary {
    /// Models the tenant allows; empty means unrestricted.
    pub models_allowed: Vec<String>,
    /// Monthly budget ceiling, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_budget: Option<BudgetAmount>,
    /// Budget percent used this period.
    pub budget_percent_used: u32,
    /// Whether the tenant has a policy at all.
    pub has_policy: bool,
}

/// One row of the tenant list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantEntry {
    /// Tenant name.
    pub tenant: String,
    /// The caller's permission in the tenant.
    pub permission: Permission,
    /// Policy summary.
    pub policy_summary: PolicySummary,
}

/// `GET /v1/namespaces` — tenants visible to the caller.
pub async fn list_tenants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<TenantEntry>>, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;

    let visible = state
        .authorizer
        .visible_tenants(&subject)
        .await
        .map_err(|e| ApiError::from_core(e, &trace_id))?;

    let entries = visible
        .into_iter()
        .map(|(tenant, permission)| {
            let policy = state.policies.get(&tenant, POLICY_NAME);
            let policy_summary = policy.map_or(
                PolicySummary {
                    models_allowed: Vec::new(),
                    monthly_budget: None,
                    budget_percent_used: 0,
                    has_policy: false,
                },
                |stored| PolicySummary {
                    models_allowed: stored.resource.spec.models.allowed.clone(),
                    monthly_budget: stored.resource.spec.models.budget.as_ref().map(|b| b.monthly),
                    budget_percent_used: stored.resource.status.usage.budget.percent_used,
                    has_policy: true,
                },
            );
            TenantEntry {
                tenant,
                permission,
                policy_summary,
            }
        })
        .collect();

    state.metrics.metrics().api_request("namespaces.list", 200);
    Ok(Json(entries))
}
