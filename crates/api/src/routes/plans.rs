//! Plan catalog endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use glimpse_billing::plans::PlanSummary;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    #[serde(default)]
    pub self_serve: bool,
}

pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlanQuery>,
) -> ApiResult<Json<Vec<PlanSummary>>> {
    let plans = state.billing.plans.list_active(query.self_serve).await?;
    Ok(Json(plans.iter().map(|p| p.summary()).collect()))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<PlanSummary>> {
    let plan = state.billing.plans.get_active(&key).await?;
    Ok(Json(plan.summary()))
}
