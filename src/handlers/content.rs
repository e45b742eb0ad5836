//! Content endpoints. Static pages sit behind the static cache, statistics
//! behind the dynamic cache (see `routes.rs`).

use axum::Json;
use axum::extract::State;
use serde_json::Value;

use crate::models::{NetworkStats, ValidatorBondsPage, ValidatorStats};
use crate::state::AppState;

pub async fn home(State(state): State<AppState>) -> Json<Value> {
    Json(state.content.home())
}

pub async fn whitepaper(State(state): State<AppState>) -> Json<Value> {
    Json(state.content.whitepaper())
}

pub async fn peopay(State(state): State<AppState>) -> Json<Value> {
    Json(state.content.peopay())
}

pub async fn technology(State(state): State<AppState>) -> Json<Value> {
    Json(state.content.technology())
}

pub async fn validator_bonds(State(state): State<AppState>) -> Json<ValidatorBondsPage> {
    Json(state.content.validator_bonds())
}

pub async fn network_stats(State(state): State<AppState>) -> Json<NetworkStats> {
    Json(state.content.network_stats())
}

pub async fn validator_stats(State(state): State<AppState>) -> Json<ValidatorStats> {
    Json(state.content.validator_stats())
}
