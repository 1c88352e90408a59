use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::with_registry;
use crate::session::CallRegistry;

const DEFAULT_CALL_PROMPT: &str = "You are a helpful AI assistant making a phone call.";

#[derive(Debug, Deserialize)]
struct CallRequest {
    to: String,
    prompt: Option<String>,
    webhook_url: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<Value>,
}

async fn initiate_call_handler(
    payload: CallRequest,
    registry: Arc<CallRegistry>,
) -> Result<impl Reply, Rejection> {
    if payload.to.is_empty() {
        return Ok(warp::reply::json(
            &json!({"success": false, "error": "missing 'to' phone number"}),
        ));
    }
    let prompt = payload
        .prompt
        .as_deref()
        .unwrap_or(DEFAULT_CALL_PROMPT);
    let result = registry
        .initiate_call(&payload.to, prompt, payload.webhook_url)
        .await;
    match result {
        Ok(call_id) => Ok(warp::reply::json(
            &json!({"success": true, "call_id": call_id}),
        )),
        Err(err) => {
            tracing::error!("Call initiation failed: {}", err);
            Ok(warp::reply::json(
                &json!({"success": false, "error": err.to_string()}),
            ))
        }
    }
}

async fn list_calls_handler(registry: Arc<CallRegistry>) -> Result<impl Reply, Rejection> {
    let calls = registry.active_calls();
    let count = calls.len();
    Ok(warp::reply::json(&json!({"calls": calls, "count": count})))
}

async fn end_call_handler(
    call_id: Uuid,
    registry: Arc<CallRegistry>,
) -> Result<impl Reply, Rejection> {
    match registry.end_call(call_id).await {
        Ok(()) => Ok(warp::reply::json(&json!({"success": true}))),
        Err(err) => Ok(warp::reply::json(
            &json!({"success": false, "error": err.to_string()}),
        )),
    }
}

async fn health_handler(registry: Arc<CallRegistry>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&json!({
        "status": "healthy",
        "active_calls": registry.active_count(),
    })))
}

pub fn routes(
    registry: Arc<CallRegistry>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let initiate = warp::path!("api" / "call")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_registry(registry.clone()))
        .and_then(initiate_call_handler);

    let list = warp::path!("api" / "calls")
        .and(warp::get())
        .and(with_registry(registry.clone()))
        .and_then(list_calls_handler);

    let end = warp::path!("api" / "calls" / Uuid / "end")
        .and(warp::post())
        .and(with_registry(registry.clone()))
        .and_then(end_call_handler);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_registry(registry))
        .and_then(health_handler);

    initiate.or(list).or(end).or(health)
}
