use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use url::Url;
use warp::{Filter, Rejection, Reply};

use super::with_registry;
use crate::session::CallRegistry;

/// Answer the carrier's voice webhook with connection instructions for the
/// bidirectional media stream, echoing the per-call prompt as a stream
/// parameter.
async fn voice_handler(
    form: HashMap<String, String>,
    host: Option<String>,
    registry: Arc<CallRegistry>,
) -> Result<impl Reply, Rejection> {
    let call_sid = form.get("CallSid").cloned().unwrap_or_default();
    let from_number = form.get("From").cloned().unwrap_or_default();
    let to_number = form.get("To").cloned().unwrap_or_default();

    let ws_url = media_stream_url(&registry, host.as_deref());
    let prompt = registry.pending_prompt(&call_sid).unwrap_or_default();
    tracing::info!(
        "Voice webhook: {} from {} to {} -> {}",
        call_sid,
        from_number,
        to_number,
        ws_url
    );

    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{}">
            <Parameter name="prompt" value="{}" />
            <Parameter name="call_sid" value="{}" />
        </Stream>
    </Connect>
</Response>"#,
        xml_escape(&ws_url),
        xml_escape(&prompt),
        xml_escape(&call_sid),
    );
    Ok(warp::reply::with_header(
        twiml,
        "content-type",
        "application/xml",
    ))
}

async fn status_handler(
    form: HashMap<String, String>,
    registry: Arc<CallRegistry>,
) -> Result<impl Reply, Rejection> {
    let call_sid = form.get("CallSid").cloned().unwrap_or_default();
    let call_status = form.get("CallStatus").cloned().unwrap_or_default();
    registry.handle_status(&call_sid, &call_status).await;
    Ok(warp::reply::json(&json!({"status": "ok"})))
}

/// The externally visible stream URL: configured public host when set,
/// otherwise whatever host header the request came in on.
fn media_stream_url(registry: &CallRegistry, host_header: Option<&str>) -> String {
    let config = registry.config();
    let host = public_host(&config.server.public_url)
        .or_else(|| host_header.map(|host| host.to_string()))
        .unwrap_or_else(|| "localhost".to_string());
    format!("wss://{}{}", host, config.server.ws_path)
}

fn public_host(public_url: &str) -> Option<String> {
    if public_url.is_empty() {
        return None;
    }
    let url = Url::parse(public_url).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn routes(
    registry: Arc<CallRegistry>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let voice = warp::path!("carrier" / "voice")
        .and(warp::post())
        .and(warp::body::form())
        .and(warp::header::optional::<String>("host"))
        .and(with_registry(registry.clone()))
        .and_then(voice_handler);

    let status = warp::path!("carrier" / "status")
        .and(warp::post())
        .and(warp::body::form())
        .and(with_registry(registry))
        .and_then(status_handler);

    voice.or(status)
}
