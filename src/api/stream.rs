use std::sync::Arc;

use warp::{Filter, Rejection, Reply};

use super::with_registry;
use crate::carrier::stream::MediaStream;
use crate::session::CallRegistry;

/// The carrier's media-stream channel. Each upgraded socket becomes one call
/// session driven by the registry until the stream stops.
pub fn routes(
    registry: Arc<CallRegistry>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("carrier" / "media-stream")
        .and(warp::ws())
        .and(with_registry(registry))
        .map(|ws: warp::ws::Ws, registry: Arc<CallRegistry>| {
            ws.on_upgrade(move |socket| async move {
                tracing::info!("Media stream connection accepted");
                let media = MediaStream::spawn(socket);
                registry.handle_media_stream(media).await;
                tracing::info!("Media stream connection finished");
            })
        })
}
