pub mod calls;
pub mod stream;
pub mod webhooks;

use std::convert::Infallible;
use std::sync::Arc;

use warp::{Filter, Rejection, Reply};

use crate::session::CallRegistry;

pub fn with_registry(
    registry: Arc<CallRegistry>,
) -> impl Filter<Extract = (Arc<CallRegistry>,), Error = Infallible> + Clone {
    warp::any().map(move || registry.clone())
}

pub fn routes(
    registry: Arc<CallRegistry>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    webhooks::routes(registry.clone())
        .or(calls::routes(registry.clone()))
        .or(stream::routes(registry))
}
