use std::env;
use std::net::IpAddr;
use std::path::Path;

use tracing_subscriber::EnvFilter;
use warp::Filter;

use parley::api;
use parley::config::Config;
use parley::session::CallRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let conf_path = args.last().expect("Need a configuration file").clone();
    let conf = Config::load(Path::new(&conf_path)).expect("Reading config failed");

    let host: IpAddr = conf.server.host.parse().expect("Invalid server host");
    let port = conf.server.port;
    let registry = CallRegistry::new(conf);

    let log_requests = warp::log::custom(|info| {
        tracing::info!(
            "{} {} {} {}",
            info.remote_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "???".into()),
            info.method(),
            info.path(),
            info.status()
        );
    });

    let routes = api::routes(registry).with(log_requests);

    tracing::info!("Serving on {}:{}", host, port);
    warp::serve(routes).run((host, port)).await;
}
