//! wampd-router: WAMP router transport daemon.
//!
//! Runs the uni-socket listener (RawSocket + WebSocket on one port) and,
//! when enabled, the long-poll HTTP endpoint. Sessions are wired to the
//! loopback echo factory; an embedding application replaces it with the
//! real WAMP router layer.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use wampd_core::{LoopbackSessionFactory, SerializerRegistry, SessionFactory};
use wampd_router::config::Config;
use wampd_router::longpoll::LongPollResource;
use wampd_router::transport::{WampRawSocketServer, WampWebSocketServer};
use wampd_router::unisocket::{StreamHandler, UniSocketServer};

/// wampd-router — WAMP router transport layer
#[derive(Parser, Debug)]
#[command(name = "wampd-router", version, about = "WAMP router transport layer")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "wampd.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let mut config = if cli.config.is_file() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, path = %cli.config.display(), "failed to load config");
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.listener.bind = bind;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.listener.bind,
        "starting wampd-router"
    );

    let cookie_store = match config.cookie.build_store() {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open cookie store");
            std::process::exit(1);
        }
    };

    let factory: Arc<dyn SessionFactory> = Arc::new(LoopbackSessionFactory);
    let serializers = SerializerRegistry::with_defaults();

    let mut websocket = WampWebSocketServer::new(Arc::clone(&factory), serializers.clone())
        .require_subprotocol(config.websocket.require_subprotocol)
        .with_cookie_auth(config.websocket.cookie_auth);
    if let Some(store) = &cookie_store {
        websocket = websocket.with_cookie_store(Arc::clone(store));
    }
    let websocket = Arc::new(websocket);

    let rawsocket = Arc::new(WampRawSocketServer::new(
        Arc::clone(&factory),
        serializers.clone(),
    ));

    let mut unisocket =
        UniSocketServer::new().with_rawsocket(rawsocket as Arc<dyn StreamHandler>);
    for path in &config.websocket.paths {
        unisocket = unisocket.add_websocket(
            path.clone(),
            Arc::clone(&websocket) as Arc<dyn StreamHandler>,
        );
    }
    let unisocket = Arc::new(unisocket);

    if config.longpoll.enabled {
        let resource = LongPollResource::new(
            Arc::clone(&factory),
            serializers.clone(),
            config.longpoll.options(),
        );
        let bind = config.longpoll.bind;
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(bind).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, addr = %bind, "failed to bind long-poll endpoint");
                    return;
                }
            };
            info!(addr = %bind, "long-poll endpoint up");
            let app = resource
                .router()
                .into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "long-poll endpoint failed");
            }
        });
    }

    if let Err(e) = unisocket.listen(config.listener.bind).await {
        error!(error = %e, "uni-socket listener failed");
        std::process::exit(1);
    }
}
