use std::net::SocketAddr;

use relayhub::{config, db, logger, pricing, relay, server};

#[tokio::main]
async fn main() {
    if let Err(e) = db::init() {
        eprintln!("database init failed: {}", e);
        std::process::exit(1);
    }
    logger::init();
    pricing::reload();
    relay::channels::rebuild();

    let settings = config::load();
    let addr: SocketAddr = match settings.bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            logger::error("server", &format!("invalid bind address '{}': {}", settings.bind, e));
            std::process::exit(1);
        }
    };

    logger::info("server", &format!("listening on {}", addr));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            logger::error("server", &format!("bind failed: {}", e));
            std::process::exit(1);
        }
    };

    let app = server::router().into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, app).await {
        logger::error("server", &format!("server exited: {}", e));
        std::process::exit(1);
    }
}
