use actix_web::{web, App, HttpServer};
use charvault::Store;

mod handlers;

/// Shared application state
pub struct AppState {
    pub store: Store,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    log::info!("Starting charvault server");

    let data_dir = std::env::var("CHARVAULT_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let host = std::env::var("CHARVAULT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("CHARVAULT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Opening store at: {data_dir}");
    let store = Store::init(&data_dir)
        .map_err(|e| std::io::Error::other(format!("Failed to open store at {data_dir}: {e}")))?;

    let state = web::Data::new(AppState { store });

    log::info!("Listening on {host}:{port}");
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}
