// main.rs
use dotenv::dotenv;
use jalikoi_analytics::config_utils::AppConfig;
use jalikoi_analytics::rest_utils;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = AppConfig::from_env();
    log::info!(
        "Jalikoi Analytics API v{} (db {}@{}:{}, model dir {})",
        env!("CARGO_PKG_VERSION"),
        config.db.database,
        config.db.host,
        config.db.port,
        config.model_dir
    );

    rest_utils::run_server(config).await
}
