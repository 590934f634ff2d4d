pub mod admin;
pub mod billing;
pub mod config;
pub mod crypto;
pub mod error;
pub mod forward;
pub mod logger;
pub mod pricing;
pub mod quota;
pub mod selector;
pub mod server;
pub mod store;

/// Start the gateway: open the store, run startup migrations, hydrate the
/// hot config and price table, then serve until the process is stopped.
pub async fn run() {
    // Log panics before they take the process down.
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };

        let location = if let Some(location) = panic_info.location() {
            format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )
        } else {
            "Unknown location".to_string()
        };

        crate::logger::error(
            "panic",
            &format!("PANIC occurred: message='{}', location='{}'", message, location),
        );
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    let env = config::env_config();
    let store = store::Store::open_default().expect("failed to open store");
    logger::init(store.db_path());
    logger::info("app", "Gateway starting");

    if let Err(e) = store.normalize_timestamps().await {
        logger::error("store", &format!("Timestamp normalization failed: {}", e));
    }
    store
        .ensure_admin_user(&env.admin_username, &env.admin_password)
        .await
        .expect("failed to seed admin user");

    let hot = config::HotConfig::default();
    if let Err(e) = hot.load_from_store(&store).await {
        logger::warn("config", &format!("Hot config load failed: {}", e));
    }

    let prices = pricing::PriceTable::default();
    prices.spawn_refresher(store.clone(), hot.clone());

    let state = server::AppState::new(store, prices, hot);
    server::serve(state).await;
}
