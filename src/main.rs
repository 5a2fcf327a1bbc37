use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use gatehouse_server::auth::middleware::{rate_limit_gate, session_gate};
use gatehouse_server::email::HttpMailer;
use gatehouse_server::store::PgDocumentStore;
use gatehouse_server::{routes, AppState, Settings};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let settings = Settings::new().context("Failed to load settings")?;
    info!("starting in {} mode", settings.environment);

    let store = PgDocumentStore::connect(
        &settings.database.url,
        settings.database.max_connections,
        Duration::from_secs(5),
    )
    .await
    .context("Failed to connect to document store")?;
    store.migrate().await.context("Failed to run migrations")?;

    let mailer = Arc::new(HttpMailer::new(
        settings.email.endpoint.clone(),
        settings.email.from.clone(),
        settings.email.public_url.clone(),
    ));

    let host = settings.server.host.clone();
    let port = settings.server.port;
    let workers = settings.server.workers as usize;

    let state = web::Data::new(AppState::new(settings, Arc::new(store), mailer)?);

    // Limiter maps grow one entry per distinct IP/user; sweep them so a
    // long-running process does not hold them forever.
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            sweeper.sweep_limiters().await;
        }
    });

    let listener = TcpListener::bind((host.as_str(), port))
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    info!("listening on {}:{}", host, port);

    let app_state = state.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes)
            // wrap() nests outward: the rate-limit stage runs first, then
            // session resolution, then the route handlers.
            .wrap(from_fn(session_gate))
            .wrap(from_fn(rate_limit_gate))
    })
    .workers(workers)
    .listen(listener)?
    .run()
    .await?;

    Ok(())
}
