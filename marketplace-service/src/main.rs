use anyhow::Result;
use clap::Parser;
use marketplace_service::api::{self, AppState};
use marketplace_service::auth::TokenSigner;
use marketplace_service::config::{Args, Command, CreateAdminArgs};
use marketplace_service::identity::Identity;
use marketplace_service::uploads::UploadConfig;
use marketplace_service::{build_pool, run_migrations};
use tower_http::timeout::TimeoutLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    run_migrations(&args.database_url)?;
    let pool = build_pool(&args.database_url, args.db_pool_size).await?;
    let tokens = TokenSigner::new(args.jwt_secret());

    match args.command {
        Some(Command::CreateAdmin(ref admin)) => create_admin(pool, tokens, admin.clone()).await,
        Some(Command::Serve) | None => serve(&args, pool, tokens).await,
    }
}

async fn create_admin(pool: marketplace_service::DbPool, tokens: TokenSigner, admin: CreateAdminArgs) -> Result<()> {
    let registration = admin.into_request().validate()?;
    let account = Identity::new(pool, tokens).create_admin(registration).await?;
    info!("Admin {} <{}> is ready", account.username, account.email);
    Ok(())
}

async fn serve(args: &Args, pool: marketplace_service::DbPool, tokens: TokenSigner) -> Result<()> {
    let uploads = UploadConfig::new(&args.upload_dir);
    uploads.ensure_dir().await?;

    let app_state = AppState {
        pool,
        tokens,
        uploads,
    };
    let app = api::create_router(app_state).layer(TimeoutLayer::new(args.request_timeout()));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Marketplace service started on port {}", args.port);
    info!("Serving the API at http://0.0.0.0:{}/api", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Marketplace service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining requests");
}
