use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;

use warden::clock::SystemClock;
use warden::config::{Config, StoreBackend};
use warden::db_migrate::MigrationTool;
use warden::error::{AppError, TraceErr};
use warden::ids::TokenIds;
use warden::password::Argon2Hasher;
use warden::server::handlers;
use warden::state::StateManager;
use warden::{AccessService, IdentityStore, MemoryStore, ScyllaStore, SessionStore};

async fn open_store(config: &Config) -> Result<Arc<dyn IdentityStore>, AppError> {
    match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Scylla => {
            let store = ScyllaStore::connect(&config.scylla_nodes, config.scylla_credentials.clone(), &config.keyspace)
                .await
                .trace_err("connect to scylla")?;
            let migrator = MigrationTool::new(config.keyspace.clone(), config.schema_path.clone());
            migrator.ensure_keyspace(store.session(), config.replication_factor).await?;
            let target = match config.schema_version {
                Some(v) => v,
                None => migrator.latest_version()?,
            };
            migrator
                .migrate_to_version(store.session(), target)
                .await
                .trace_err("schema migration")?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();
    tracing::info!("Starting warden");

    let config = Config::from_env()?;
    let store = open_store(&config).await?;

    let service = AccessService::new(
        store,
        Arc::new(Argon2Hasher::default()),
        Arc::new(TokenIds::default()),
        Arc::new(SystemClock),
    )
    .with_email_validation(config.require_email_validation);

    let seeded = service.bootstrap().await?;
    if seeded > 0 {
        tracing::info!("Seeded {} default permissions into an empty catalogue", seeded);
    }
    if let Some(admin) = &config.bootstrap_admin {
        match service.get_user_by_email(&admin.email).await {
            Ok(existing) => {
                // Catalogue may have grown since the admin was created.
                service.grant_all_permissions(existing.id).await?;
            }
            Err(e) if e.is_not_found() => {
                service.create_default_admin(&admin.email, &admin.password, &admin.name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let sessions = SessionStore::with_defaults();
    sessions.spawn_sweeper(config.sweep_interval);

    let state_manager = Arc::new(StateManager::new(service, sessions.clone()));
    let state_data = web::Data::new(state_manager);

    tracing::info!("Starting HTTP server on {}", config.bind_address);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .wrap(Logger::default())
            .configure(handlers::configure)
    })
    .bind(&config.bind_address)?
    .run();

    // Runs until SIGINT/SIGTERM.
    server.await?;

    sessions.shutdown().await;
    tracing::info!("warden stopped");
    Ok(())
}
