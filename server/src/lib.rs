#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod reaper;
pub mod secret;
pub mod source;
mod storage;


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::Extension, http::Uri, Router};
use sea_orm::{query::Statement, ConnectionTrait, Database, DatabaseConnection};
use tokio::sync::OnceCell;
use tokio::time;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use database::migration::{Migrator, MigratorTrait};
use error::{ErrorKind, ServerError, ServerResult};
use export::{ExportService, NoopUserContributionsCache};
use ferry::relation::DefaultRelationRegistry;
use pipeline::Pipeline;
use source::ConfiguredConnector;
use storage::{LocalBackend, StorageBackend};

type State = Arc<StateInner>;

/// Global server state.
#[derive(Debug)]
pub struct StateInner {
    /// The Ferry Server configuration.
    config: Config,

    /// Handle to the database.
    database: OnceCell<DatabaseConnection>,

    /// Handle to the storage backend.
    storage: OnceCell<Arc<Box<dyn StorageBackend>>>,
}

impl StateInner {
    async fn new(config: Config) -> State {
        Arc::new(Self {
            config,
            database: OnceCell::new(),
            storage: OnceCell::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_handles(
        config: Config,
        database: DatabaseConnection,
        storage: Arc<Box<dyn StorageBackend>>,
    ) -> State {
        Arc::new(Self {
            config,
            database: OnceCell::new_with(Some(database)),
            storage: OnceCell::new_with(Some(storage)),
        })
    }

    /// Returns a handle to the database.
    async fn database(&self) -> ServerResult<&DatabaseConnection> {
        self.database
            .get_or_try_init(|| async {
                Database::connect(&self.config.database.url)
                    .await
                    .map_err(ServerError::database_error)
            })
            .await
    }

    /// Returns a handle to the storage backend.
    async fn storage(&self) -> ServerResult<&Arc<Box<dyn StorageBackend>>> {
        self.storage
            .get_or_try_init(|| async {
                let local = LocalBackend::new(self.config.storage.clone()).await?;
                let boxed: Box<dyn StorageBackend> = Box::new(local);
                Ok(Arc::new(boxed))
            })
            .await
    }

    /// Returns the export lifecycle service.
    async fn export_service(&self) -> ServerResult<ExportService> {
        Ok(ExportService::new(
            self.database().await?.clone(),
            self.storage().await?.clone(),
            Arc::new(DefaultRelationRegistry),
            Arc::new(NoopUserContributionsCache),
            self.config.export.batch_size,
        ))
    }

    /// Returns the destination-side pipeline.
    async fn pipeline(&self) -> ServerResult<Pipeline> {
        let database = self.database().await?.clone();
        let connector =
            ConfiguredConnector::new(database.clone(), self.config.encryption_key.clone());

        Ok(Pipeline::new(
            database,
            Arc::new(connector),
            self.config.pipeline.clone(),
        ))
    }

    /// Sends periodic heartbeat queries to the database.
    async fn run_db_heartbeat(&self) -> ServerResult<()> {
        let db = self.database().await?;
        let stmt =
            Statement::from_string(db.get_database_backend(), "SELECT 'heartbeat';".to_string());

        loop {
            let _ = db.execute(stmt.clone()).await;
            time::sleep(Duration::from_secs(60)).await;
        }
    }
}

/// The fallback route.
#[axum_macros::debug_handler]
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ErrorKind::NotFound.into())
}

/// Builds the API router with its middlewares.
fn router(state: State) -> Router {
    Router::new()
        .merge(api::get_router())
        .fallback(fallback)
        // middlewares
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
}

/// Runs the API server.
pub async fn run_api_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    eprintln!("Starting API server...");

    let state = StateInner::new(config).await;

    let listen = if let Some(cli_listen) = cli_listen {
        cli_listen
    } else {
        state.config.listen.to_owned()
    };

    let rest = router(state.clone());

    eprintln!("Listening on {:?}...", listen);

    let (server_ret, _) = tokio::join!(
        axum::Server::bind(&listen).serve(rest.into_make_service()),
        async {
            if state.config.database.heartbeat {
                let _ = state.run_db_heartbeat().await;
            }
        },
    );

    server_ret?;

    Ok(())
}

/// Runs the pipeline workers.
pub async fn run_workers(config: Config) -> Result<()> {
    eprintln!("Starting pipeline workers...");

    let state = StateInner::new(config).await;
    let pipeline = Arc::new(state.pipeline().await?);

    pipeline.run_worker().await;

    Ok(())
}

/// Runs database migrations.
pub async fn run_migrations(config: Config) -> Result<()> {
    eprintln!("Running migrations...");

    let state = StateInner::new(config).await;
    let db = state.database().await?;
    Migrator::up(db, None).await?;

    Ok(())
}
