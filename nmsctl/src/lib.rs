//! # nmsctl: Network Monitoring Control Plane
//!
//! `nmsctl` discovers reachable devices on IP ranges, checks which of a set of candidate
//! credentials log in to each of them, provisions the successful ones as monitors, and polls
//! every monitor's metric groups on independently configurable intervals.
//!
//! ## Architecture
//!
//! The HTTP layer is built on [Axum](https://github.com/tokio-rs/axum) and all state is persisted
//! in PostgreSQL. Everything that touches a device (logins, metric collection) is delegated to an
//! external plugin executable that speaks JSON over its argument list and stdout.
//!
//! ### Core Components
//!
//! The **plugin gateway** ([`plugin`]) spawns the plugin for one request, enforces a deadline
//! derived from the request's size, and reports every failure as a value.
//!
//! The **monitor cache** ([`cache`]) holds two concurrent maps keyed by metric group id: the
//! configured interval of every enabled group, and the live countdown until it is next due.
//! Provisioning handlers write to it and the scheduler ticks it.
//!
//! The **scheduler** ([`scheduler`]) wakes on a fixed interval, collects every group whose
//! countdown ran out, polls them with one plugin call, and stores the results in one insert.
//!
//! The **discovery pipeline** ([`discovery`]) expands an address spec, pings the addresses,
//! checks the target port on each survivor concurrently, asks the plugin which credential works
//! for each open address, and records a result per address.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use nmsctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = nmsctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     nmsctl::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod discovery;
pub mod errors;
pub mod plugin;
pub mod scheduler;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use axum::{
    Router,
    routing::{get, patch, post},
};
use bon::Builder;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, instrument};

pub use cache::MonitorCache;
pub use config::Config;
use discovery::{DiscoveryPipeline, FpingProber, NetworkProber, PgDiscoveryStore, RunRegistry};
use plugin::{PluginGateway, SubprocessPlugin};
use scheduler::{PgPollingResultSink, PollingScheduler};

/// Shared state handed to every handler.
///
/// ```ignore
/// let state = AppState::builder()
///     .db(pool)
///     .config(config)
///     .cache(cache)
///     .discovery(pipeline)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub cache: Arc<MonitorCache>,
    pub discovery: Arc<DiscoveryPipeline>,
}

/// Get the nmsctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect to the configured database and bring its schema up to date.
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let settings = &config.database.pool;
    let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .idle_timeout(optional(settings.idle_timeout_secs))
        .max_lifetime(optional(settings.max_lifetime_secs))
        .connect(&config.database.url)
        .await?;

    migrator().run(&pool).await?;
    Ok(pool)
}

/// Build the router with every API route and the tracing middleware.
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> Router {
    use api::handlers::{credentials, discoveries, polling_results, provisions};

    let api_routes = Router::new()
        // Credentials
        .route(
            "/credentials",
            get(credentials::list_credentials).post(credentials::create_credential),
        )
        .route(
            "/credentials/{id}",
            get(credentials::get_credential)
                .patch(credentials::update_credential)
                .delete(credentials::delete_credential),
        )
        // Discoveries
        .route(
            "/discoveries",
            get(discoveries::list_discoveries).post(discoveries::create_discovery),
        )
        .route(
            "/discoveries/{id}",
            get(discoveries::get_discovery)
                .patch(discoveries::update_discovery)
                .delete(discoveries::delete_discovery),
        )
        .route("/discoveries/{id}/run", post(discoveries::run_discovery))
        .route("/discoveries/{id}/results", get(discoveries::list_discovery_results))
        // Provisions
        .route(
            "/provisions",
            get(provisions::list_provisions).post(provisions::create_provision),
        )
        .route(
            "/provisions/{id}",
            get(provisions::get_provision).delete(provisions::delete_provision),
        )
        .route("/provisions/{id}/metric-groups", patch(provisions::update_metric_groups))
        // Polling results
        .route("/polling-results", get(polling_results::list_polling_results))
        .with_state(state);

    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/api/v1", api_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Background tasks that run alongside the HTTP server.
///
/// Dropping this cancels the shutdown token through `drop_guard`, which stops the scheduler.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Warm the monitor cache and start the polling scheduler.
///
/// The cache is fully populated before the scheduler's first tick; a failure to load it is fatal.
async fn setup_background_services(
    pool: PgPool,
    config: &Config,
    cache: Arc<MonitorCache>,
    plugin: Arc<dyn PluginGateway>,
    shutdown_token: CancellationToken,
) -> anyhow::Result<BackgroundServices> {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    cache
        .populate(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to populate monitor cache: {}", e))?;

    if config.scheduler.enabled {
        let scheduler = PollingScheduler::new(
            cache,
            plugin,
            Arc::new(PgPollingResultSink::new(pool)),
            config.plugin.clone(),
            config.scheduler.checking_interval_secs,
        );
        let scheduler_shutdown = shutdown_token.clone();
        background_tasks.push(tokio::spawn(scheduler.run(scheduler_shutdown)));
    } else {
        info!("Polling scheduler disabled");
    }

    Ok(BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    })
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] connects to the database, runs migrations, warms the
///    monitor cache and starts the scheduler
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal is received, stops the scheduler and closes the pool
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting network monitoring control plane with configuration: {:#?}", config);
        let pool = setup_database(&config).await?;

        let plugin: Arc<dyn PluginGateway> = Arc::new(SubprocessPlugin::new(config.plugin.clone()));
        let prober: Arc<dyn NetworkProber> = Arc::new(FpingProber::new(
            config.discovery.ping_command.clone(),
            config.discovery.port_connect_timeout,
        ));

        Self::with_collaborators(config, pool, plugin, prober).await
    }

    /// Assemble the application around an existing pool and the given device-facing
    /// collaborators. The pool must already be migrated.
    pub async fn with_collaborators(
        config: Config,
        pool: PgPool,
        plugin: Arc<dyn PluginGateway>,
        prober: Arc<dyn NetworkProber>,
    ) -> anyhow::Result<Self> {
        let cache = Arc::new(MonitorCache::new());
        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(pool.clone(), &config, cache.clone(), plugin.clone(), shutdown_token).await?;

        let discovery = Arc::new(DiscoveryPipeline::new(
            Arc::new(PgDiscoveryStore::new(pool.clone())),
            prober,
            plugin,
            config.plugin.clone(),
            config.discovery.max_ip_count,
            RunRegistry::new(),
        ));

        let app_state = AppState::builder()
            .db(pool.clone())
            .config(config.clone())
            .cache(cache)
            .discovery(discovery)
            .build();
        let router = build_router(app_state.clone());

        Ok(Self {
            router,
            app_state,
            config,
            pool,
            bg_services,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.app_state
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "nmsctl listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Shutdown background services and wait for tasks to complete
        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::db::handlers::{Credentials, Monitors, Repository};
    use crate::db::models::credentials::CredentialCreateDBRequest;
    use crate::test_utils::{StaticPlugin, StaticProber, create_test_config};
    use crate::types::MetricType;
    use std::sync::Arc;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_healthz(pool: PgPool) {
        let (server, _bg) = crate::test_utils::create_test_server(pool).await;
        let response = server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }

    /// Monitors that exist before startup are scheduled without any API call.
    #[sqlx::test]
    async fn test_startup_warms_cache(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let credential = Credentials::new(&mut conn)
            .create(&CredentialCreateDBRequest {
                name: "lab".to_string(),
                username: "root".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();
        let monitor_id: i32 = sqlx::query_scalar("INSERT INTO monitors (ip, port, credential_id) VALUES ('192.0.2.20', 22, $1) RETURNING id")
            .bind(credential.id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO metric_groups (monitor_id, name, polling_interval, is_enabled) VALUES ($1, 'UPTIME', 120, true), ($1, 'DISK', 60, false)")
            .bind(monitor_id)
            .execute(&mut *conn)
            .await
            .unwrap();
        let monitor = Monitors::new(&mut conn).get(monitor_id).await.unwrap().unwrap();
        drop(conn);

        let app = super::Application::with_collaborators(
            create_test_config(),
            pool,
            Arc::new(StaticPlugin::default()),
            Arc::new(StaticProber::default()),
        )
        .await
        .unwrap();

        let cache = &app.state().cache;
        assert_eq!(cache.len(), 1);
        let uptime = monitor.metric_groups.iter().find(|g| g.name == MetricType::Uptime).unwrap();
        assert_eq!(cache.countdown(uptime.id), Some(120));
    }
}
