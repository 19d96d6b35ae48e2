pub mod api;
mod bus_cache;
mod capacity;
mod config;
mod db;
mod feature_store;
mod forecast;
mod metro_cache;
mod model;
mod scheduler;
mod topology;
mod weather;

use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::sync::RwLock;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use api::AppState;
use bus_cache::BusCacheService;
use capacity::CapacityStore;
use config::Config;
use db::Store;
use feature_store::FeatureStore;
use metro_cache::MetroCacheService;
use model::Model;
use scheduler::Scheduler;
use topology::Topology;
use weather::WeatherClient;

const TZ: chrono_tz::Tz = chrono_tz::Europe::Istanbul;

#[derive(OpenApi)]
#[openapi(
    info(title = "Istanbul Crowding Forecast API", version = "0.1.0"),
    paths(
        api::health::health_check,
        api::forecast::get_forecast,
        api::lines::get_line,
        api::lines::search_lines,
        api::lines::get_schedule,
        api::metro::get_schedule,
        api::metro::get_duration,
        api::reports::create_report,
        api::reports::list_reports,
        api::admin::list_jobs,
        api::admin::get_stats,
        api::admin::feature_store_stats,
        api::admin::feature_store_reset_stats,
        api::admin::pause_scheduler,
        api::admin::resume_scheduler,
        api::admin::scheduler_status,
        api::admin::trigger_cleanup,
        api::admin::trigger_forecast,
        api::admin::reset_stuck_jobs,
        api::admin::delete_forecasts_for_date,
        api::admin::forecast_coverage,
    ),
    components(schemas(
        api::ErrorResponse,
        api::health::HealthResponse,
        api::forecast::HourlyForecast,
        api::lines::LineResponse,
        api::lines::ScheduleResponse,
        crate::capacity::CapacityMeta,
        crate::capacity::Confidence,
        crate::scheduler::JobStatus,
        api::metro::MetroScheduleRequest,
        api::metro::MetroScheduleResponse,
        api::metro::MetroDurationResponse,
        api::reports::CreateReportRequest,
        api::admin::AdminStats,
        api::admin::CleanupTriggerRequest,
        api::admin::TriggerForecastRequest,
        api::admin::CoverageDay,
        crate::db::models::TransportLineRow,
        crate::db::models::DailyForecastRow,
        crate::db::models::JobExecutionRow,
        crate::db::models::UserReportRow,
        crate::feature_store::types::FallbackStats,
    )),
    tags(
        (name = "health", description = "Service health check"),
        (name = "forecast", description = "Hourly crowding forecasts"),
        (name = "lines", description = "Transport line metadata and bus schedules"),
        (name = "metro", description = "Rail schedule and duration lookups"),
        (name = "reports", description = "User-submitted data quality reports"),
        (name = "admin", description = "Operational and scheduler controls")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    let config = Arc::new(Config::load("config.yaml").expect("Failed to load config"));
    tracing::info!(database_url = %config.database_url, "loaded configuration");

    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: permissive mode explicitly enabled (all origins allowed) - do not use in production");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: restricting to configured origins");
        let origins: Vec<_> = config.cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::OPTIONS, axum::http::Method::DELETE])
            .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION])
    } else {
        panic!("CORS configuration error: either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    let store = Store::connect(&config.database_url).await.expect("Failed to connect to SQLite database");
    store.migrate().await.expect("Failed to run migrations");
    tracing::info!("database migrations complete");

    let reset = store.sweep_stuck_jobs().await.expect("Failed to sweep stuck jobs");
    if reset > 0 {
        tracing::warn!(reset, "reset jobs stuck in RUNNING state from a previous crash");
    }

    if let Some(path) = config.paths.transport_lines_csv.clone() {
        let lines = load_transport_lines(&path);
        store.seed_lines_if_empty(&lines).await.expect("Failed to seed transport_lines");
    }

    let feature_store = {
        let paths = config.paths.clone();
        tokio::task::spawn_blocking(move || FeatureStore::load(&paths.historical_features_csv, &paths.calendar_csv, 3))
            .await
            .expect("feature store load task panicked")
            .expect("Failed to load feature store")
    };
    tracing::info!(lines = feature_store.line_count(), "loaded feature store");

    let model = {
        let path = config.paths.model_artifact_json.clone();
        tokio::task::spawn_blocking(move || Model::load(&path))
            .await
            .expect("model load task panicked")
            .expect("Failed to load model artifact")
    };

    let topology = {
        let path = config.paths.topology_json.clone();
        tokio::task::spawn_blocking(move || Topology::load(&path))
            .await
            .expect("topology load task panicked")
            .expect("Failed to load topology")
    };
    tracing::info!(lines = topology.line_codes().count(), "loaded topology");

    let capacity_store = {
        let capacity_meta = config.paths.capacity_meta_csv.clone();
        let rail_capacity = config.paths.rail_capacity_yaml.clone();
        tokio::task::spawn_blocking(move || CapacityStore::load(capacity_meta.as_deref(), rail_capacity.as_deref(), 250))
            .await
            .expect("capacity store load task panicked")
            .expect("Failed to load capacity store")
    };

    let feature_store = Arc::new(feature_store);
    let model = Arc::new(model);
    let topology = Arc::new(topology);
    let capacity_store = Arc::new(capacity_store);

    let bus_cache = Arc::new(BusCacheService::new(config.bus_upstream.clone(), store.clone(), TZ).expect("Failed to build bus cache service"));
    let metro_cache = Arc::new(MetroCacheService::new(config.metro_upstream.clone(), store.clone()).expect("Failed to build metro cache service"));
    let scheduler = Arc::new(Scheduler::new(TZ).await.expect("Failed to build scheduler"));

    let app_state = AppState {
        store: store.clone(),
        feature_store: Arc::new(RwLock::new(feature_store.clone())),
        model: Arc::new(RwLock::new(model.clone())),
        topology: Arc::new(RwLock::new(topology.clone())),
        capacity_store: Arc::new(RwLock::new(capacity_store.clone())),
        bus_cache: bus_cache.clone(),
        metro_cache: metro_cache.clone(),
        scheduler: scheduler.clone(),
        config: config.clone(),
    };

    register_jobs(&app_state, config.clone()).await.expect("Failed to register scheduled jobs");
    scheduler.start().await.expect("Failed to start scheduler");

    let app = Router::new()
        .route("/", get(root))
        .nest("/api", api::router())
        .with_state(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.expect("Failed to bind to port 3000");

    tracing::info!("server running on http://localhost:3000");
    tracing::info!("swagger UI: http://localhost:3000/swagger-ui");

    axum::serve(listener, app).await.expect("Failed to start server");
}

/// Wires the five nightly jobs onto the Clock & Scheduler. Each closure
/// builds a fresh `ForecastEngine`/cache-service snapshot from the current
/// `Arc` held in `AppState` rather than capturing one at startup, so a
/// hot-reloaded feature store or model takes effect on the following
/// firing without a restart.
async fn register_jobs(state: &AppState, config: Arc<Config>) -> Result<(), scheduler::Error> {
    let scheduler = state.scheduler.clone();

    {
        let bus_cache = state.bus_cache.clone();
        let retention_days = config.retention.schedule_cache_days;
        let scheduler_for_retry = scheduler.clone();
        let retry_cron = config.schedule.retry_cron.clone();
        scheduler
            .add_cron("bus_schedule_prefetch", &config.schedule.bus_prefetch_cron, move || {
                let bus_cache = bus_cache.clone();
                let scheduler_for_retry = scheduler_for_retry.clone();
                let retry_cron = retry_cron.clone();
                async move {
                    let today = bus_cache::today_in(TZ);
                    let result = bus_cache.prefetch_all(today, false, None, retention_days).await;
                    match &result {
                        Ok(summary) => tracing::info!(?summary, "bus prefetch complete"),
                        Err(err) => tracing::error!(error = %err, "bus prefetch failed"),
                    }
                    if bus_cache.pending_count() > 0 {
                        if let Err(err) = install_bus_retry_job(scheduler_for_retry, retry_cron, bus_cache).await {
                            tracing::error!(error = %err, "failed to install bus_schedule_retry job");
                        }
                    }
                    result.map(|_| ()).map_err(|err| err.to_string())
                }
            })
            .await?;
    }

    {
        let metro_cache = state.metro_cache.clone();
        let topology = state.topology.clone();
        let retention_days = config.retention.schedule_cache_days;
        let scheduler_for_retry = scheduler.clone();
        let retry_cron = config.schedule.retry_cron.clone();
        scheduler
            .add_cron("metro_schedule_prefetch", &config.schedule.metro_prefetch_cron, move || {
                let metro_cache = metro_cache.clone();
                let topology = topology.clone();
                let scheduler_for_retry = scheduler_for_retry.clone();
                let retry_cron = retry_cron.clone();
                async move {
                    let snapshot = topology.read().await.clone();
                    let today = bus_cache::today_in(TZ);
                    let result = metro_cache.prefetch_all(&snapshot, today, false, retention_days).await;
                    match &result {
                        Ok(summary) => tracing::info!(?summary, "metro prefetch complete"),
                        Err(err) => tracing::error!(error = %err, "metro prefetch failed"),
                    }
                    if metro_cache.pending_count() > 0 {
                        if let Err(err) = install_metro_retry_job(scheduler_for_retry, retry_cron, metro_cache).await {
                            tracing::error!(error = %err, "failed to install metro_schedule_retry job");
                        }
                    }
                    result.map(|_| ()).map_err(|err| err.to_string())
                }
            })
            .await?;
    }

    {
        let store = state.store.clone();
        let feature_store = state.feature_store.clone();
        let model = state.model.clone();
        let weather_config = config.weather.clone();
        let horizon_days = config.schedule.forecast_horizon_days;
        scheduler
            .add_cron("daily_forecast", &config.schedule.forecast_cron, move || {
                let store = store.clone();
                let feature_store = feature_store.clone();
                let model = model.clone();
                let weather_config = weather_config.clone();
                async move {
                    let today = bus_cache::today_in(TZ);
                    run_daily_forecast(store, feature_store, model, weather_config, today, horizon_days).await
                }
            })
            .await?;
    }

    {
        let store = state.store.clone();
        let forecast_retention_days = config.retention.forecast_days;
        scheduler
            .add_cron("retention_cleanup", &config.schedule.cleanup_cron, move || {
                let store = store.clone();
                async move {
                    let today = bus_cache::today_in(TZ);
                    let cutoff = today - chrono::Duration::days(forecast_retention_days);
                    match store.cleanup_forecasts(cutoff).await {
                        Ok(deleted) => {
                            tracing::info!(deleted, "retention sweep complete");
                            Ok(())
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "retention sweep failed");
                            Err(err.to_string())
                        }
                    }
                }
            })
            .await?;
    }

    {
        let feature_store = state.feature_store.clone();
        scheduler
            .add_cron("quality_check", &config.schedule.quality_check_cron, move || {
                let feature_store = feature_store.clone();
                async move {
                    let snapshot = feature_store.read().await.clone();
                    let stats = snapshot.fallback_stats();
                    let (seasonal_pct, hour_pct, zero_pct) = stats.percentages();
                    tracing::info!(seasonal_pct, hour_pct, zero_pct, "nightly fallback-tier quality check");
                    Ok(())
                }
            })
            .await?;
    }

    Ok(())
}

/// Installed on `bus_schedule_prefetch` the first time a prefetch leaves
/// entries in the pending-retry map; fires every `cron_expr` until the map
/// drains, then removes itself.
async fn install_bus_retry_job(
    scheduler: Arc<Scheduler>,
    cron_expr: String,
    bus_cache: Arc<BusCacheService>,
) -> Result<(), scheduler::Error> {
    let scheduler_for_removal = scheduler.clone();
    scheduler
        .add_cron("bus_schedule_retry", &cron_expr, move || {
            let bus_cache = bus_cache.clone();
            let scheduler_for_removal = scheduler_for_removal.clone();
            async move {
                bus_cache.run_retry_pass().await;
                if bus_cache.pending_count() == 0 {
                    if let Err(err) = scheduler_for_removal.remove("bus_schedule_retry").await {
                        tracing::error!(error = %err, "failed to remove drained bus_schedule_retry job");
                    }
                }
                Ok(())
            }
        })
        .await
}

/// Metro counterpart to [`install_bus_retry_job`].
async fn install_metro_retry_job(
    scheduler: Arc<Scheduler>,
    cron_expr: String,
    metro_cache: Arc<MetroCacheService>,
) -> Result<(), scheduler::Error> {
    let scheduler_for_removal = scheduler.clone();
    scheduler
        .add_cron("metro_schedule_retry", &cron_expr, move || {
            let metro_cache = metro_cache.clone();
            let scheduler_for_removal = scheduler_for_removal.clone();
            async move {
                metro_cache.run_retry_pass().await;
                if metro_cache.pending_count() == 0 {
                    if let Err(err) = scheduler_for_removal.remove("metro_schedule_retry").await {
                        tracing::error!(error = %err, "failed to remove drained metro_schedule_retry job");
                    }
                }
                Ok(())
            }
        })
        .await
}

/// Shared by the nightly `daily_forecast` cron job and the
/// `/admin/scheduler/trigger/forecast` manual trigger.
async fn run_daily_forecast(
    store: Store,
    feature_store: Arc<RwLock<Arc<FeatureStore>>>,
    model: Arc<RwLock<Arc<Model>>>,
    weather_config: config::WeatherConfig,
    target_date: chrono::NaiveDate,
    horizon_days: i64,
) -> Result<(), String> {
    let feature_store_snapshot = feature_store.read().await.clone();
    let model_snapshot = model.read().await.clone();
    let weather = match WeatherClient::new(weather_config) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build weather client for forecast run");
            return Err(err.to_string());
        }
    };
    let engine = forecast::ForecastEngine::new(store, feature_store_snapshot, model_snapshot, weather);
    forecast::run_with_retry(&engine, target_date, horizon_days).await
}

fn load_transport_lines(path: &std::path::Path) -> Vec<(String, i64, Option<String>, Option<String>)> {
    #[derive(serde::Deserialize)]
    struct Row {
        line_name: String,
        transport_type_id: i64,
        road_type: Option<String>,
        line: Option<String>,
    }

    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not open transport_lines_csv, skipping seed");
            return Vec::new();
        }
    };

    reader
        .deserialize::<Row>()
        .filter_map(|row| row.ok())
        .map(|row| (row.line_name, row.transport_type_id, row.road_type, row.line))
        .collect()
}

async fn root() -> &'static str {
    "Istanbul Crowding Forecast API"
}
