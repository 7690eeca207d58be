use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use mailguard_db::{ImportStore, MemoryStore, SubscriberStore};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod cache;
mod config;
mod dns;
mod error;
mod handlers;
mod services;

use cache::{Cache, MemoryCache, RedisCache};
use config::ServiceConfig;
use dns::{DnsLookup, HickoryDns};
use services::bulk_import_service::BulkImportService;
use services::email_validation_service::EmailValidationService;
use services::file_security_service::FileSecurityService;
use services::file_upload_service::FileUploadService;
use services::import_integration_service::ImportIntegrationService;
use services::import_processor::ImportProcessor;
use services::reputation_service::ReputationService;
use services::subscriber_service::SubscriberService;

/// Multipart framing on top of the largest accepted file.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;
const IMPORT_QUEUE_DEPTH: usize = 256;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "mailguard-api")]
#[command(about = "Email deliverability, reputation and bulk import service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and import worker
    Serve,
    /// Check an IPv4 address against the DNSBL zones
    CheckIp { ip: String },
    /// Check a sending domain's reputation
    CheckDomain { domain: String },
    /// Run the full email validation pipeline
    ValidateEmail {
        email: String,
        #[arg(long)]
        sender_ip: Option<String>,
    },
    /// Remove expired upload, temp and quarantine files once
    Cleanup {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub cache: Cache,
    pub store_backend: &'static str,
    pub reputation: Arc<ReputationService>,
    pub validator: Arc<EmailValidationService>,
    pub security: Arc<FileSecurityService>,
    pub uploads: Arc<FileUploadService>,
    pub imports: Arc<BulkImportService>,
    pub subscribers: Arc<SubscriberService>,
}

pub struct Backends {
    pub imports: Arc<dyn ImportStore>,
    pub subscribers: Arc<dyn SubscriberStore>,
    pub store_backend: &'static str,
    pub cache: Cache,
    pub dns: Arc<dyn DnsLookup>,
}

impl AppState {
    /// Wire every service. The returned processor must be run against the receiver.
    fn new(config: ServiceConfig, backends: Backends) -> (Self, Arc<ImportProcessor>, mpsc::Receiver<Uuid>) {
        let Backends {
            imports,
            subscribers,
            store_backend,
            cache,
            dns,
        } = backends;

        let reputation = Arc::new(ReputationService::new(
            dns.clone(),
            cache.clone(),
            &config.reputation,
        ));
        let validator = Arc::new(EmailValidationService::new(
            dns,
            cache.clone(),
            reputation.clone(),
            Duration::from_secs(config.reputation.email_cache_ttl_secs),
        ));
        let security = Arc::new(FileSecurityService::new(&config.upload));
        let uploads = Arc::new(FileUploadService::new(&config.upload, security.clone()));

        let (tx, rx) = mpsc::channel(IMPORT_QUEUE_DEPTH);
        let bulk = Arc::new(BulkImportService::new(
            imports.clone(),
            subscribers.clone(),
            uploads.clone(),
            security.clone(),
            &config.upload,
            tx,
        ));
        let integration = Arc::new(ImportIntegrationService::new(
            subscribers.clone(),
            imports.clone(),
            config.import.batch_size,
        ));
        let processor = Arc::new(ImportProcessor::new(
            imports,
            subscribers.clone(),
            validator.clone(),
            integration,
            security.clone(),
            &config.import,
            config.upload.enable_malware_scanning,
        ));

        let state = Self {
            config: Arc::new(config),
            cache,
            store_backend,
            reputation,
            validator,
            security,
            uploads,
            imports: bulk,
            subscribers: Arc::new(SubscriberService::new(subscribers)),
        };
        (state, processor, rx)
    }
}

async fn connect_backends(config: &ServiceConfig) -> anyhow::Result<Backends> {
    let cache = match &config.redis_url {
        Some(url) => Cache::new(Arc::new(RedisCache::new(url).await?)),
        None => {
            tracing::warn!("REDIS_URL not set, using in-process cache");
            Cache::new(Arc::new(MemoryCache::new()))
        }
    };

    let (imports, subscribers, store_backend): (Arc<dyn ImportStore>, Arc<dyn SubscriberStore>, _) =
        match &config.database_url {
            Some(url) => {
                let pool = mailguard_db::connect(url).await?;
                tracing::info!("Connected to PostgreSQL");
                (
                    Arc::new(mailguard_db::repositories::ImportRepository::new(pool.clone())),
                    Arc::new(mailguard_db::repositories::SubscriberRepository::new(pool)),
                    "postgres",
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store (data is lost on restart)");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store, "memory")
            }
        };

    Ok(Backends {
        imports,
        subscribers,
        store_backend,
        cache,
        dns: Arc::new(HickoryDns::new()?),
    })
}

fn router(state: AppState) -> Router {
    let body_limit = state.config.upload.max_file_size as usize + BODY_LIMIT_SLACK;

    let api = Router::new()
        .route("/ip-reputation/{ip}", get(handlers::reputation::ip_reputation))
        .route("/domain-reputation/{domain}", get(handlers::reputation::domain_reputation))
        .route("/validate-email", post(handlers::reputation::validate_email))
        // Bulk import
        .route("/import/upload", post(handlers::import::upload))
        .route("/import/validate-csv", post(handlers::import::validate_csv))
        .route("/import/jobs", get(handlers::import::list_jobs))
        .route("/import/statistics", get(handlers::import::statistics))
        .route("/import/{job_id}", axum::routing::delete(handlers::import::cancel_job))
        .route("/import/{job_id}/status", get(handlers::import::job_status))
        .route("/import/{job_id}/details", get(handlers::import::job_details))
        .route("/import/{job_id}/results", get(handlers::import::job_results))
        .route("/import/{job_id}/retry", post(handlers::import::retry_job))
        .route("/import/check-duplicates", post(handlers::import::check_duplicates))
        // Uploads
        .route("/uploads/multiple", post(handlers::uploads::upload_multiple))
        .route("/uploads/validate", post(handlers::uploads::validate_file))
        .route("/uploads/cleanup", post(handlers::uploads::cleanup))
        .route("/uploads/stats", get(handlers::uploads::upload_stats))
        .route("/uploads/info/{job_id}/{file_name}", get(handlers::uploads::file_info))
        .route(
            "/uploads/{job_id}/{file_name}",
            axum::routing::delete(handlers::uploads::delete_file),
        )
        // Subscribers
        .route(
            "/subscribers",
            get(handlers::subscribers::list).post(handlers::subscribers::create),
        )
        .route("/subscribers/subscribe", post(handlers::subscribers::subscribe))
        .route("/subscribers/unsubscribe", post(handlers::subscribers::unsubscribe))
        .route(
            "/subscribers/{id}",
            get(handlers::subscribers::get).patch(handlers::subscribers::update),
        )
        .route("/webhooks/delivery", post(handlers::webhooks::delivery));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/email-marketing", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn run_cleanup(state: &AppState, max_age: Duration) {
    let report = state
        .security
        .automatic_sensitive_file_cleanup(None, max_age)
        .await;
    let uploads = state.uploads.cleanup_old_files(max_age).await;
    tracing::info!(
        "File cleanup: {} sensitive files ({} bytes), {} uploads removed",
        report.cleaned_files,
        report.total_size,
        uploads
    );
    for e in &report.errors {
        tracing::warn!("Cleanup error: {}", e);
    }
}

fn start_maintenance_loop(state: AppState) {
    tokio::spawn(async move {
        let max_age = Duration::from_secs(state.config.upload.auto_cleanup_hours * 3600);
        let retention_days = state.config.import.job_retention_days;
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tick.tick().await;
            run_cleanup(&state, max_age).await;
            match state.imports.cleanup_old_jobs(retention_days).await {
                Ok(n) if n > 0 => tracing::info!("Removed {} expired import jobs", n),
                Ok(_) => {}
                Err(e) => tracing::error!("Import job cleanup failed: {}", e),
            }
        }
    });
}

async fn run_server(state: AppState, processor: Arc<ImportProcessor>, queue: mpsc::Receiver<Uuid>) -> anyhow::Result<()> {
    state.security.init().await?;
    state.uploads.init().await?;

    tokio::spawn(processor.run(queue));
    start_maintenance_loop(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.listen_port));
    let app = router(state);
    tracing::info!("MailGuard API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = ServiceConfig::load()?;

    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender = tracing_appender::rolling::never(&config.log_dir, "mailguard.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailguard_api=debug,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    tracing::info!("MailGuard starting, version {}", env!("CARGO_PKG_VERSION"));

    let backends = connect_backends(&config).await?;
    let (state, processor, queue) = AppState::new(config, backends);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(state, processor, queue).await?,
        Commands::CheckIp { ip } => {
            let result = state.reputation.check_ip_reputation(&ip).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::CheckDomain { domain } => {
            let result = state.reputation.check_domain_reputation(&domain).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::ValidateEmail { email, sender_ip } => {
            let result = state.validator.validate_email(&email, sender_ip.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Cleanup { max_age_hours } => {
            let hours = max_age_hours.unwrap_or(state.config.upload.auto_cleanup_hours);
            run_cleanup(&state, Duration::from_secs(hours * 3600)).await;
        }
    }

    Ok(())
}
