use anyhow::{Context, Result};
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tracing_subscriber::EnvFilter;

mod config;
mod connectors;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, Command};
use connectors::{
    classifier::OpenAiClassifier,
    drive::DriveConnectorFactory,
    ocr::{TextExtractor, VisionOcr},
    pdf::PdftoppmRasterizer,
};
use handlers::admin_auth::AdminAuth;
use models::{installation::NewInstallation, pattern::BucketPattern};
use services::{
    installation_store::InstallationStore,
    intake_service::{Collaborators, IntakeService, PipelineSettings},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::debug!(?command, "starting dropfolder with config: {:?}", redacted(&cfg));

    // --- Ensure scratch directory exists ---
    if !cfg.scratch_dir.exists() {
        fs::create_dir_all(&cfg.scratch_dir)?;
        tracing::info!("Created scratch directory at {}", cfg.scratch_dir.display());
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let connect_url = if db_url.contains('?') {
        db_url.clone()
    } else {
        format!("{db_url}?mode=rwc")
    };

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&connect_url)
            .await
            .with_context(|| format!("connecting to {db_url}"))?,
    );
    let store = InstallationStore::new(db);

    // --- Handle migration mode ---
    if command == Command::Migrate {
        store.migrate().await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let service = build_service(&cfg, store)?;

    match command {
        Command::Serve => serve(&cfg, service).await,
        Command::Migrate => Ok(()),
        Command::Maintain { installation } => {
            match installation {
                Some(id) => print_json(&service.maintain(id, Utc::now()).await?),
                None => print_json(&service.run_maintenance(Utc::now()).await?),
            }
        }
        Command::CreateInstallation {
            creator,
            root_folder_id,
            credentials,
        } => print_json(
            &service
                .create_installation(NewInstallation {
                    creator,
                    root_folder_id,
                    credentials,
                })
                .await?,
        ),
        Command::ListInstallations { all } => print_json(&service.store.list(all).await?),
        Command::MarkForTermination { installation } => {
            print_json(&service.mark_for_termination(installation).await?)
        }
        Command::CreateBucket {
            installation,
            name,
            action,
            rename_existing,
        } => {
            let action = action.parse()?;
            print_json(
                &service
                    .create_bucket(installation, &name, action, rename_existing)
                    .await?,
            )
        }
        Command::ListBuckets { installation } => {
            print_json(&service.list_buckets(installation).await?)
        }
        Command::ApplyPattern { installation, file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("reading pattern file {}", file.display()))?;
            let pattern = BucketPattern::from_json(&raw)?;
            print_json(&service.apply_pattern(installation, &pattern).await?)
        }
        Command::Teardown { installation } => print_json(&service.teardown(installation).await?),
    }
}

/// Wire the production collaborators into an `IntakeService`.
fn build_service(cfg: &AppConfig, store: InstallationStore) -> Result<IntakeService> {
    let http = reqwest::Client::builder()
        .timeout(cfg.call_timeout)
        .build()
        .context("building HTTP client")?;

    let text_extractor: Option<Arc<dyn TextExtractor>> = match &cfg.vision_api_key {
        Some(key) => Some(Arc::new(VisionOcr::new(
            http.clone(),
            &cfg.vision_endpoint,
            key,
        ))),
        None => {
            tracing::warn!("DROPFOLDER_VISION_API_KEY not set; documents are classified without OCR text");
            None
        }
    };
    let openai_key = cfg.openai_api_key.clone().unwrap_or_else(|| {
        tracing::warn!("DROPFOLDER_OPENAI_API_KEY not set; classification calls will be rejected");
        String::new()
    });

    let collaborators = Collaborators {
        text_extractor,
        classifier: Arc::new(OpenAiClassifier::new(
            http.clone(),
            &cfg.openai_base,
            openai_key,
            &cfg.openai_model,
        )),
        rasterizer: Arc::new(PdftoppmRasterizer::new(&cfg.pdftoppm, cfg.pdf_dpi)),
    };
    let settings = PipelineSettings {
        webhook_url: cfg.webhook_url.clone(),
        refresh_interval: cfg.refresh_interval_delta()?,
        call_timeout: cfg.call_timeout,
        maintenance_concurrency: cfg.maintenance_concurrency,
        scratch_dir: cfg.scratch_dir.clone(),
    };

    Ok(IntakeService::new(
        store,
        Arc::new(DriveConnectorFactory::new(http, &cfg.drive_api_base)),
        collaborators,
        settings,
    ))
}

async fn serve(cfg: &AppConfig, service: IntakeService) -> Result<()> {
    // --- Maintenance scheduler ---
    let scheduler = service.clone();
    let period = cfg.maintenance_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match scheduler.run_maintenance(Utc::now()).await {
                Ok(reports) => {
                    let failed = reports.iter().filter(|r| r.error.is_some()).count();
                    tracing::info!(installations = reports.len(), failed, "maintenance batch finished");
                }
                Err(err) => tracing::error!("maintenance batch could not start: {}", err),
            }
        }
    });

    // --- Build router ---
    let admin = AdminAuth::new(cfg.admin_api_key.clone());
    if !admin.is_enabled() {
        tracing::warn!("DROPFOLDER_ADMIN_API_KEY not set; /installations endpoints will reject every request");
    }
    let app: Router = routes::routes::routes(admin).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!(webhook_url = %cfg.webhook_url, "Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Config for logging with API keys masked.
fn redacted(cfg: &AppConfig) -> AppConfig {
    let mask = |key: &Option<String>| key.as_ref().map(|_| "***".to_string());
    AppConfig {
        vision_api_key: mask(&cfg.vision_api_key),
        openai_api_key: mask(&cfg.openai_api_key),
        admin_api_key: mask(&cfg.admin_api_key),
        ..cfg.clone()
    }
}
