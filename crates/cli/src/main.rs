//! MediRAG command-line entry point
//!
//! Loads settings, builds the corpus snapshots and answers queries. Queries
//! come from the command line or, when none is given, one per stdin line.
//! Each result is printed as a JSON line.
//!
//! ```text
//! MEDIRAG_ENV=production medirag "머리가 아파요"
//! ```

mod providers;

use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use medirag_agent::{CancellationToken, RagOrchestrator, RecommendationRequest};
use medirag_config::{load_settings, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("MEDIRAG_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Settings::default()
        },
    };

    init_tracing(&settings);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?settings.environment,
        "Starting medirag"
    );

    if settings.observability.metrics_enabled {
        init_metrics(settings.observability.metrics_port)?;
    }

    let orchestrator = providers::orchestrator(&settings)
        .await
        .context("initializing pipeline")?;

    let session_id = std::env::var("MEDIRAG_SESSION").ok();
    let args: Vec<String> = std::env::args().skip(1).collect();

    if !args.is_empty() {
        let request = request(&settings, args.join(" "), session_id);
        answer(&orchestrator, request).await?;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = request(&settings, line, session_id.clone());
        answer(&orchestrator, request).await?;
    }

    Ok(())
}

fn request(settings: &Settings, query: String, session_id: Option<String>) -> RecommendationRequest {
    let request = RecommendationRequest::new(query).with_top_k(settings.rag.default_top_k);
    match session_id {
        Some(id) => request.with_session(id),
        None => request,
    }
}

/// Run one request, cancelling it on Ctrl+C
async fn answer(orchestrator: &RagOrchestrator, request: RecommendationRequest) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, cancelling request");
            trigger.cancel();
        }
    });

    let result = orchestrator.recommend_with_cancel(request, cancel).await;
    ctrl_c.abort();

    match result {
        Ok(result) => println!("{}", serde_json::to_string(&result)?),
        Err(e @ medirag_core::Error::Validation(_)) => {
            println!("{}", serde_json::json!({ "error": e.to_string(), "kind": e.kind() }));
        },
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!("medirag={},medirag_rag={},medirag_agent={},medirag_llm={}", level, level, level, level)
            .into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };
    subscriber.with(fmt_layer).init();
}

fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing Prometheus exporter")?;
    tracing::info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}
