//! Mock inference backend for testing switchboard
//!
//! Accepts the command line shape of llama.cpp style servers:
//! `mock-backend --port 8080 --model /models/qwen.gguf`
//!
//! Serves `/health` and `/v1/models`, the endpoints the orchestrator probes. `/v1/models`
//! reports the model it was launched with, so tests can tell which model is loaded.
//! Failure modes (`--unhealthy`, `--exit-code`) exercise the readiness handling.

use axum::{
    Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get,
};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock OpenAI-style inference backend for testing")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Model to serve, usually a path injected by the orchestrator
    #[arg(short, long, default_value = "mock-model")]
    model: String,

    /// Answer every request with 503
    #[arg(long)]
    unhealthy: bool,

    /// Exit with this code right after the startup delay instead of serving
    #[arg(long)]
    exit_code: Option<i32>,

    /// Artificial startup delay (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,
}

/// Server state
#[derive(Debug)]
struct MockState {
    model: String,
    unhealthy: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mock_backend=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.startup_delay_ms > 0 {
        info!(delay_ms = args.startup_delay_ms, "Simulating startup delay");
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    if let Some(code) = args.exit_code {
        warn!(code, "Exiting before serving");
        std::process::exit(code);
    }

    let state = Arc::new(MockState {
        model: args.model.clone(),
        unhealthy: args.unhealthy,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .with_state(state);

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let actual_port = listener.local_addr()?.port();

    info!(
        model = %args.model,
        port = actual_port,
        unhealthy = args.unhealthy,
        "Mock backend listening"
    );

    // Test harness readiness marker
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<MockState>>) -> StatusCode {
    if state.unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// OpenAI-style model list naming the launched model
async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.unhealthy {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    Json(json!({
        "object": "list",
        "data": [{ "id": state.model, "object": "model", "owned_by": "mock-backend" }],
    }))
    .into_response()
}
