//! CMT modem power control daemon (cmtd)
//!
//! Standalone service that:
//! - Sequences the modem baseband through its GPIO control lines
//! - Supervises the Phonet link and the MTC shutdown handshake
//! - Exposes a REST API and WebSocket event stream
//!
//! Default bind: 127.0.0.1:8871
//! WebSocket: /events
//! REST API: /api/v1/*

use anyhow::{Context, Result};
use cmtd::api::{self, ApiState};
use cmtd::config::DaemonConfig;
use cmtd::power::bus::LogObserver;
use cmtd::power::ModemPower;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured fields
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cmtd=debug")),
        )
        .init();

    info!("Starting CMT modem power control daemon (cmtd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::from_env();
    let bind_addr = config.bind.parse::<SocketAddr>()?;

    let power = ModemPower::probe(&config, Arc::new(LogObserver))
        .with_context(|| format!("modem probe on {} failed", config.interface))?;

    let state = Arc::new(ApiState { power, config });
    let app = api::create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("cmtd listening on http://{}", bind_addr);
    info!("WebSocket events: ws://{}/events", bind_addr);
    info!("Swagger UI: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
