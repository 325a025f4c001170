//! # lnchat-server
//!
//! HTTP/JSON front end of the lnchat service.
//!
//! This binary:
//! - connects to a payment node (LND over REST, or an in-process simulated
//!   node for local development)
//! - runs the chat service, which follows the node's invoices and payments
//! - serves the NodeInfo, Contact, Discussion, Message, Payment and Channel
//!   APIs under `/v1/`, with optional Basic auth and TLS

mod api;
mod auth;
mod config;
mod error;
mod tls;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lnchat_node::{LnNode, LndConfig, LndNode, SimNetwork};
use lnchat_service::ChatService;

use crate::api::AppState;
use crate::auth::BasicAuth;
use crate::config::{Backend, ServerConfig};

fn connect_node(backend: &Backend) -> anyhow::Result<Arc<dyn LnNode>> {
    match backend {
        Backend::Lnd {
            rest_url,
            macaroon_path,
            tls_cert_path,
        } => {
            let node = LndNode::connect(&LndConfig {
                rest_url: rest_url.clone(),
                macaroon_path: macaroon_path.clone(),
                tls_cert_path: tls_cert_path.clone(),
            })
            .with_context(|| format!("cannot set up LND client for {rest_url}"))?;
            info!(url = %rest_url, "using LND backend");
            Ok(Arc::new(node))
        }
        Backend::Sim { alias } => {
            let node = SimNetwork::new().add_node(alias);
            info!(alias = %alias, address = %node.address(), "using simulated node");
            Ok(Arc::new(node))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,lnchat_server=debug,lnchat_service=debug")
            }),
        )
        .init();

    info!("Starting lnchat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env()?;
    info!(
        http_addr = %config.http_addr,
        db_path = %config.db_path.display(),
        tls = config.tls.is_some(),
        basic_auth = config.basic_auth.is_some(),
        "Loaded configuration"
    );

    // TLS is checked before anything starts so an expired certificate fails
    // fast.
    let tls = match &config.tls {
        Some(paths) => Some(tls::load(paths).await?),
        None => None,
    };

    // -----------------------------------------------------------------------
    // 3. Start the chat service
    // -----------------------------------------------------------------------
    let node = connect_node(&config.backend)?;
    let service = Arc::new(
        ChatService::start(node, &config.db_path)
            .await
            .context("cannot start chat service")?,
    );
    info!(address = %service.self_address(), "chat service running");

    // -----------------------------------------------------------------------
    // 4. Serve the API until Ctrl+C
    // -----------------------------------------------------------------------
    let app = api::build_router(
        AppState {
            service: service.clone(),
        },
        config.basic_auth.as_ref().map(BasicAuth::new),
    );
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    let served = api::serve(app, config.http_addr, tls, shutdown).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed");
    }

    service.cleanup().await;
    served
}
