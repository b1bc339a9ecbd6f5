// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use gantry::batch::TaskRegistry;
use gantry::logs::RequestLogStore;
use gantry::progress::RefreshProgressStore;
use gantry::proxy::{self, AppState};
use gantry::settings::SettingsStore;
use gantry::upstream::{Credential, ReqwestGrokClient, StaticTokenPool, Tier};

use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gantry", about = "OpenAI-compatible gateway for the Grok upstream")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 9360, env = "GANTRY_PORT")]
    port: u16,

    /// Path to the SQLite database file
    #[arg(long, default_value = "gantry.db", env = "GANTRY_DATABASE")]
    database: String,

    /// Upstream base URL
    #[arg(long, default_value = "https://grok.com", env = "GANTRY_UPSTREAM_URL")]
    upstream_url: String,

    /// Path to the credential file (JSON array)
    #[arg(long, default_value = "tokens.json", env = "GANTRY_TOKENS")]
    tokens: String,
}

/// On-disk credential entry.
#[derive(Deserialize)]
struct TokenFileEntry {
    key_name: String,
    cookie: String,
    #[serde(default)]
    super_tier: bool,
}

fn load_credentials(path: &str) -> Vec<Credential> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(path, error = %e, "no credential file, starting with an empty pool");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<TokenFileEntry>>(&contents) {
        Ok(entries) => entries
            .into_iter()
            .map(|entry| Credential {
                key_name: entry.key_name,
                cookie: entry.cookie,
                tier: if entry.super_tier {
                    Tier::Super
                } else {
                    Tier::Basic
                },
            })
            .collect(),
        Err(e) => {
            tracing::error!(path, error = %e, "credential file is not valid JSON");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let pool = match gantry::db::connect(&cli.database).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("failed to open database: {e}");
            std::process::exit(1);
        }
    };

    let settings = Arc::new(SettingsStore::new(pool.clone()));
    let bundle = match settings.load().await {
        Ok(bundle) => bundle,
        Err(e) => {
            tracing::error!("failed to load settings: {e}");
            std::process::exit(1);
        }
    };

    let credentials = load_credentials(&cli.tokens);
    tracing::info!(
        credentials = credentials.len(),
        upstream = %cli.upstream_url,
        "gantry starting"
    );

    let tokens = Arc::new(StaticTokenPool::new(
        credentials,
        bundle.token.super_models.clone(),
        bundle.token.basic_falls_back_to_super,
    ));

    let state = AppState {
        upstream: Arc::new(ReqwestGrokClient::new(cli.upstream_url)),
        tokens,
        settings,
        logs: Arc::new(RequestLogStore::new(pool.clone())),
        progress: Arc::new(RefreshProgressStore::new(pool)),
        tasks: Arc::new(TaskRegistry::new()),
    };

    let app = proxy::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "gantry listening");

    axum::serve(listener, app).await.expect("server error");
}
