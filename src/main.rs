mod config;
mod embedding;
mod error;
mod executor;
mod handlers;
mod host;
mod indexer;
mod llm;
mod mcp;
mod parser;
mod planner;
mod retrieval;
mod store;
#[cfg(test)]
mod testing;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use executor::tools::custom::CustomToolRegistry;
use executor::tools::ToolRegistry;
use handlers::tool_handlers::AgentHandlers;
use llm::Models;
use mcp::server::McpServer;
use retrieval::rerank::{HttpReranker, Reranker};
use store::ChunkStore;

/// Load the first .env found: the current directory (project config), then
/// `$XDG_CONFIG_HOME/code-agent-mcp/.env` (global default). Variables already
/// set in the environment win over both.
fn load_env_files() -> Option<PathBuf> {
    let candidates = [
        std::env::current_dir().ok().map(|p| p.join(".env")),
        get_xdg_config_dir().map(|dir| dir.join("code-agent-mcp").join(".env")),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|path| path.exists() && dotenv::from_path(path).is_ok())
}

/// Get XDG config directory, fallback to ~/.config
fn get_xdg_config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = load_env_files();

    // Logs go to stderr; stdout carries the JSON-RPC stream
    let env_filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("error"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match env_file {
        Some(path) => tracing::debug!("Loaded .env from: {}", path.display()),
        None => tracing::debug!("No .env file found, using environment variables only"),
    }
    tracing::info!("Starting code agent MCP server...");

    let config = Arc::new(Config::from_env()?);
    tracing::info!("Workspace: {}", config.workspace_root.display());

    let models = Models::from_config(&config)?;
    let reranker = config.rerank_url.as_deref().map(|url| {
        Arc::new(HttpReranker::new(
            url,
            config.rerank_api_key.clone(),
            &config.rerank_model,
        )) as Arc<dyn Reranker>
    });
    let store = Arc::new(ChunkStore::new(config.chunks_path()));
    let tools = Arc::new(ToolRegistry::load(&config.tools_path(), CustomToolRegistry::with_defaults()).await?);

    let handlers = AgentHandlers::new(config, models, store, reranker, tools);
    McpServer::new(handlers).start().await?;

    Ok(())
}
