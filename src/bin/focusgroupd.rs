//! HTTP daemon for focusgroup.
//!
//! Reads `OPENAI_API_KEY`, `OPENAI_MODEL`, `BRAVE_SEARCH_API_KEY`, `FOCUSGROUP_DATA_DIR` and
//! `PORT` from the environment, then serves the discussion API.

use focusgroup::server::serve;
use focusgroup::FocusGroupConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    focusgroup::init_logger();

    let config = FocusGroupConfig::from_env();
    log::info!(
        "focusgroupd starting with model {} (search: {})",
        config.model,
        if config.brave_api_key.is_some() { "brave" } else { "mock" }
    );
    serve(config).await
}
