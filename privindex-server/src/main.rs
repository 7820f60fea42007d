//! Standalone `privindex` binary
//!
//! Runs index sync and the maintenance commands against the configured
//! backend instances. Logging is configured from `LOG_*` variables.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = privindex_logging::init_subscriber();

    privindex_server::cli::run().await
}
