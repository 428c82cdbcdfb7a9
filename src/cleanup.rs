use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::llm::LlmClient;

const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Expired cache entry and rate bucket cleanup loop. Wakes every hour.
pub async fn cleanup_loop(llm: Arc<LlmClient>, cancel: CancellationToken) {
    info!("cleanup job started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cleanup job shutting down");
                return;
            }
            _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
        }

        let purged = llm.purge_expired();
        if purged.cache_entries > 0 || purged.rate_buckets > 0 {
            info!(
                cache_entries = purged.cache_entries,
                rate_buckets = purged.rate_buckets,
                "purged expired LLM state"
            );
        } else {
            debug!("nothing to purge");
        }
    }
}
