//! Domain services: persistence, the installation lifecycle, change dedup
//! and classification, plus the `IntakeService` that wires them together
//! for the HTTP layer and the CLI.

use crate::connectors::{ProviderError, ProviderResult};
use std::{future::Future, time::Duration};

pub mod buckets;
pub mod dedup;
pub mod dispatcher;
pub mod installation_store;
pub mod intake_service;
pub mod lifecycle;
#[cfg(test)]
pub mod test_support;

/// Run a collaborator call with a deadline so one stuck request cannot stall
/// a maintenance pass or the rest of a folder listing.
pub async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!(
            "{what} exceeded {}s",
            limit.as_secs_f32()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out_stuck_calls() {
        let stuck = async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok::<_, ProviderError>(())
        };
        let result = bounded(Duration::from_secs(5), "listing inbox", stuck).await;
        assert!(matches!(result, Err(ProviderError::Timeout(msg)) if msg.contains("listing inbox")));
    }

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let result = bounded(Duration::from_secs(5), "noop", async { Ok::<_, ProviderError>(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
