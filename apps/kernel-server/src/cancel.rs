// [[AXON]]/apps/kernel-server/src/cancel.rs
// Purpose: Process-wide cancellation flags, checked between agent executions.
// Architecture: Shared Runtime State
// Dependencies: DashMap

use dashmap::DashSet;

/// Set of run IDs with a pending cancellation request.
///
/// Cancellation is cooperative: the engine checks membership between
/// agents and never interrupts an in-flight provider call. Requesting
/// cancel on an unknown or already-terminal run is a harmless no-op; the
/// flag is discarded when the run finishes.
#[derive(Default)]
pub struct CancellationRegistry {
    requested: DashSet<String>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, run_id: &str) {
        self.requested.insert(run_id.to_string());
    }

    pub fn is_requested(&self, run_id: &str) -> bool {
        self.requested.contains(run_id)
    }

    pub fn clear(&self, run_id: &str) {
        self.requested.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn request_check_clear_round_trip() {
        let registry = CancellationRegistry::new();
        assert!(!registry.is_requested("r1"));

        registry.request("r1");
        assert!(registry.is_requested("r1"));
        assert!(!registry.is_requested("r2"));

        registry.clear("r1");
        assert!(!registry.is_requested("r1"));

        // Clearing twice is fine.
        registry.clear("r1");
    }

    #[tokio::test]
    async fn concurrent_requests_are_safe() {
        let registry = Arc::new(CancellationRegistry::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let id = format!("run-{}", i % 4);
                registry.request(&id);
                registry.is_requested(&id)
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }
}
