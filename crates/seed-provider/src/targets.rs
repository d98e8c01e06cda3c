//! Seeds as reconcile targets.

use crate::seeds::SeedsGetter;
use async_trait::async_trait;
use control_loop::TargetRegistry;
use std::sync::Arc;

/// Exposes the seeds of a [`SeedsGetter`] as reconcile targets.
#[derive(Clone)]
pub struct SeedTargets {
    seeds: Arc<dyn SeedsGetter>,
}

impl std::fmt::Debug for SeedTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedTargets").finish_non_exhaustive()
    }
}

impl SeedTargets {
    /// Create a registry listing the seeds of `seeds`
    pub fn new(seeds: Arc<dyn SeedsGetter>) -> Self {
        Self { seeds }
    }
}

#[async_trait]
impl TargetRegistry for SeedTargets {
    async fn target_names(&self) -> anyhow::Result<Vec<String>> {
        let seeds = self.seeds.seeds().await?;
        Ok(seeds.into_keys().collect())
    }
}
