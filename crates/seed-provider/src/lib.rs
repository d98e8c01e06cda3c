//! Seed cluster registry
//!
//! Lists the seed clusters a master manages and builds API clients for them
//! from kubeconfigs stored in master secrets.

pub mod error;
pub mod kubeconfig;
pub mod seeds;
pub mod targets;

pub use error::ProviderError;
pub use kubeconfig::{kubeconfig_from_secret, SecretKubeconfigGetter, SeedConnection, SeedKubeconfigGetter};
pub use seeds::{FileSeedsGetter, SecretKeyRef, Seed, SeedsGetter, StaticSeedsGetter};
pub use targets::SeedTargets;
