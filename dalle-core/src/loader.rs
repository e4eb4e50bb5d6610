use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;
use loader_factory::ModelVariant;

use crate::{loader_factory, DeviceMap, ModelLike, SamplingConfig};

pub const DALLE_MODEL: &str = "dalle-mini/dalle-mega";
pub const DALLE_REVISION: &str = "main";
pub const VQGAN_MODEL: &str = "dalle-mini/vqgan_imagenet_f16_16384";
pub const VQGAN_REVISION: &str = "e93a26e7707683d349bf5d5c41c5b0ef69b677a9";

/// Whether model replicas stay on their devices between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residency {
    /// Load one replica per device at startup and keep it.
    #[default]
    Resident,
    /// Materialize replicas from the mapped checkpoints on every call and
    /// drop each model as soon as its phase is done.
    OnDemand,
}

/// Which checkpoints to fetch and how to run them.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub model: String,
    pub revision: String,
    pub vqgan: String,
    pub vqgan_revision: String,
    pub residency: Residency,
    pub sampling: SamplingConfig,
    /// Upper bound on predictions processed together on one device.
    pub batch_size: usize,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            model: DALLE_MODEL.to_string(),
            revision: DALLE_REVISION.to_string(),
            vqgan: VQGAN_MODEL.to_string(),
            vqgan_revision: VQGAN_REVISION.to_string(),
            residency: Residency::default(),
            sampling: SamplingConfig::default(),
            batch_size: 1,
        }
    }
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        variant: ModelVariant,
        spec: ModelSpec,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
