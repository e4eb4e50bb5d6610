use anyhow::{anyhow, Result};
use candle_core::{DType, Device};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DalleLoader, DeviceMap, Loader, ModelLike, ModelSpec};
use std::sync::Arc;

/// Known generator checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    /// The large model, published in half precision.
    Mega,
    Mini,
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("MEGA") {
            Some(ModelVariant::Mega)
        } else if name_upper.contains("MINI") || name_upper.contains("DALLE") {
            Some(ModelVariant::Mini)
        } else {
            None
        }
    }

    /// Precision of the generator weights on `device`. CPUs always run f32.
    pub fn dtype(&self, device: &Device) -> DType {
        match (self, device) {
            (_, Device::Cpu) => DType::F32,
            (ModelVariant::Mega, _) => DType::F16,
            (ModelVariant::Mini, _) => DType::F32,
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate variant
pub async fn load_model(
    spec: ModelSpec,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    let variant = ModelVariant::from_name(&spec.model)
        .ok_or_else(|| anyhow!("Unsupported model: {}", spec.model))?;

    info!(
        model = %spec.model,
        revision = %spec.revision,
        ?variant,
        "loading generator"
    );

    let model = DalleLoader::load(variant, spec, api, device_map).await?;
    Ok(Arc::new(model))
}
