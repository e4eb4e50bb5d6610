pub mod device_map;
pub mod loader;
mod loader_factory;
mod util;

mod dalle;

pub use dalle::{
    DalleBart, DalleBartConfig, DalleLoader, DalleModel, DalleProcessor, LnPositions, LnType, PrngKey, SamplingConfig,
    TokenizedPrompt, TokenizedText, VqganConfig, VqganDecoder,
};
pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

/// Body of a generation call: a prompt and how many images to draw for it.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub text: String,
    pub num_images: u32,
    /// Pins the sampling key; a fresh random key is drawn when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(text: impl Into<String>, num_images: u32) -> Self {
        Self {
            text: text.into(),
            num_images,
            seed: None,
        }
    }
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<Vec<DynamicImage>>;
}
