use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::tokio::Api;
use hf_hub::{Repo, RepoType};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod checkpoint;
mod model;
mod processor;
mod sampling;
mod text;
mod vqgan;

pub use model::{DalleBart, DalleBartConfig, LnPositions, LnType};
pub use processor::{DalleProcessor, TokenizedPrompt, TokenizedText};
pub use sampling::{PrngKey, SamplingConfig};
pub use vqgan::{VqganConfig, VqganDecoder};

use checkpoint::{load_msgpack, unstack_scanned_layers, Checkpoint};

use crate::{
    select_devices, tensor_to_image, DeviceMap, GenerationRequest, Loader, ModelLike, ModelSpec,
    ModelVariant, Residency,
};

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_FILE: &str = "flax_model.msgpack";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// One device's share of the model.
struct Replica {
    device: Device,
    dtype: DType,
    generator: Option<Arc<DalleBart>>,
    decoder: Option<Arc<VqganDecoder>>,
}

/// Splits `n` predictions over `devices` replicas, earlier replicas taking the
/// remainder.
fn shard_predictions(n: usize, devices: usize) -> Vec<usize> {
    let base = n / devices;
    let extra = n % devices;
    (0..devices).map(|i| base + usize::from(i < extra)).collect()
}

fn batch_sizes(n: usize, batch_size: usize) -> Vec<usize> {
    let batch_size = batch_size.max(1);
    (0..n)
        .step_by(batch_size)
        .map(|start| batch_size.min(n - start))
        .collect()
}

pub struct DalleModel {
    processor: DalleProcessor,
    config: DalleBartConfig,
    vqgan_config: VqganConfig,
    generator_weights: Checkpoint,
    decoder_weights: Checkpoint,
    replicas: Vec<Replica>,
    sampling: SamplingConfig,
    batch_size: usize,
    busy: Mutex<()>,
}

impl DalleModel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        processor: DalleProcessor,
        config: DalleBartConfig,
        vqgan_config: VqganConfig,
        generator_weights: Checkpoint,
        decoder_weights: Checkpoint,
        devices: Vec<(Device, DType)>,
        spec: &ModelSpec,
    ) -> Result<Self> {
        if devices.is_empty() {
            bail!("no device to run on");
        }
        if config.image_length != vqgan_config.tokens_per_image() {
            bail!(
                "generator produces {} tokens per image but the VQGAN expects {}",
                config.image_length,
                vqgan_config.tokens_per_image()
            );
        }
        if vqgan_config.n_embed > config.image_vocab_size {
            bail!(
                "VQGAN codebook of {} entries exceeds the generator vocabulary of {}",
                vqgan_config.n_embed,
                config.image_vocab_size
            );
        }

        let mut model = Self {
            processor,
            config,
            vqgan_config,
            generator_weights,
            decoder_weights,
            replicas: Vec::with_capacity(devices.len()),
            sampling: spec.sampling,
            batch_size: spec.batch_size.max(1),
            busy: Mutex::new(()),
        };
        for (device, dtype) in devices {
            let (generator, decoder) = match spec.residency {
                Residency::Resident => (
                    Some(Arc::new(model.load_generator(&device, dtype)?)),
                    Some(Arc::new(model.load_decoder(&device)?)),
                ),
                Residency::OnDemand => (None, None),
            };
            model.replicas.push(Replica {
                device,
                dtype,
                generator,
                decoder,
            });
        }
        Ok(model)
    }

    fn load_generator(&self, device: &Device, dtype: DType) -> Result<DalleBart> {
        let vb = self.generator_weights.var_builder(dtype, device)?;
        DalleBart::new(&self.config, vb).context("failed to build DalleBart")
    }

    fn load_decoder(&self, device: &Device) -> Result<VqganDecoder> {
        let vb = self.decoder_weights.var_builder(DType::F32, device)?;
        VqganDecoder::new(&self.vqgan_config, vb).context("failed to build VQGAN decoder")
    }

    fn generator(&self, replica: &Replica) -> Result<Arc<DalleBart>> {
        match &replica.generator {
            Some(generator) => Ok(generator.clone()),
            None => Ok(Arc::new(self.load_generator(&replica.device, replica.dtype)?)),
        }
    }

    fn decoder(&self, replica: &Replica) -> Result<Arc<VqganDecoder>> {
        match &replica.decoder {
            Some(decoder) => Ok(decoder.clone()),
            None => Ok(Arc::new(self.load_decoder(&replica.device)?)),
        }
    }

    /// Runs `f` once per replica, in parallel, handing each its own `work`.
    fn on_each_device<W, R, F>(&self, work: Vec<W>, f: F) -> Result<Vec<R>>
    where
        W: Send,
        R: Send,
        F: Fn(&Replica, W) -> Result<R> + Sync,
    {
        std::thread::scope(|scope| {
            let f = &f;
            let handles = self
                .replicas
                .iter()
                .zip(work)
                .map(|(replica, work)| scope.spawn(move || f(replica, work)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().map_err(|_| anyhow!("device worker panicked"))?)
                .collect()
        })
    }

    /// Samples `n` token sequences, spread over all replicas. The result is
    /// grouped per replica.
    fn generate_tokens(
        &self,
        prompt: &TokenizedPrompt,
        n: usize,
        key: PrngKey,
    ) -> Result<Vec<Vec<Vec<u32>>>> {
        let shards = shard_predictions(n, self.replicas.len());
        let work = shards
            .into_iter()
            .zip(key.split(self.replicas.len()))
            .collect::<Vec<_>>();
        self.on_each_device(work, |replica, (count, key)| {
            if count == 0 {
                return Ok(Vec::new());
            }
            let generator = self.generator(replica)?;
            let sizes = batch_sizes(count, self.batch_size);
            let mut sequences = Vec::with_capacity(count);
            for (size, key) in sizes.iter().zip(key.split(sizes.len())) {
                sequences.extend(sampling::generate(
                    &generator,
                    prompt,
                    *size,
                    key,
                    &self.sampling,
                    self.vqgan_config.n_embed,
                    &replica.device,
                )?);
            }
            debug!(device = ?replica.device, count, "sampled image tokens");
            Ok(sequences)
        })
    }

    fn decode_tokens(&self, tokens: Vec<Vec<Vec<u32>>>) -> Result<Vec<DynamicImage>> {
        let tokens_per_image = self.vqgan_config.tokens_per_image();
        let images = self.on_each_device(tokens, |replica, sequences| {
            if sequences.is_empty() {
                return Ok(Vec::new());
            }
            let decoder = self.decoder(replica)?;
            let mut images = Vec::with_capacity(sequences.len());
            for chunk in sequences.chunks(self.batch_size) {
                let flat = chunk.iter().flatten().copied().collect::<Vec<u32>>();
                let indices = Tensor::from_vec(flat, (chunk.len(), tokens_per_image), &replica.device)?;
                // (batch, 3, res, res) -> (batch, res, res, 3)
                let pixels = decoder.decode_code(&indices)?.permute((0, 2, 3, 1))?;
                for i in 0..chunk.len() {
                    images.push(tensor_to_image(&pixels.get(i)?)?);
                }
            }
            debug!(device = ?replica.device, count = images.len(), "decoded images");
            Ok(images)
        })?;
        Ok(images.into_iter().flatten().collect())
    }
}

impl ModelLike for DalleModel {
    fn run(&self, request: GenerationRequest) -> Result<Vec<DynamicImage>> {
        let n = request.num_images as usize;
        if n == 0 {
            return Ok(Vec::new());
        }
        let _busy = self
            .busy
            .lock()
            .map_err(|_| anyhow!("generation lock poisoned"))?;

        let prompt = self.processor.process(&request.text)?;
        let key = request.seed.map(PrngKey::new).unwrap_or_else(PrngKey::random);
        debug!(seed = key.seed(), n, "generating");

        // --- Sample image tokens on every device ---
        let tokens = self.generate_tokens(&prompt, n, key)?;

        // --- Decode them into pixels ---
        self.decode_tokens(tokens)
    }
}

pub struct DalleLoader;

impl Loader for DalleLoader {
    type Model = DalleModel;

    async fn load(
        variant: ModelVariant,
        spec: ModelSpec,
        api: Api,
        device_map: DeviceMap,
    ) -> Result<Self::Model> {
        let devices = select_devices(&device_map).context("failed to set up devices")?;

        // --- Load DalleBart config, weights and tokenizer ---
        let dalle_repo = api.repo(Repo::with_revision(
            spec.model.clone(),
            RepoType::Model,
            spec.revision.clone(),
        ));
        let config_filename = dalle_repo
            .get(CONFIG_FILE)
            .await
            .context("failed to get DalleBart config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read DalleBart config")?;
        let config: DalleBartConfig =
            serde_json::from_str(&config_str).context("failed to parse DalleBart config")?;
        let dalle_weights = dalle_repo
            .get(WEIGHTS_FILE)
            .await
            .context("failed to get DalleBart weights")?;
        let tokenizer_filename = dalle_repo
            .get(TOKENIZER_FILE)
            .await
            .context("failed to get DalleBart tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(anyhow::Error::msg)
            .context("failed to load DalleBart tokenizer")?;
        let processor = DalleProcessor::new(tokenizer, config.max_text_length, config.normalize_text)?;

        // --- Load VQGAN config and weights ---
        info!(model = %spec.vqgan, revision = %spec.vqgan_revision, "loading VQGAN");
        let vqgan_repo = api.repo(Repo::with_revision(
            spec.vqgan.clone(),
            RepoType::Model,
            spec.vqgan_revision.clone(),
        ));
        let vqgan_config_filename = vqgan_repo
            .get(CONFIG_FILE)
            .await
            .context("failed to get VQGAN config")?;
        let vqgan_config_str = std::fs::read_to_string(&vqgan_config_filename)
            .context("failed to read VQGAN config")?;
        let vqgan_config: VqganConfig =
            serde_json::from_str(&vqgan_config_str).context("failed to parse VQGAN config")?;
        let vqgan_weights = vqgan_repo
            .get(WEIGHTS_FILE)
            .await
            .context("failed to get VQGAN weights")?;

        // --- Read both Flax checkpoints into host memory ---
        let dalle_weights = load_msgpack(&dalle_weights)
            .and_then(unstack_scanned_layers)
            .context("failed to load DalleBart weights")?;
        let vqgan_weights = load_msgpack(&vqgan_weights).context("failed to load VQGAN weights")?;
        debug!(
            generator = dalle_weights.len(),
            vqgan = vqgan_weights.len(),
            "read checkpoint tensors"
        );

        let devices = devices
            .into_iter()
            .map(|device| {
                let dtype = variant.dtype(&device);
                (device, dtype)
            })
            .collect::<Vec<_>>();
        info!(
            replicas = devices.len(),
            residency = ?spec.residency,
            "building model replicas"
        );

        DalleModel::new(
            processor,
            config,
            vqgan_config,
            Checkpoint::Tensors(dalle_weights),
            Checkpoint::Tensors(vqgan_weights),
            devices,
            &spec,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dalle::checkpoint::tests::load_fixture;
    use candle_nn::VarMap;

    fn tiny_config() -> DalleBartConfig {
        let mut config = model::tests::tiny_config();
        config.image_length = 16;
        config
    }

    fn build(
        config: DalleBartConfig,
        generator_weights: Checkpoint,
        decoder_weights: Checkpoint,
        residency: Residency,
        replicas: usize,
    ) -> DalleModel {
        let processor =
            DalleProcessor::new(processor::tests::mock_tokenizer(), config.max_text_length, true)
                .unwrap();
        let spec = ModelSpec {
            residency,
            batch_size: 2,
            ..ModelSpec::default()
        };
        let devices = (0..replicas).map(|_| (Device::Cpu, DType::F32)).collect();
        DalleModel::new(
            processor,
            config,
            vqgan::tests::tiny_config(),
            generator_weights,
            decoder_weights,
            devices,
            &spec,
        )
        .unwrap()
    }

    fn tiny_model(residency: Residency, replicas: usize) -> DalleModel {
        build(
            tiny_config(),
            Checkpoint::Random(VarMap::new()),
            Checkpoint::Random(VarMap::new()),
            residency,
            replicas,
        )
    }

    fn jpeg_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    #[test]
    fn predictions_are_spread_over_devices() {
        assert_eq!(shard_predictions(5, 2), vec![3, 2]);
        assert_eq!(shard_predictions(1, 2), vec![1, 0]);
        assert_eq!(shard_predictions(0, 3), vec![0, 0, 0]);
        assert_eq!(shard_predictions(4, 1), vec![4]);
    }

    #[test]
    fn batches_cover_every_prediction() {
        assert_eq!(batch_sizes(5, 2), vec![2, 2, 1]);
        assert_eq!(batch_sizes(3, 0), vec![1, 1, 1]);
        assert!(batch_sizes(0, 4).is_empty());
    }

    #[test]
    fn resident_replicas_generate_the_requested_count() {
        let model = tiny_model(Residency::Resident, 2);
        assert_eq!(model.replicas.len(), 2);
        assert!(model.replicas.iter().all(|r| r.generator.is_some() && r.decoder.is_some()));

        let images = model.run(GenerationRequest::new("sunset over a lake", 3)).unwrap();
        assert_eq!(images.len(), 3);
        for image in images {
            assert_eq!((image.width(), image.height()), (8, 8));
        }
    }

    #[test]
    fn serves_from_flax_checkpoints() {
        let config = tiny_config();
        let generator = load_fixture(&model::tests::flax_fixture(&config));
        let decoder = load_fixture(&vqgan::tests::flax_fixture());
        for residency in [Residency::Resident, Residency::OnDemand] {
            let model = build(
                config.clone(),
                Checkpoint::Tensors(generator.clone()),
                Checkpoint::Tensors(decoder.clone()),
                residency,
                1,
            );
            let images = model.run(GenerationRequest::new("a red barn", 2)).unwrap();
            assert_eq!(images.len(), 2);
            assert!(images.iter().all(|image| (image.width(), image.height()) == (8, 8)));
        }
    }

    #[test]
    fn on_demand_replicas_are_not_kept() {
        let model = tiny_model(Residency::OnDemand, 1);
        assert!(model.replicas.iter().all(|r| r.generator.is_none() && r.decoder.is_none()));

        let images = model.run(GenerationRequest::new("the moon", 2)).unwrap();
        assert_eq!(images.len(), 2);
        assert!(model.replicas.iter().all(|r| r.generator.is_none() && r.decoder.is_none()));
    }

    #[test]
    fn zero_images_short_circuits() {
        let model = tiny_model(Residency::Resident, 1);
        assert!(model.run(GenerationRequest::new("sunset", 0)).unwrap().is_empty());
    }

    #[test]
    fn pinned_seed_reproduces_images() {
        let model = tiny_model(Residency::Resident, 1);
        let request = GenerationRequest {
            seed: Some(1234),
            ..GenerationRequest::new("sunset over a lake", 1)
        };
        let a = model.run(request.clone()).unwrap();
        let b = model.run(request).unwrap();
        assert_eq!(jpeg_bytes(&a[0]), jpeg_bytes(&b[0]));
    }

    #[test]
    fn mismatched_token_grid_is_rejected() {
        let config = model::tests::tiny_config();
        let processor =
            DalleProcessor::new(processor::tests::mock_tokenizer(), config.max_text_length, true)
                .unwrap();
        let result = DalleModel::new(
            processor,
            config,
            vqgan::tests::tiny_config(),
            Checkpoint::Random(VarMap::new()),
            Checkpoint::Random(VarMap::new()),
            vec![(Device::Cpu, DType::F32)],
            &ModelSpec::default(),
        );
        assert!(result.is_err());
    }
}
