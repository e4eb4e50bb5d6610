use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use super::model::DalleBart;
use super::processor::TokenizedPrompt;

/// A splittable 64-bit sampling key. Every request draws a fresh key unless
/// the caller pins one; sub-keys are derived deterministically from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn seed(self) -> u64 {
        self.0
    }

    pub fn split(self, n: usize) -> Vec<PrngKey> {
        let mut rng = StdRng::seed_from_u64(self.0);
        (0..n).map(|_| PrngKey(rng.next_u64())).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub temperature: f64,
    /// Weight of the prompt-conditioned logits against the unconditioned ones.
    /// `1.0` disables the unconditioned pass.
    pub condition_scale: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: Some(50),
            top_p: None,
            temperature: 1.0,
            condition_scale: 10.0,
        }
    }
}

impl SamplingConfig {
    pub fn sampling(&self) -> Sampling {
        let temperature = self.temperature;
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        match (self.top_k, self.top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }

    fn super_conditioning(&self) -> bool {
        (self.condition_scale - 1.0).abs() > f64::EPSILON
    }
}

/// Logit bias that forbids every id at or above `valid`.
fn vocabulary_mask(vocab: usize, valid: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..vocab)
        .map(|i| if i < valid { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    Ok(Tensor::from_vec(mask, vocab, device)?)
}

/// Samples `num_predictions` image-token sequences for one tokenized prompt.
///
/// Every prediction gets its own sampler stream derived from `key`. Only ids
/// below `codebook_size` are ever produced, and the leading BOS sentinel is
/// stripped, so each sequence holds exactly `image_length` codebook indices.
pub fn generate(
    model: &DalleBart,
    prompt: &TokenizedPrompt,
    num_predictions: usize,
    key: PrngKey,
    config: &SamplingConfig,
    codebook_size: usize,
    device: &Device,
) -> Result<Vec<Vec<u32>>> {
    if num_predictions == 0 {
        return Ok(Vec::new());
    }
    let cfg = model.config();
    if codebook_size == 0 || codebook_size > cfg.image_vocab_size {
        bail!(
            "codebook size {codebook_size} does not fit the image vocabulary of {}",
            cfg.image_vocab_size
        );
    }
    let n = num_predictions;
    let guided = config.super_conditioning();

    // --- Encode the prompt (and the empty prompt when guiding) ---
    let (ids, mask) = prompt.cond.to_tensors(device)?;
    let states = model.encode(&ids, &mask)?.repeat((n, 1, 1))?;
    let mask = mask.repeat((n, 1))?;
    let (states, mask) = if guided {
        let (uncond_ids, uncond_mask) = prompt.uncond.to_tensors(device)?;
        let uncond_states = model.encode(&uncond_ids, &uncond_mask)?.repeat((n, 1, 1))?;
        let uncond_mask = uncond_mask.repeat((n, 1))?;
        (
            Tensor::cat(&[&states, &uncond_states], 0)?,
            Tensor::cat(&[&mask, &uncond_mask], 0)?,
        )
    } else {
        (states, mask)
    };
    let mut cache = model.decoder_cache(&states, &mask)?;

    // --- Sample image tokens one position at a time ---
    let mut samplers: Vec<LogitsProcessor> = key
        .split(n)
        .into_iter()
        .map(|k| LogitsProcessor::from_sampling(k.seed(), config.sampling()))
        .collect();
    let invalid = vocabulary_mask(cfg.decoder_vocab_size(), codebook_size, device)?;
    let bos = cfg.decoder_start_token_id;
    let mut sequences = vec![vec![bos]; n];
    let mut next = vec![bos; n];

    for _ in 0..cfg.image_length {
        let input = Tensor::new(next.as_slice(), device)?.unsqueeze(1)?;
        let input = if guided {
            Tensor::cat(&[&input, &input], 0)?
        } else {
            input
        };
        let logits = model.decode(&input, &mut cache)?;
        let logits = if guided {
            let cond = logits.narrow(0, 0, n)?;
            let uncond = logits.narrow(0, n, n)?;
            (((cond - &uncond)? * config.condition_scale)? + uncond)?
        } else {
            logits
        };
        let logits = logits.broadcast_add(&invalid)?;
        for (i, sampler) in samplers.iter_mut().enumerate() {
            let token = sampler.sample(&logits.get(i)?)?;
            next[i] = token;
            sequences[i].push(token);
        }
    }

    // --- Strip the BOS sentinel ---
    Ok(sequences
        .into_iter()
        .map(|sequence| sequence[1..].to_vec())
        .collect())
}
