//! DalleBart: a BART-style encoder/decoder that maps text tokens to VQGAN
//! image tokens.
//!
//! Parameters are looked up by their Flax names (`model.encoder.embed_tokens.embedding`,
//! `...FlaxBartEncoderLayer_0.GLU_0.Dense_0.kernel`, ...) and used in the Flax
//! layout, so a `flax_model.msgpack` checkpoint loads without conversion.
//! Scanned layer stacks must be split per layer first.
use anyhow::{bail, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{init, ops::softmax_last_dim, Activation, Embedding, Init, LayerNorm, VarBuilder};
use serde::Deserialize;

const LN_EPS: f64 = 1e-5;
const MASK_VALUE: f64 = 1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LnPositions {
    #[default]
    Normformer,
    Preln,
    Postln,
    Swinv2,
    Cogview,
    Subln,
}

impl LnPositions {
    fn pre_norm(self) -> bool {
        matches!(self, Self::Normformer | Self::Cogview | Self::Preln | Self::Subln)
    }

    fn after_attention(self) -> bool {
        matches!(self, Self::Normformer | Self::Swinv2 | Self::Cogview)
    }

    fn after_residual(self) -> bool {
        self == Self::Postln
    }

    fn inside_ffn(self) -> bool {
        matches!(self, Self::Normformer | Self::Subln)
    }

    fn after_ffn(self) -> bool {
        matches!(self, Self::Swinv2 | Self::Cogview)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LnType {
    #[default]
    Layernorm,
    Rmsnorm,
}

fn default_true() -> bool {
    true
}

fn default_max_text_length() -> usize {
    64
}

fn default_image_length() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct DalleBartConfig {
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    pub encoder_vocab_size: usize,
    pub image_vocab_size: usize,
    #[serde(default = "default_image_length")]
    pub image_length: usize,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub activation_function: Activation,
    #[serde(default)]
    pub ln_type: LnType,
    #[serde(default)]
    pub ln_positions: LnPositions,
    #[serde(default = "default_true")]
    pub use_glu: bool,
    #[serde(default)]
    pub use_bias: bool,
    #[serde(default = "default_true")]
    pub use_final_ln_encoder: bool,
    #[serde(default = "default_true")]
    pub use_final_ln_decoder: bool,
    #[serde(default)]
    pub use_deepnet_scaling: bool,
    #[serde(default)]
    pub scale_embedding: bool,
    #[serde(default = "default_true")]
    pub normalize_text: bool,
    #[serde(default)]
    pub use_cosine_attention: bool,
    #[serde(default)]
    pub use_alibi: bool,
    #[serde(default)]
    pub use_swin_position_embeddings: bool,
    #[serde(default)]
    pub use_head_scale: bool,
}

impl DalleBartConfig {
    /// Rejects checkpoints that rely on attention variants this implementation
    /// does not provide.
    pub fn validate(&self) -> Result<()> {
        if self.ln_type != LnType::Layernorm {
            bail!("only layernorm checkpoints are supported");
        }
        if self.use_cosine_attention {
            bail!("cosine attention is not supported");
        }
        if self.use_alibi {
            bail!("alibi position biases are not supported");
        }
        if self.use_swin_position_embeddings {
            bail!("swin position embeddings are not supported");
        }
        if self.use_head_scale {
            bail!("attention head scaling is not supported");
        }
        if self.d_model % self.encoder_attention_heads != 0
            || self.d_model % self.decoder_attention_heads != 0
        {
            bail!(
                "d_model {} is not divisible by the number of attention heads",
                self.d_model
            );
        }
        Ok(())
    }

    /// Size of the decoder vocabulary: the image codebook plus the BOS sentinel.
    pub fn decoder_vocab_size(&self) -> usize {
        self.image_vocab_size + 1
    }

    fn residual_gains(&self) -> (f64, f64) {
        if !self.use_deepnet_scaling {
            return (1.0, 1.0);
        }
        let n = self.encoder_layers as f64;
        let m = self.decoder_layers as f64;
        let encoder = 0.81 * (n.powi(4) * m).powf(1.0 / 16.0);
        let decoder = (3.0 * m).powf(0.25);
        (encoder, decoder)
    }

    fn embed_scale(&self) -> f64 {
        if self.scale_embedding {
            (self.d_model as f64).sqrt()
        } else {
            1.0
        }
    }

    fn ffn_scope(&self) -> &'static str {
        if self.use_glu {
            "GLU_0"
        } else {
            "FFN_0"
        }
    }
}

/// Layer norm whose scale is optional in the checkpoint; a missing scale means
/// a unit scale.
fn layer_norm(dim: usize, vb: VarBuilder) -> Result<LayerNorm> {
    let bias = vb.get(dim, "bias")?;
    let scale = if vb.contains_tensor("scale") {
        vb.get(dim, "scale")?
    } else {
        Tensor::ones(dim, bias.dtype(), bias.device())?
    };
    Ok(LayerNorm::new(scale, bias, LN_EPS))
}

/// Hands out `LayerNorm_{n}` scopes in creation order, matching how Flax
/// names layer norms declared inline in a module.
struct NormScopes<'a> {
    vb: VarBuilder<'a>,
    next: usize,
}

impl<'a> NormScopes<'a> {
    fn new(vb: &VarBuilder<'a>) -> Self {
        Self {
            vb: vb.clone(),
            next: 0,
        }
    }

    fn take(&mut self, enabled: bool, dim: usize) -> Result<Option<LayerNorm>> {
        if !enabled {
            return Ok(None);
        }
        let norm = layer_norm(dim, self.vb.pp(format!("LayerNorm_{}", self.next)))?;
        self.next += 1;
        Ok(Some(norm))
    }
}

fn apply_norm(norm: &Option<LayerNorm>, xs: Tensor) -> Result<Tensor> {
    match norm {
        Some(norm) => Ok(norm.forward(&xs)?),
        None => Ok(xs),
    }
}

fn embedding(vocab: usize, dim: usize, vb: VarBuilder) -> Result<Embedding> {
    let table = vb.get_with_hints(
        (vocab, dim),
        "embedding",
        Init::Randn {
            mean: 0.,
            stdev: 1.,
        },
    )?;
    Ok(Embedding::new(table, dim))
}

/// Flax `nn.Dense`; the kernel is stored `(in, out)`.
#[derive(Debug, Clone)]
struct Dense {
    kernel: Tensor,
    bias: Option<Tensor>,
}

impl Dense {
    fn new(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let kernel = vb.get_with_hints((in_dim, out_dim), "kernel", init::DEFAULT_KAIMING_NORMAL)?;
        let bias = if bias {
            Some(vb.get(out_dim, "bias")?)
        } else {
            None
        };
        Ok(Self { kernel, bias })
    }
}

impl Module for Dense {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = xs.broadcast_matmul(&self.kernel)?;
        match &self.bias {
            Some(bias) => ys.broadcast_add(bias),
            None => Ok(ys),
        }
    }
}

/// Additive attention bias from a `(batch, seq)` 0/1 mask: zero where the key
/// is visible, a large negative value where it is padding.
pub fn padding_bias(mask: &Tensor) -> Result<Tensor> {
    let (b, s) = mask.dims2()?;
    let bias = ((mask.to_dtype(DType::F32)? - 1.0)? * MASK_VALUE)?;
    Ok(bias.reshape((b, 1, 1, s))?)
}

fn causal_bias(t: usize, past: usize, device: &Device) -> Result<Tensor> {
    let total = past + t;
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| (0..total).map(move |j| if j > past + i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, t, total), device)?)
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Dense,
    k_proj: Dense,
    v_proj: Dense,
    out_proj: Dense,
    mid_layernorm: Option<LayerNorm>,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
}

impl Attention {
    fn new(cfg: &DalleBartConfig, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.d_model;
        let head_dim = dim / num_heads;
        let mid_layernorm = if cfg.ln_positions == LnPositions::Subln {
            Some(layer_norm(dim, vb.pp("mid_layernorm"))?)
        } else {
            None
        };
        Ok(Self {
            q_proj: Dense::new(dim, dim, cfg.use_bias, vb.pp("q_proj"))?,
            k_proj: Dense::new(dim, dim, cfg.use_bias, vb.pp("k_proj"))?,
            v_proj: Dense::new(dim, dim, cfg.use_bias, vb.pp("v_proj"))?,
            out_proj: Dense::new(dim, dim, cfg.use_bias, vb.pp("out_proj"))?,
            mid_layernorm,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        Ok(xs
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Projects `states` to per-head keys and values.
    fn key_value(&self, states: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = self.split_heads(&self.k_proj.forward(states)?)?;
        let v = self.split_heads(&self.v_proj.forward(states)?)?;
        Ok((k, v))
    }

    fn attend(&self, xs: &Tensor, key: &Tensor, value: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let q = (self.split_heads(&self.q_proj.forward(xs)?)? * self.scaling)?;
        let scores = q.matmul(&key.t()?)?.to_dtype(DType::F32)?;
        let scores = match bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };
        let probs = softmax_last_dim(&scores)?.to_dtype(value.dtype())?;
        let out = probs
            .matmul(value)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        let out = apply_norm(&self.mid_layernorm, out)?;
        Ok(self.out_proj.forward(&out)?)
    }

    fn forward(&self, xs: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (k, v) = self.key_value(xs)?;
        self.attend(xs, &k, &v, bias)
    }

    fn forward_cached(
        &self,
        xs: &Tensor,
        bias: Option<&Tensor>,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let (k, v) = self.key_value(xs)?;
        let (k, v) = match cache.take() {
            Some((past_k, past_v)) => (Tensor::cat(&[&past_k, &k], 2)?, Tensor::cat(&[&past_v, &v], 2)?),
            None => (k, v),
        };
        let out = self.attend(xs, &k, &v, bias)?;
        *cache = Some((k, v));
        Ok(out)
    }
}

/// Feed-forward block, `GLU_0` or `FFN_0` in the checkpoint. With `use_glu`
/// the activation branch (`Dense_0`) is gated by `Dense_1` and projected back
/// by `Dense_2`; otherwise `Dense_0` and `Dense_1` form a plain MLP.
#[derive(Debug, Clone)]
struct FeedForward {
    pre_norm: Option<LayerNorm>,
    fc_in: Dense,
    gate: Option<Dense>,
    mid_norm: Option<LayerNorm>,
    fc_out: Dense,
    post_norm: Option<LayerNorm>,
    act: Activation,
}

impl FeedForward {
    fn new(cfg: &DalleBartConfig, ffn_dim: usize, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.d_model;
        let ln = cfg.ln_positions;
        let mut norms = NormScopes::new(&vb);
        let pre_norm = norms.take(ln.pre_norm(), dim)?;
        let fc_in = Dense::new(dim, ffn_dim, cfg.use_bias, vb.pp("Dense_0"))?;
        let (gate, out_scope) = if cfg.use_glu {
            let gate = Dense::new(dim, ffn_dim, cfg.use_bias, vb.pp("Dense_1"))?;
            (Some(gate), "Dense_2")
        } else {
            (None, "Dense_1")
        };
        let mid_norm = norms.take(ln.inside_ffn(), ffn_dim)?;
        let fc_out = Dense::new(ffn_dim, dim, cfg.use_bias, vb.pp(out_scope))?;
        let post_norm = norms.take(ln.after_ffn(), dim)?;
        Ok(Self {
            pre_norm,
            fc_in,
            gate,
            mid_norm,
            fc_out,
            post_norm,
            act: cfg.activation_function,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = match &self.pre_norm {
            Some(norm) => norm.forward(xs)?,
            None => xs.clone(),
        };
        let mut hidden = self.fc_in.forward(&xs)?.apply(&self.act)?;
        if let Some(gate) = &self.gate {
            hidden = (hidden * gate.forward(&xs)?)?;
        }
        if let Some(norm) = &self.mid_norm {
            hidden = norm.forward(&hidden)?;
        }
        let out = self.fc_out.forward(&hidden)?;
        match &self.post_norm {
            Some(norm) => norm.forward(&out),
            None => Ok(out),
        }
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    pre_attn_norm: Option<LayerNorm>,
    self_attn: Attention,
    attn_norm: Option<LayerNorm>,
    attn_residual_norm: Option<LayerNorm>,
    ffn: FeedForward,
    ffn_residual_norm: Option<LayerNorm>,
    gain: f64,
}

impl EncoderLayer {
    fn new(cfg: &DalleBartConfig, gain: f64, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.d_model;
        let ln = cfg.ln_positions;
        // Norm scopes are numbered in the order the layer creates them.
        let mut norms = NormScopes::new(&vb);
        let pre_attn_norm = norms.take(ln.pre_norm(), dim)?;
        let self_attn = Attention::new(cfg, cfg.encoder_attention_heads, vb.pp("FlaxBartAttention_0"))?;
        let attn_norm = norms.take(ln.after_attention(), dim)?;
        let attn_residual_norm = norms.take(ln.after_residual(), dim)?;
        let ffn = FeedForward::new(cfg, cfg.encoder_ffn_dim, vb.pp(cfg.ffn_scope()))?;
        let ffn_residual_norm = norms.take(ln.after_residual(), dim)?;
        Ok(Self {
            pre_attn_norm,
            self_attn,
            attn_norm,
            attn_residual_norm,
            ffn,
            ffn_residual_norm,
            gain,
        })
    }

    fn forward(&self, xs: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let hidden = apply_norm(&self.pre_attn_norm, xs.clone())?;
        let hidden = self.self_attn.forward(&hidden, Some(bias))?;
        let hidden = apply_norm(&self.attn_norm, hidden)?;
        let xs = apply_norm(&self.attn_residual_norm, ((xs * self.gain)? + hidden)?)?;

        let hidden = self.ffn.forward(&xs)?;
        apply_norm(&self.ffn_residual_norm, ((&xs * self.gain)? + hidden)?)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    pre_self_attn_norm: Option<LayerNorm>,
    self_attn: Attention,
    self_attn_norm: Option<LayerNorm>,
    self_attn_residual_norm: Option<LayerNorm>,
    pre_cross_attn_norm: Option<LayerNorm>,
    encoder_attn: Attention,
    cross_attn_norm: Option<LayerNorm>,
    cross_attn_residual_norm: Option<LayerNorm>,
    ffn: FeedForward,
    ffn_residual_norm: Option<LayerNorm>,
    gain: f64,
}

impl DecoderLayer {
    fn new(cfg: &DalleBartConfig, gain: f64, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.d_model;
        let ln = cfg.ln_positions;
        let heads = cfg.decoder_attention_heads;
        let mut norms = NormScopes::new(&vb);
        let pre_self_attn_norm = norms.take(ln.pre_norm(), dim)?;
        let self_attn = Attention::new(cfg, heads, vb.pp("FlaxBartAttention_0"))?;
        let self_attn_norm = norms.take(ln.after_attention(), dim)?;
        let self_attn_residual_norm = norms.take(ln.after_residual(), dim)?;
        let pre_cross_attn_norm = norms.take(ln.pre_norm(), dim)?;
        let encoder_attn = Attention::new(cfg, heads, vb.pp("FlaxBartAttention_1"))?;
        let cross_attn_norm = norms.take(ln.after_attention(), dim)?;
        let cross_attn_residual_norm = norms.take(ln.after_residual(), dim)?;
        let ffn = FeedForward::new(cfg, cfg.decoder_ffn_dim, vb.pp(cfg.ffn_scope()))?;
        let ffn_residual_norm = norms.take(ln.after_residual(), dim)?;
        Ok(Self {
            pre_self_attn_norm,
            self_attn,
            self_attn_norm,
            self_attn_residual_norm,
            pre_cross_attn_norm,
            encoder_attn,
            cross_attn_norm,
            cross_attn_residual_norm,
            ffn,
            ffn_residual_norm,
            gain,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        self_bias: Option<&Tensor>,
        encoder_bias: &Tensor,
        cache: &mut LayerCache,
    ) -> Result<Tensor> {
        let hidden = apply_norm(&self.pre_self_attn_norm, xs.clone())?;
        let hidden = self.self_attn.forward_cached(&hidden, self_bias, &mut cache.self_kv)?;
        let hidden = apply_norm(&self.self_attn_norm, hidden)?;
        let xs = apply_norm(&self.self_attn_residual_norm, ((xs * self.gain)? + hidden)?)?;

        let hidden = apply_norm(&self.pre_cross_attn_norm, xs.clone())?;
        let (k, v) = &cache.cross_kv;
        let hidden = self.encoder_attn.attend(&hidden, k, v, Some(encoder_bias))?;
        let hidden = apply_norm(&self.cross_attn_norm, hidden)?;
        let xs = apply_norm(&self.cross_attn_residual_norm, ((&xs * self.gain)? + hidden)?)?;

        let hidden = self.ffn.forward(&xs)?;
        apply_norm(&self.ffn_residual_norm, ((&xs * self.gain)? + hidden)?)
    }
}

#[derive(Debug, Clone)]
struct LayerCache {
    self_kv: Option<(Tensor, Tensor)>,
    cross_kv: (Tensor, Tensor),
}

/// Per-generation decoder state: cached self-attention keys/values, the
/// encoder projections for cross-attention, and the encoder padding bias.
#[derive(Debug, Clone)]
pub struct DecoderCache {
    layers: Vec<LayerCache>,
    encoder_bias: Tensor,
    offset: usize,
}

fn final_ln(enabled: bool, cfg: &DalleBartConfig, vb: VarBuilder) -> Result<Option<LayerNorm>> {
    // Post-LN layers already end with a norm.
    if enabled && cfg.ln_positions != LnPositions::Postln {
        Ok(Some(layer_norm(cfg.d_model, vb.pp("final_ln"))?))
    } else {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
struct Encoder {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<EncoderLayer>,
    final_ln: Option<LayerNorm>,
    embed_scale: f64,
}

impl Encoder {
    fn new(cfg: &DalleBartConfig, vb: VarBuilder) -> Result<Self> {
        let (gain, _) = cfg.residual_gains();
        let layers = (0..cfg.encoder_layers)
            .map(|i| EncoderLayer::new(cfg, gain, vb.pp("layers").pp(format!("FlaxBartEncoderLayer_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: embedding(cfg.encoder_vocab_size, cfg.d_model, vb.pp("embed_tokens"))?,
            embed_positions: embedding(cfg.max_text_length, cfg.d_model, vb.pp("embed_positions"))?,
            layernorm_embedding: layer_norm(cfg.d_model, vb.pp("layernorm_embedding"))?,
            layers,
            final_ln: final_ln(cfg.use_final_ln_encoder, cfg, vb)?,
            embed_scale: cfg.embed_scale(),
        })
    }

    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let tokens = (self.embed_tokens.forward(input_ids)? * self.embed_scale)?;
        let xs = tokens.broadcast_add(&self.embed_positions.forward(&positions)?)?;
        let mut xs = self.layernorm_embedding.forward(&xs)?;
        let bias = padding_bias(attention_mask)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &bias)?;
        }
        apply_norm(&self.final_ln, xs)
    }
}

#[derive(Debug, Clone)]
struct Decoder {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<DecoderLayer>,
    final_ln: Option<LayerNorm>,
    embed_scale: f64,
}

impl Decoder {
    fn new(cfg: &DalleBartConfig, vb: VarBuilder) -> Result<Self> {
        let (_, gain) = cfg.residual_gains();
        let layers = (0..cfg.decoder_layers)
            .map(|i| DecoderLayer::new(cfg, gain, vb.pp("layers").pp(format!("FlaxBartDecoderLayer_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: embedding(cfg.decoder_vocab_size(), cfg.d_model, vb.pp("embed_tokens"))?,
            embed_positions: embedding(cfg.image_length, cfg.d_model, vb.pp("embed_positions"))?,
            layernorm_embedding: layer_norm(cfg.d_model, vb.pp("layernorm_embedding"))?,
            layers,
            final_ln: final_ln(cfg.use_final_ln_decoder, cfg, vb)?,
            embed_scale: cfg.embed_scale(),
        })
    }

    fn forward(&self, input_ids: &Tensor, cache: &mut DecoderCache) -> Result<Tensor> {
        let (_, t) = input_ids.dims2()?;
        let device = input_ids.device();
        let past = cache.offset;
        let positions = Tensor::arange(past as u32, (past + t) as u32, device)?;
        let tokens = (self.embed_tokens.forward(input_ids)? * self.embed_scale)?;
        let xs = tokens.broadcast_add(&self.embed_positions.forward(&positions)?)?;
        let mut xs = self.layernorm_embedding.forward(&xs)?;

        let self_bias = if t > 1 {
            Some(causal_bias(t, past, device)?)
        } else {
            None
        };
        for (layer, layer_cache) in self.layers.iter().zip(cache.layers.iter_mut()) {
            xs = layer.forward(&xs, self_bias.as_ref(), &cache.encoder_bias, layer_cache)?;
        }
        cache.offset += t;
        apply_norm(&self.final_ln, xs)
    }
}

#[derive(Debug, Clone)]
pub struct DalleBart {
    encoder: Encoder,
    decoder: Decoder,
    lm_head: Dense,
    config: DalleBartConfig,
}

impl DalleBart {
    pub fn new(cfg: &DalleBartConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let model = vb.pp("model");
        Ok(Self {
            encoder: Encoder::new(cfg, model.pp("encoder"))?,
            decoder: Decoder::new(cfg, model.pp("decoder"))?,
            lm_head: Dense::new(cfg.d_model, cfg.decoder_vocab_size(), false, vb.pp("lm_head"))?,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &DalleBartConfig {
        &self.config
    }

    /// Runs the text encoder; returns `(batch, seq, d_model)` hidden states.
    pub fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        self.encoder.forward(input_ids, attention_mask)
    }

    /// Builds a fresh decoder cache from encoder states and their mask.
    pub fn decoder_cache(&self, encoder_states: &Tensor, attention_mask: &Tensor) -> Result<DecoderCache> {
        let layers = self
            .decoder
            .layers
            .iter()
            .map(|layer| {
                Ok(LayerCache {
                    self_kv: None,
                    cross_kv: layer.encoder_attn.key_value(encoder_states)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DecoderCache {
            layers,
            encoder_bias: padding_bias(attention_mask)?,
            offset: 0,
        })
    }

    /// Feeds `input_ids` (`(batch, t)`) to the decoder and returns the logits
    /// of the last position, `(batch, decoder_vocab_size)`, as f32.
    pub fn decode(&self, input_ids: &Tensor, cache: &mut DecoderCache) -> Result<Tensor> {
        if cache.offset + input_ids.dim(1)? > self.config.image_length {
            bail!(
                "decoder input exceeds the image length of {}",
                self.config.image_length
            );
        }
        let xs = self.decoder.forward(input_ids, cache)?;
        let last = xs.narrow(1, xs.dim(1)? - 1, 1)?.squeeze(1)?;
        Ok(self.lm_head.forward(&last)?.to_dtype(DType::F32)?)
    }

    /// Full-sequence logits, `(batch, t, vocab)`.
    #[cfg(test)]
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        let encoder_states = self.encode(input_ids, attention_mask)?;
        let mut cache = self.decoder_cache(&encoder_states, attention_mask)?;
        let xs = self.decoder.forward(decoder_input_ids, &mut cache)?;
        Ok(self.lm_head.forward(&xs)?.to_dtype(DType::F32)?)
    }
}
