//! VQGAN decoder: turns a grid of codebook indices back into pixels.
//!
//! Only the decoding half of the model is built. Parameters use the names and
//! layouts of the Flax VQGAN checkpoint (`quantize.embedding.embedding`,
//! `decoder.up_{level}.block_{i}.conv1.kernel`, ...); conv kernels are stored
//! `(h, w, in, out)` and transposed when loaded.
use anyhow::{bail, Result};
use candle_core::{Module, Tensor};
use candle_nn::{init, Conv2d, Conv2dConfig, Embedding, GroupNorm, Init, VarBuilder};
use serde::Deserialize;

const NORM_GROUPS: usize = 32;
const NORM_EPS: f64 = 1e-6;

fn default_out_ch() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct VqganConfig {
    pub ch: usize,
    #[serde(default = "default_out_ch")]
    pub out_ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub attn_resolutions: Vec<usize>,
    pub resolution: usize,
    pub z_channels: usize,
    pub n_embed: usize,
    pub embed_dim: usize,
}

impl VqganConfig {
    /// Side length of the token grid, e.g. 16 for a 256px f16 model.
    pub fn latent_size(&self) -> usize {
        self.resolution >> (self.ch_mult.len() - 1)
    }

    /// Number of tokens needed for one image.
    pub fn tokens_per_image(&self) -> usize {
        self.latent_size() * self.latent_size()
    }
}

/// Same-padded Flax `nn.Conv`.
fn conv(in_c: usize, out_c: usize, kernel: usize, vb: VarBuilder) -> Result<Conv2d> {
    let hwio = vb.get_with_hints((kernel, kernel, in_c, out_c), "kernel", init::DEFAULT_KAIMING_NORMAL)?;
    let weight = hwio.permute((3, 2, 0, 1))?.contiguous()?;
    let bias = vb.get(out_c, "bias")?;
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, Some(bias), cfg))
}

fn norm(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    let scale = vb.get_with_hints(channels, "scale", Init::Const(1.))?;
    let bias = vb.get(channels, "bias")?;
    Ok(GroupNorm::new(scale, bias, channels, NORM_GROUPS.min(channels), NORM_EPS)?)
}

#[derive(Debug, Clone)]
struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let nin_shortcut = if in_c != out_c {
            Some(conv(in_c, out_c, 1, vb.pp("nin_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: norm(in_c, vb.pp("norm1"))?,
            conv1: conv(in_c, out_c, 3, vb.pp("conv1"))?,
            norm2: norm(out_c, vb.pp("norm2"))?,
            conv2: conv(out_c, out_c, 3, vb.pp("conv2"))?,
            nin_shortcut,
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = xs.apply(&self.norm1)?.silu()?.apply(&self.conv1)?;
        let h = h.apply(&self.norm2)?.silu()?.apply(&self.conv2)?;
        match &self.nin_shortcut {
            Some(shortcut) => xs.apply(shortcut)? + h,
            None => xs + h,
        }
    }
}

#[derive(Debug, Clone)]
struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl AttnBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: norm(channels, vb.pp("norm"))?,
            q: conv(channels, channels, 1, vb.pp("q"))?,
            k: conv(channels, channels, 1, vb.pp("k"))?,
            v: conv(channels, channels, 1, vb.pp("v"))?,
            proj_out: conv(channels, channels, 1, vb.pp("proj_out"))?,
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let normed = xs.apply(&self.norm)?;
        let q = normed.apply(&self.q)?.reshape((b, c, h * w))?.transpose(1, 2)?;
        let k = normed.apply(&self.k)?.reshape((b, c, h * w))?;
        let v = normed.apply(&self.v)?.reshape((b, c, h * w))?;
        let weights = (q.matmul(&k)? * (c as f64).powf(-0.5))?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let out = v.matmul(&weights.t()?)?.reshape((b, c, h, w))?;
        xs + out.apply(&self.proj_out)?
    }
}

#[derive(Debug, Clone)]
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Conv2d>,
}

#[derive(Debug, Clone)]
pub struct VqganDecoder {
    embedding: Embedding,
    post_quant_conv: Conv2d,
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    /// Highest resolution level last, in execution order.
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    config: VqganConfig,
}

impl VqganDecoder {
    pub fn new(cfg: &VqganConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.ch_mult.is_empty() {
            bail!("VQGAN config needs at least one channel multiplier");
        }
        let levels = cfg.ch_mult.len();
        let dec = vb.pp("decoder");
        let mut block_in = cfg.ch * cfg.ch_mult[levels - 1];
        let mut curr_res = cfg.latent_size();

        let conv_in = conv(cfg.z_channels, block_in, 3, dec.pp("conv_in"))?;
        let mid_block_1 = ResnetBlock::new(block_in, block_in, dec.pp("mid.block_1"))?;
        let mid_attn_1 = AttnBlock::new(block_in, dec.pp("mid.attn_1"))?;
        let mid_block_2 = ResnetBlock::new(block_in, block_in, dec.pp("mid.block_2"))?;

        let mut up = Vec::with_capacity(levels);
        for level in (0..levels).rev() {
            let vb_level = dec.pp(format!("up_{level}"));
            let block_out = cfg.ch * cfg.ch_mult[level];
            let mut blocks = Vec::with_capacity(cfg.num_res_blocks + 1);
            let mut attns = Vec::new();
            for i in 0..=cfg.num_res_blocks {
                blocks.push(ResnetBlock::new(block_in, block_out, vb_level.pp(format!("block_{i}")))?);
                block_in = block_out;
                if cfg.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(block_in, vb_level.pp(format!("attn_{i}")))?);
                }
            }
            let upsample = if level != 0 {
                curr_res *= 2;
                Some(conv(block_in, block_in, 3, vb_level.pp("upsample.conv"))?)
            } else {
                None
            };
            up.push(UpLevel {
                blocks,
                attns,
                upsample,
            });
        }

        let codebook = vb.get_with_hints(
            (cfg.n_embed, cfg.embed_dim),
            "quantize.embedding.embedding",
            Init::Randn {
                mean: 0.,
                stdev: 1.,
            },
        )?;
        Ok(Self {
            embedding: Embedding::new(codebook, cfg.embed_dim),
            post_quant_conv: conv(cfg.embed_dim, cfg.z_channels, 1, vb.pp("post_quant_conv"))?,
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            up,
            norm_out: norm(block_in, dec.pp("norm_out"))?,
            conv_out: conv(block_in, cfg.out_ch, 3, dec.pp("conv_out"))?,
            config: cfg.clone(),
        })
    }

    /// Decodes `(batch, tokens_per_image)` codebook indices into
    /// `(batch, out_ch, resolution, resolution)` pixels.
    pub fn decode_code(&self, indices: &Tensor) -> Result<Tensor> {
        let (b, len) = indices.dims2()?;
        let side = self.config.latent_size();
        if len != side * side {
            bail!("expected {} tokens per image, got {len}", side * side);
        }
        let z = self
            .embedding
            .forward(indices)?
            .reshape((b, side, side, self.config.embed_dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let z = z.apply(&self.post_quant_conv)?;

        let mut h = z.apply(&self.conv_in)?;
        h = h.apply(&self.mid_block_1)?;
        h = h.apply(&self.mid_attn_1)?;
        h = h.apply(&self.mid_block_2)?;
        for level in &self.up {
            for (i, block) in level.blocks.iter().enumerate() {
                h = h.apply(block)?;
                if let Some(attn) = level.attns.get(i) {
                    h = h.apply(attn)?;
                }
            }
            if let Some(upsample) = &level.upsample {
                let (_, _, height, width) = h.dims4()?;
                h = h.upsample_nearest2d(height * 2, width * 2)?.apply(upsample)?;
            }
        }
        let h = h.apply(&self.norm_out)?.silu()?;
        Ok(h.apply(&self.conv_out)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dalle::checkpoint::tests::load_fixture;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> VqganConfig {
        serde_json::from_value(serde_json::json!({
            "ch": 4,
            "out_ch": 3,
            "ch_mult": [1, 2],
            "num_res_blocks": 1,
            "attn_resolutions": [4],
            "resolution": 8,
            "z_channels": 4,
            "n_embed": 16,
            "embed_dim": 4
        }))
        .unwrap()
    }

    #[derive(Default)]
    struct Params(Vec<(String, Tensor)>);

    impl Params {
        fn add(&mut self, name: &str, shape: &[usize]) {
            let tensor = Tensor::randn(0f32, 0.2, shape.to_vec(), &Device::Cpu).unwrap();
            self.0.push((name.to_string(), tensor));
        }

        fn conv(&mut self, name: &str, k: usize, i: usize, o: usize) {
            self.add(&format!("{name}/kernel"), &[k, k, i, o]);
            self.add(&format!("{name}/bias"), &[o]);
        }

        fn norm(&mut self, name: &str, c: usize) {
            self.add(&format!("{name}/scale"), &[c]);
            self.add(&format!("{name}/bias"), &[c]);
        }

        fn block(&mut self, name: &str, i: usize, o: usize) {
            self.norm(&format!("{name}/norm1"), i);
            self.conv(&format!("{name}/conv1"), 3, i, o);
            self.norm(&format!("{name}/norm2"), o);
            self.conv(&format!("{name}/conv2"), 3, o, o);
            if i != o {
                self.conv(&format!("{name}/nin_shortcut"), 1, i, o);
            }
        }

        fn attn(&mut self, name: &str, c: usize) {
            self.norm(&format!("{name}/norm"), c);
            for proj in ["q", "k", "v", "proj_out"] {
                self.conv(&format!("{name}/{proj}"), 1, c, c);
            }
        }
    }

    /// Parameters of the Flax VQGAN decoder for `tiny_config`, with the paths
    /// and shapes vqgan-jax saves.
    pub(crate) fn flax_fixture() -> Vec<(String, Tensor)> {
        let mut p = Params::default();
        p.add("quantize/embedding/embedding", &[16, 4]);
        p.conv("post_quant_conv", 1, 4, 4);
        p.conv("decoder/conv_in", 3, 4, 8);
        p.block("decoder/mid/block_1", 8, 8);
        p.attn("decoder/mid/attn_1", 8);
        p.block("decoder/mid/block_2", 8, 8);
        for i in 0..2 {
            p.block(&format!("decoder/up_1/block_{i}"), 8, 8);
            p.attn(&format!("decoder/up_1/attn_{i}"), 8);
        }
        p.conv("decoder/up_1/upsample/conv", 3, 8, 8);
        p.block("decoder/up_0/block_0", 8, 4);
        p.block("decoder/up_0/block_1", 4, 4);
        p.norm("decoder/norm_out", 4);
        p.conv("decoder/conv_out", 3, 4, 3);
        p.0
    }

    fn codes() -> Tensor {
        Tensor::arange(0u32, 16, &Device::Cpu)
            .unwrap()
            .reshape((1, 16))
            .unwrap()
            .repeat((2, 1))
            .unwrap()
    }

    #[test]
    fn mega_config_geometry() {
        let cfg: VqganConfig = serde_json::from_value(serde_json::json!({
            "ch": 128, "out_ch": 3, "in_channels": 3, "num_res_blocks": 2,
            "resolution": 256, "z_channels": 256, "ch_mult": [1, 1, 2, 2, 4],
            "attn_resolutions": [16], "n_embed": 16384, "embed_dim": 256,
            "dropout": 0.0, "double_z": false, "resamp_with_conv": true, "give_pre_end": false
        }))
        .unwrap();
        assert_eq!(cfg.latent_size(), 16);
        assert_eq!(cfg.tokens_per_image(), 256);
    }

    #[test]
    fn decodes_to_full_resolution() {
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = VqganDecoder::new(&cfg, vb).unwrap();
        let pixels = decoder.decode_code(&codes()).unwrap();
        assert_eq!(pixels.dims(), &[2, 3, 8, 8]);
    }

    #[test]
    fn loads_flax_checkpoint_layout() {
        let vb = VarBuilder::from_tensors(load_fixture(&flax_fixture()), DType::F32, &Device::Cpu);
        let decoder = VqganDecoder::new(&tiny_config(), vb).unwrap();
        let pixels = decoder.decode_code(&codes()).unwrap();
        assert_eq!(pixels.dims(), &[2, 3, 8, 8]);
        let finite = pixels.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(finite.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn conv_kernels_are_read_as_hwio() {
        let mut params = flax_fixture();
        let (_, conv_in) = params
            .iter_mut()
            .find(|(name, _)| name == "decoder/conv_in/kernel")
            .unwrap();
        // an OIHW kernel, (8, 4, 3, 3)
        *conv_in = conv_in.permute((3, 2, 0, 1)).unwrap().contiguous().unwrap();
        let vb = VarBuilder::from_tensors(load_fixture(&params), DType::F32, &Device::Cpu);
        assert!(VqganDecoder::new(&tiny_config(), vb).is_err());
    }

    #[test]
    fn wrong_token_count_is_rejected() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = VqganDecoder::new(&cfg, vb).unwrap();
        let indices = Tensor::zeros((1, 15), DType::U32, &Device::Cpu).unwrap();
        assert!(decoder.decode_code(&indices).is_err());
    }
}
