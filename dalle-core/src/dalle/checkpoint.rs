//! Flax checkpoints (`flax_model.msgpack`) read into flat tensor maps.
//!
//! Parameter paths are joined with `.`, so `model/encoder/embed_tokens/embedding`
//! becomes `model.encoder.embed_tokens.embedding`. Arrays keep their Flax
//! layout: dense kernels are `(in, out)`, conv kernels `(h, w, in, out)`.
use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rmpv::Value;

/// msgpack extension type flax uses for numpy arrays.
const NDARRAY_EXT: i8 = 1;
/// Marker of arrays flax split into chunks because they exceeded 1GiB.
const CHUNKED_ARRAY_KEY: &str = "__msgpack_chunked_array__";
/// Layer stacks written by `nn.scan`, one leading entry per layer.
const SCANNED_STACKS: [(&str, &str); 2] = [
    ("FlaxBartEncoderLayers", "FlaxBartEncoderLayer"),
    ("FlaxBartDecoderLayers", "FlaxBartDecoderLayer"),
];

/// Where the parameters of a model come from when a replica is built.
pub(crate) enum Checkpoint {
    /// Host copy of every parameter, moved to the replica device on load.
    Tensors(HashMap<String, Tensor>),
    #[cfg(test)]
    Random(candle_nn::VarMap),
}

impl Checkpoint {
    pub(crate) fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        match self {
            Self::Tensors(tensors) => Ok(VarBuilder::from_tensors(tensors.clone(), dtype, device)),
            #[cfg(test)]
            Self::Random(varmap) => Ok(VarBuilder::from_varmap(varmap, dtype, device)),
        }
    }
}

pub(crate) fn load_msgpack(path: &Path) -> Result<HashMap<String, Tensor>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_msgpack(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}

pub(crate) fn parse_msgpack(bytes: &[u8]) -> Result<HashMap<String, Tensor>> {
    let root = rmpv::decode::read_value(&mut &bytes[..])?;
    let mut tensors = HashMap::new();
    flatten(root, String::new(), &mut tensors)?;
    Ok(tensors)
}

fn flatten(value: Value, prefix: String, out: &mut HashMap<String, Tensor>) -> Result<()> {
    match value {
        Value::Map(entries) if is_chunked(&entries) => {
            let tensor = unchunk(entries).with_context(|| format!("bad chunked array `{prefix}`"))?;
            out.insert(prefix, tensor);
        }
        Value::Map(entries) => {
            for (key, value) in entries {
                let key = key
                    .as_str()
                    .ok_or_else(|| anyhow!("non-string key under `{prefix}`"))?;
                let path = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(value, path, out)?;
            }
        }
        Value::Ext(NDARRAY_EXT, data) => {
            let tensor = decode_ndarray(&data).with_context(|| format!("bad array `{prefix}`"))?;
            out.insert(prefix, tensor);
        }
        _ => bail!("unexpected msgpack value at `{prefix}`"),
    }
    Ok(())
}

fn is_chunked(entries: &[(Value, Value)]) -> bool {
    entries
        .iter()
        .any(|(key, _)| key.as_str() == Some(CHUNKED_ARRAY_KEY))
}

fn as_usize(value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|dim| dim as usize)
        .ok_or_else(|| anyhow!("bad dimension {value}"))
}

/// Flax stores tuples inside chunked arrays as maps keyed by their index.
fn index_map(value: Value) -> Result<Vec<Value>> {
    let Value::Map(entries) = value else {
        bail!("expected an index map");
    };
    let mut items = entries
        .into_iter()
        .map(|(key, value)| {
            let index = key
                .as_str()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| anyhow!("bad index key {key}"))?;
            Ok((index, value))
        })
        .collect::<Result<Vec<_>>>()?;
    items.sort_by_key(|(index, _)| *index);
    Ok(items.into_iter().map(|(_, value)| value).collect())
}

fn unchunk(entries: Vec<(Value, Value)>) -> Result<Tensor> {
    let mut shape = None;
    let mut chunks = Vec::new();
    for (key, value) in entries {
        match key.as_str() {
            Some("shape") => {
                let dims = index_map(value)?;
                shape = Some(dims.iter().map(as_usize).collect::<Result<Vec<_>>>()?);
            }
            Some("chunks") => {
                for chunk in index_map(value)? {
                    match chunk {
                        Value::Ext(NDARRAY_EXT, data) => chunks.push(decode_ndarray(&data)?),
                        _ => bail!("chunk is not an array"),
                    }
                }
            }
            _ => {}
        }
    }
    let shape = shape.ok_or_else(|| anyhow!("chunked array without a shape"))?;
    Ok(Tensor::cat(&chunks, 0)?.reshape(shape)?)
}

/// Decodes flax's `(shape, dtype name, raw bytes)` array payload.
fn decode_ndarray(data: &[u8]) -> Result<Tensor> {
    let header = rmpv::decode::read_value(&mut &data[..])?;
    let Value::Array(fields) = header else {
        bail!("array payload is not a tuple");
    };
    let [shape, dtype, buffer] = fields.as_slice() else {
        bail!("array payload has {} fields, expected 3", fields.len());
    };
    let shape = shape
        .as_array()
        .ok_or_else(|| anyhow!("array shape is not a tuple"))?
        .iter()
        .map(as_usize)
        .collect::<Result<Vec<_>>>()?;
    let dtype = match dtype.as_str() {
        Some("float32") => DType::F32,
        Some("float16") => DType::F16,
        Some("bfloat16") => DType::BF16,
        other => bail!("unsupported array dtype {other:?}"),
    };
    let buffer = buffer
        .as_slice()
        .ok_or_else(|| anyhow!("array data is not binary"))?;
    let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
    if buffer.len() != expected {
        bail!("array of shape {shape:?} needs {expected} bytes, got {}", buffer.len());
    }
    Ok(Tensor::from_raw_buffer(buffer, dtype, &shape, &Device::Cpu)?)
}

/// Splits the layer stacks saved by `nn.scan`
/// (`layers.FlaxBartEncoderLayers.*`, leading axis = layer) into one entry
/// per layer, `layers.FlaxBartEncoderLayer_{i}.*`. Other names pass through.
pub(crate) fn unstack_scanned_layers(
    tensors: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let segments = name.split('.').collect::<Vec<_>>();
        let stack = segments.iter().enumerate().find_map(|(pos, segment)| {
            SCANNED_STACKS
                .iter()
                .find(|(stacked, _)| segment == stacked)
                .map(|(_, single)| (pos, *single))
        });
        let Some((pos, single)) = stack else {
            out.insert(name, tensor);
            continue;
        };
        for layer in 0..tensor.dim(0)? {
            let scope = format!("{single}_{layer}");
            let renamed = segments
                .iter()
                .enumerate()
                .map(|(i, segment)| if i == pos { scope.as_str() } else { *segment })
                .collect::<Vec<_>>()
                .join(".");
            out.insert(renamed, tensor.get(layer)?);
        }
    }
    Ok(out)
}
