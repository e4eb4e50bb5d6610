use anyhow::{Error, Result};
use candle_core::{Device, Tensor};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use super::text;

const PAD_TOKEN: &str = "<pad>";
const FALLBACK_PAD_ID: u32 = 1;

/// Token ids and attention mask for one text, padded to the encoder length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedText {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl TokenizedText {
    /// `(1, len)` id and mask tensors on `device`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let ids = Tensor::new(self.input_ids.as_slice(), device)?.unsqueeze(0)?;
        let mask = Tensor::new(self.attention_mask.as_slice(), device)?.unsqueeze(0)?;
        Ok((ids, mask))
    }
}

/// A prompt together with the empty prompt used for super conditioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPrompt {
    pub cond: TokenizedText,
    pub uncond: TokenizedText,
}

pub struct DalleProcessor {
    tokenizer: Tokenizer,
    normalize: bool,
}

impl DalleProcessor {
    pub fn new(mut tokenizer: Tokenizer, max_text_length: usize, normalize: bool) -> Result<Self> {
        let pad_id = tokenizer.token_to_id(PAD_TOKEN).unwrap_or(FALLBACK_PAD_ID);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_text_length,
                ..Default::default()
            }))
            .map_err(Error::msg)?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_text_length),
            pad_id,
            pad_token: PAD_TOKEN.to_string(),
            ..Default::default()
        }));
        Ok(Self {
            tokenizer,
            normalize,
        })
    }

    pub fn encode_text(&self, text: &str) -> Result<TokenizedText> {
        let text = if self.normalize {
            text::normalize(text)
        } else {
            text.to_string()
        };
        let encoding = self.tokenizer.encode(text, true).map_err(Error::msg)?;
        Ok(TokenizedText {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    pub fn process(&self, prompt: &str) -> Result<TokenizedPrompt> {
        Ok(TokenizedPrompt {
            cond: self.encode_text(prompt)?,
            uncond: self.encode_text("")?,
        })
    }
}
