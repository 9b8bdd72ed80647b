// ============================================================
// Layer 4 - Prompt Preprocessor
// ============================================================
// Turns SqlRecords into token sequences for causal-LM training.
//
// For every record:
//   1. Render the training prompt (domain::prompt)
//   2. Encode it with the tokenizer (no special tokens added)
//   3. Wrap it:  <bos> prompt tokens <eos>
//   4. Truncate to max_seq_len, keeping <eos> as the last token
//
// Padding is NOT done here: the batcher pads each batch to its
// own longest sample, which wastes far less compute than padding
// everything to max_seq_len.
//
// The pad token is the end-of-sequence token, so the model never
// needs a dedicated [PAD] embedding.
//
// Reference: tokenizers crate documentation

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::data::dataset::LmSample;
use crate::domain::{prompt, record::SqlRecord};

/// Ids of the special tokens the pipeline relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub bos_id: u32,
    pub eos_id: u32,
}

impl SpecialTokens {
    /// Look up the special tokens by their text in the tokenizer vocabulary.
    pub fn resolve(tokenizer: &Tokenizer, bos: &str, eos: &str) -> Result<Self> {
        let lookup = |tok: &str| {
            tokenizer
                .token_to_id(tok)
                .ok_or_else(|| anyhow!("Tokenizer has no '{tok}' token"))
        };
        Ok(Self { bos_id: lookup(bos)?, eos_id: lookup(eos)? })
    }

    /// Padding reuses the end-of-sequence token.
    pub fn pad_id(&self) -> u32 {
        self.eos_id
    }
}

pub struct Preprocessor<'a> {
    tokenizer:   &'a Tokenizer,
    special:     SpecialTokens,
    max_seq_len: usize,
}

impl<'a> Preprocessor<'a> {
    pub fn new(tokenizer: &'a Tokenizer, special: SpecialTokens, max_seq_len: usize) -> Self {
        Self { tokenizer, special, max_seq_len }
    }

    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenisation error: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    /// <bos> followed by the encoded text.
    pub fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.special.bos_id];
        ids.extend(self.encode_text(text)?);
        Ok(ids)
    }

    /// Tokenise one record. Returns None for records too short to train on.
    pub fn training_sample(&self, record: &SqlRecord) -> Result<Option<LmSample>> {
        self.sample_from_text(&prompt::training_prompt(record))
    }

    /// <bos> text <eos>, or None when the text itself encodes to
    /// fewer than two tokens.
    fn sample_from_text(&self, text: &str) -> Result<Option<LmSample>> {
        let tokens = self.encode_text(text)?;
        if tokens.len() < 2 {
            return Ok(None);
        }

        let mut ids = Vec::with_capacity(tokens.len() + 2);
        ids.push(self.special.bos_id);
        ids.extend(tokens);

        // Leave room for <eos> so truncated samples still end properly
        ids.truncate(self.max_seq_len.saturating_sub(1));
        ids.push(self.special.eos_id);
        Ok(Some(LmSample { input_ids: ids }))
    }

    /// Tokenise every record, skipping the ones that are too short.
    pub fn build_samples(&self, records: &[SqlRecord]) -> Result<Vec<LmSample>> {
        let mut samples   = Vec::with_capacity(records.len());
        let mut truncated = 0usize;

        for record in records {
            match self.training_sample(record)? {
                Some(sample) => {
                    if sample.len() == self.max_seq_len {
                        truncated += 1;
                    }
                    samples.push(sample);
                }
                None => tracing::warn!("Skipping record whose prompt is under 2 tokens: {:?}", record.question),
            }
        }

        if truncated > 0 {
            tracing::warn!(
                "{} of {} prompts reached max_seq_len={} and may be truncated",
                truncated,
                samples.len(),
                self.max_seq_len
            );
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::tokenizer_store::{build_tokenizer, BOS_TOKEN, EOS_TOKEN};

    fn record() -> SqlRecord {
        SqlRecord::new(
            "CREATE TABLE head (age INTEGER)",
            "How many heads are older than 56 ?",
            "SELECT COUNT(*) FROM head WHERE age > 56",
        )
    }

    fn tokenizer() -> Tokenizer {
        build_tokenizer(&[prompt::training_prompt(&record())], 1000).unwrap()
    }

    #[test]
    fn test_sample_is_wrapped_in_bos_and_eos() {
        let tok     = tokenizer();
        let special = SpecialTokens::resolve(&tok, BOS_TOKEN, EOS_TOKEN).unwrap();
        let pre     = Preprocessor::new(&tok, special, 512);

        let sample = pre.training_sample(&record()).unwrap().unwrap();
        assert_eq!(sample.input_ids.first(), Some(&special.bos_id));
        assert_eq!(sample.input_ids.last(),  Some(&special.eos_id));
        assert!(sample.len() > 10);
    }

    #[test]
    fn test_truncation_keeps_eos() {
        let tok     = tokenizer();
        let special = SpecialTokens::resolve(&tok, BOS_TOKEN, EOS_TOKEN).unwrap();
        let pre     = Preprocessor::new(&tok, special, 8);

        let sample = pre.training_sample(&record()).unwrap().unwrap();
        assert_eq!(sample.len(), 8);
        assert_eq!(sample.input_ids.last(), Some(&special.eos_id));
    }

    #[test]
    fn test_inference_prompt_is_prefix_of_training_tokens() {
        let tok     = tokenizer();
        let special = SpecialTokens::resolve(&tok, BOS_TOKEN, EOS_TOKEN).unwrap();
        let pre     = Preprocessor::new(&tok, special, 512);

        let rec   = record();
        let full  = pre.training_sample(&rec).unwrap().unwrap();
        let query = pre.encode_prompt(&prompt::inference_prompt(&rec.context, &rec.question)).unwrap();
        assert!(full.input_ids.starts_with(&query));
    }

    #[test]
    fn test_prompt_under_two_tokens_is_skipped() {
        let tok     = tokenizer();
        let special = SpecialTokens::resolve(&tok, BOS_TOKEN, EOS_TOKEN).unwrap();
        let pre     = Preprocessor::new(&tok, special, 512);

        assert_eq!(pre.sample_from_text("").unwrap(), None);
        assert_eq!(pre.sample_from_text("  SELECT  ").unwrap(), None);

        let sample = pre.sample_from_text("SELECT age").unwrap().unwrap();
        assert_eq!(sample.len(), 4);
    }

    #[test]
    fn test_unknown_special_token_is_an_error() {
        let tok = tokenizer();
        assert!(SpecialTokens::resolve(&tok, "<s>", EOS_TOKEN).is_err());
    }
}
