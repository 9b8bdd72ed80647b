// ============================================================
// Layer 6 - Tokenizer Store
// ============================================================
// Loads and saves tokenizer.json next to model checkpoints, and
// builds a word-level tokenizer for freshly initialised bases.
//
// Building counts pieces with the same Whitespace pre-tokenizer the
// built tokenizer uses, writes the tokenizer JSON and loads it back.
//
// Layout of a built tokenizer:
//   pre_tokenizer   Whitespace   (\w+ | [^\w\s]+)
//   model           WordLevel, unknown words → <unk>
//   special tokens  <unk> = 0, <bos> = 1, <eos> = 2
//
// No normalizer: SQL identifiers and string literals keep their
// case, so generated queries can reproduce them exactly.

use anyhow::{anyhow, Context, Result};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokenizers::{
    pre_tokenizers::whitespace::Whitespace,
    OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer, Tokenizer,
};

pub const UNK_TOKEN: &str = "<unk>";
pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";

const SPECIAL_TOKENS: [&str; 3] = [UNK_TOKEN, BOS_TOKEN, EOS_TOKEN];

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Reads and writes `tokenizer.json` inside a checkpoint directory.
pub struct TokenizerStore {
    dir: PathBuf,
}

impl TokenizerStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(TOKENIZER_FILE)
    }

    pub fn load(&self) -> Result<Tokenizer> {
        let path = self.path();
        Tokenizer::from_file(&path)
            .map_err(|e| anyhow!("Cannot load tokenizer from '{}': {e}", path.display()))
    }

    pub fn save(&self, tokenizer: &Tokenizer) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;
        let path = self.path();
        tokenizer
            .save(&path, true)
            .map_err(|e| anyhow!("Cannot write tokenizer to '{}': {e}", path.display()))?;
        tracing::debug!("Saved tokenizer to '{}'", path.display());
        Ok(())
    }
}

/// Pieces of `text` as the Whitespace pre-tokenizer splits them at
/// encode time, so every counted piece is one the tokenizer can look up.
pub fn pre_tokenize(text: &str) -> Result<Vec<String>> {
    let mut pretokenized = PreTokenizedString::from(text);
    Whitespace::default()
        .pre_tokenize(&mut pretokenized)
        .map_err(|e| anyhow!("Cannot pre-tokenize text: {e}"))?;
    Ok(pretokenized
        .get_splits(OffsetReferential::Original, OffsetType::Byte)
        .into_iter()
        .map(|(piece, _, _)| piece.to_string())
        .collect())
}

/// Build a word-level tokenizer holding the `vocab_size` most frequent
/// pieces of `texts` (special tokens included in the count).
pub fn build_tokenizer(texts: &[String], vocab_size: usize) -> Result<Tokenizer> {
    // ── Step 1: Count pieces ──────────────────────────────────────────────────
    let mut freq: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for piece in pre_tokenize(text)? {
            *freq.entry(piece).or_insert(0) += 1;
        }
    }

    // Most frequent first; ties broken alphabetically so builds are reproducible
    let mut words: Vec<(String, usize)> = freq
        .into_iter()
        .filter(|(w, _)| !SPECIAL_TOKENS.contains(&w.as_str()))
        .collect();
    words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    words.truncate(vocab_size.saturating_sub(SPECIAL_TOKENS.len()));

    // ── Step 2: Vocab with special tokens first ───────────────────────────────
    let mut vocab = serde_json::Map::new();
    for (id, tok) in SPECIAL_TOKENS.iter().enumerate() {
        vocab.insert(tok.to_string(), serde_json::json!(id));
    }
    for (word, _) in &words {
        let id = vocab.len();
        vocab.insert(word.clone(), serde_json::json!(id));
    }

    let added_tokens: Vec<serde_json::Value> = SPECIAL_TOKENS
        .iter()
        .enumerate()
        .map(|(id, tok)| serde_json::json!({
            "id": id, "content": tok, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        }))
        .collect();

    // ── Step 3: HuggingFace tokenizer JSON ────────────────────────────────────
    let tokenizer_json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": UNK_TOKEN
        }
    });

    tracing::info!("Built word-level tokenizer with {} entries", vocab.len());

    Tokenizer::from_str(&tokenizer_json.to_string())
        .map_err(|e| anyhow!("Cannot build tokenizer: {e}"))
}

/// Turn generated ids back into text, dropping special tokens.
/// Word-level tokenizers carry no spacing, so pieces come back
/// separated by single spaces.
pub fn decode(tokenizer: &Tokenizer, ids: &[u32]) -> Result<String> {
    tokenizer
        .decode(ids, true)
        .map_err(|e| anyhow!("Cannot decode generated ids: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_tokenize_splits_words_and_punctuation() {
        assert_eq!(
            pre_tokenize("SELECT COUNT(*) FROM head WHERE age > 56").unwrap(),
            vec!["SELECT", "COUNT", "(*)", "FROM", "head", "WHERE", "age", ">", "56"]
        );
        assert_eq!(pre_tokenize("### Answer:\n").unwrap(), vec!["###", "Answer", ":"]);
        assert_eq!(pre_tokenize("snake_case  x").unwrap(), vec!["snake_case", "x"]);
        assert!(pre_tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn test_build_corpus_encodes_without_unk() {
        // Combining accent: part of the word for the Whitespace regex
        let texts = vec![
            "Who is Jose\u{301} ?".to_string(),
            "SELECT name FROM t WHERE x = 'na\u{ef}ve_\u{203f}v'".to_string(),
        ];
        let tok = build_tokenizer(&texts, 100).unwrap();
        let unk = tok.token_to_id(UNK_TOKEN).unwrap();

        for text in &texts {
            let enc = tok.encode(text.as_str(), false).unwrap();
            assert!(!enc.get_ids().is_empty());
            assert!(
                !enc.get_ids().contains(&unk),
                "{text:?} encoded to {:?}",
                enc.get_tokens()
            );
        }
    }

    #[test]
    fn test_special_tokens_have_fixed_ids() {
        let tok = build_tokenizer(&["a b c".to_string()], 100).unwrap();
        assert_eq!(tok.token_to_id(UNK_TOKEN), Some(0));
        assert_eq!(tok.token_to_id(BOS_TOKEN), Some(1));
        assert_eq!(tok.token_to_id(EOS_TOKEN), Some(2));
    }

    #[test]
    fn test_vocab_size_cap_keeps_most_frequent() {
        let texts = vec!["x x x y y z".to_string()];
        let tok   = build_tokenizer(&texts, 5).unwrap();
        assert_eq!(tok.get_vocab_size(true), 5);
        assert!(tok.token_to_id("x").is_some());
        assert!(tok.token_to_id("y").is_some());
        assert!(tok.token_to_id("z").is_none());
    }

    #[test]
    fn test_encoding_uses_unk_for_unseen_words() {
        let tok = build_tokenizer(&["SELECT name FROM t".to_string()], 100).unwrap();
        let enc = tok.encode("SELECT age FROM t", false).unwrap();
        assert_eq!(enc.get_ids().len(), 4);
        assert_eq!(enc.get_ids()[1], 0);
    }

    #[test]
    fn test_decode_skips_special_tokens() {
        let tok = build_tokenizer(&["SELECT name FROM t".to_string()], 100).unwrap();
        let ids = tok.encode("SELECT name FROM t", false).unwrap().get_ids().to_vec();
        let mut framed = ids.clone();
        framed.push(2);
        framed.insert(0, 1);
        assert_eq!(decode(&tok, &framed).unwrap(), "SELECT name FROM t");
    }

    #[test]
    fn test_store_round_trip() {
        let dir   = tempfile::tempdir().unwrap();
        let store = TokenizerStore::new(dir.path());
        let tok   = build_tokenizer(&["CREATE TABLE head".to_string()], 50).unwrap();

        store.save(&tok).unwrap();
        let back = store.load().unwrap();
        assert_eq!(back.get_vocab(true), tok.get_vocab(true));
    }
}
