use crate::error::EmbeddingError;
use crate::models::TextUnit;
use tiktoken_rs::CoreBPE;
use tracing::{debug, info};

/// Byte-pair encodings available for token counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingType {
    #[default]
    Cl100kBase,
    P50kBase,
    R50kBase,
}

impl EncodingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingType::Cl100kBase => "cl100k_base",
            EncodingType::P50kBase => "p50k_base",
            EncodingType::R50kBase => "r50k_base",
        }
    }
}

impl std::str::FromStr for EncodingType {
    type Err = EmbeddingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cl100k_base" => Ok(EncodingType::Cl100kBase),
            "p50k_base" => Ok(EncodingType::P50kBase),
            "r50k_base" => Ok(EncodingType::R50kBase),
            other => Err(EmbeddingError::Tokenizer(format!("unknown encoding {other}"))),
        }
    }
}

pub struct TextTokenizer {
    encoding: EncodingType,
    bpe: CoreBPE,
}

impl TextTokenizer {
    pub fn new(encoding: EncodingType) -> Result<Self, EmbeddingError> {
        let bpe = match encoding {
            EncodingType::Cl100kBase => tiktoken_rs::cl100k_base(),
            EncodingType::P50kBase => tiktoken_rs::p50k_base(),
            EncodingType::R50kBase => tiktoken_rs::r50k_base(),
        }
        .map_err(|error| {
            EmbeddingError::Tokenizer(format!(
                "failed to initialize encoding {}: {error}",
                encoding.as_str()
            ))
        })?;

        debug!(encoding = encoding.as_str(), "tokenizer ready");
        Ok(Self { encoding, bpe })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Checks every unit against `max_tokens` before anything is sent out.
    ///
    /// Fails on the first unit over the limit and returns the total token
    /// count otherwise.
    pub fn validate(&self, units: &[TextUnit], max_tokens: usize) -> Result<usize, EmbeddingError> {
        let mut total_tokens = 0usize;

        for unit in units {
            let token_count = self.count_tokens(&unit.content);
            if token_count > max_tokens {
                return Err(EmbeddingError::TokenLimitExceeded {
                    label: unit.filename.clone(),
                    token_count,
                    max_tokens,
                });
            }
            total_tokens += token_count;
        }

        info!(
            encoding = self.encoding.as_str(),
            texts = units.len(),
            total_tokens,
            "validated token counts"
        );
        Ok(total_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> TextTokenizer {
        TextTokenizer::new(EncodingType::Cl100kBase).expect("cl100k_base should load")
    }

    #[test]
    fn token_counts_are_deterministic() {
        let tokenizer = tokenizer();
        let text = "customer_orders: one row per purchase with timestamps";
        assert_eq!(tokenizer.count_tokens(text), tokenizer.count_tokens(text));
        assert!(tokenizer.count_tokens(text) > 0);
        assert_eq!(tokenizer.count_tokens(""), 0);
    }

    #[test]
    fn text_at_the_limit_passes() {
        let tokenizer = tokenizer();
        let unit = TextUnit::new("inventory", "inventory: stock levels per warehouse");
        let limit = tokenizer.count_tokens(&unit.content);

        let total = tokenizer
            .validate(std::slice::from_ref(&unit), limit)
            .expect("text at the limit is valid");
        assert_eq!(total, limit);
    }

    #[test]
    fn text_over_the_limit_names_its_label() {
        let tokenizer = tokenizer();
        let short = TextUnit::new("short", "sales");
        let long = TextUnit::new("long_table", "sales transactions per store and per day");
        let limit = tokenizer.count_tokens(&long.content) - 1;

        let error = tokenizer
            .validate(&[short, long], limit)
            .expect_err("second text exceeds the limit");

        match error {
            EmbeddingError::TokenLimitExceeded {
                label,
                token_count,
                max_tokens,
            } => {
                assert_eq!(label, "long_table");
                assert_eq!(token_count, limit + 1);
                assert_eq!(max_tokens, limit);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn encoding_names_parse() {
        assert_eq!("p50k_base".parse::<EncodingType>().ok(), Some(EncodingType::P50kBase));
        assert!("gpt2".parse::<EncodingType>().is_err());
    }
}
