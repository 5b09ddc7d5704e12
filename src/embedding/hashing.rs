//! Model-free encoder based on signed feature hashing.
//!
//! Word unigrams and character trigrams are hashed (FNV-1a, stable across
//! builds so stored vectors stay comparable) into a fixed number of buckets and
//! L2-normalized. Lexically close payloads land close together; it carries no
//! deeper semantics than that.

use anyhow::Result;

use super::{l2_normalize, SemanticEncoder};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub struct HashingEncoder {
    dimensions: usize,
}

impl HashingEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let bucket = (h % self.dimensions as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl SemanticEncoder for HashingEncoder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let normalized = text.to_lowercase();
        let words: Vec<&str> = normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        anyhow::ensure!(!words.is_empty(), "payload has no encodable tokens");

        let mut v = vec![0.0f32; self.dimensions];
        for word in &words {
            self.add_feature(&mut v, word, 1.0);
            let chars: Vec<char> = format!("#{word}#").chars().collect();
            for gram in chars.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut v, &gram, 0.5);
            }
        }

        Ok(l2_normalize(&v))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> String {
        format!("hashing-{}", self.dimensions)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}
