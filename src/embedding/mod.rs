//! Semantic encoder: payload text to fixed-length vectors.
//!
//! Provides the [`SemanticEncoder`] trait, the ONNX [`local`] provider
//! (all-MiniLM-L6-v2, 384 dimensions) and the model-free [`hashing`] provider.
//! Providers are created via [`create_encoder`] from configuration.

pub mod hashing;
pub mod local;

use anyhow::Result;

/// Number of dimensions produced by all-MiniLM-L6-v2.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for encoding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`SemanticEncoder::dimensions`]
/// entries. All methods are synchronous; callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait SemanticEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Encode a batch of texts. Implementations may override for batched inference.
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.encode(t)).collect()
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Identifier stored in `schema_meta` to detect model changes.
    fn model_id(&self) -> String;
}

/// Create an encoder from config.
///
/// `"local"` needs the model files (run `mnemosync model download` first);
/// `"hashing"` needs nothing.
pub fn create_encoder(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn SemanticEncoder>> {
    match config.provider.as_str() {
        "local" => {
            anyhow::ensure!(
                config.dimensions == EMBEDDING_DIM,
                "the local provider produces {EMBEDDING_DIM} dimensions, configured {}",
                config.dimensions
            );
            let provider = local::LocalEncoder::new(config)?;
            Ok(Box::new(provider))
        }
        "hashing" => Ok(Box::new(hashing::HashingEncoder::new(config.dimensions))),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hashing"),
    }
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
