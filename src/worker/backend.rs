//! Embedding backends for the worker process
//!
//! A worker owns exactly one backend, selected at `INIT` time. The `hash`
//! backend is deterministic and dependency-free, which keeps the compute
//! plane runnable (and testable) on hosts without model artifacts. The
//! `onnx` backend (feature `onnx`) runs a real transformer via ort +
//! tokenizers, loading strictly from the local model directory; no
//! network path exists.

use std::path::Path;

use thiserror::Error;

/// Errors from backend loading and inference.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    #[error("model artifacts not found: {0}")]
    ModelNotFound(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("backend produces dim {produced}, cache expects {expected}")]
    DimMismatch { produced: usize, expected: usize },
}

/// A single-threaded embedding model. One instance per worker process;
/// `embed` runs one model invocation over the whole slice.
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Embed all texts in one invocation, returning one `dim`-length
    /// L2-normalized vector per input, in input order.
    fn embed(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>, BackendError>;
}

/// Instantiate a backend by name. `dim` is the cache dimension the vectors
/// must match; `model_path` is only consulted by model-backed backends.
pub fn load_backend(
    name: &str,
    dim: usize,
    model_path: &Path,
) -> Result<Box<dyn Backend>, BackendError> {
    match name {
        "hash" => Ok(Box::new(HashBackend::new(dim))),
        #[cfg(feature = "onnx")]
        "onnx" => Ok(Box::new(onnx::OnnxBackend::load(model_path, dim)?)),
        #[cfg(not(feature = "onnx"))]
        "onnx" => Err(BackendError::UnknownBackend(
            "onnx (crate built without the `onnx` feature)".into(),
        )),
        other => {
            let _ = model_path;
            Err(BackendError::UnknownBackend(other.to_string()))
        }
    }
}

/// Deterministic embedding derived from the blake3 XOF of the text.
///
/// Not semantically meaningful, but stable across processes and hosts,
/// unit-normalized, and cheap: the reference backend for tests, CI and
/// the bench command.
pub struct HashBackend {
    dim: usize,
}

impl HashBackend {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(text.as_bytes());
        let mut reader = hasher.finalize_xof();
        let mut bytes = vec![0u8; self.dim * 4];
        reader.fill(&mut bytes);

        let mut vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| {
                let raw = u32::from_le_bytes(chunk.try_into().expect("4-byte chunk"));
                // Map the 32-bit word into [-1, 1]
                (raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
            })
            .collect();
        normalize_l2(&mut vector);
        vector
    }
}

impl Backend for HashBackend {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn embed(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// L2 normalize a vector in place.
pub(crate) fn normalize_l2(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().fold(0.0, |acc, &x| acc + x * x);
    if norm_sq > 0.0 {
        let inv_norm = 1.0 / norm_sq.sqrt();
        v.iter_mut().for_each(|x| *x *= inv_norm);
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::{normalize_l2, Backend, BackendError};
    use ndarray::Array2;
    use ort::session::Session;
    use std::path::Path;

    const MODEL_FILE: &str = "model.onnx";
    const TOKENIZER_FILE: &str = "tokenizer.json";
    const MAX_LENGTH: usize = 512;

    /// Transformer embedding via ort, mean-pooled over the attention mask.
    pub struct OnnxBackend {
        session: Session,
        tokenizer: tokenizers::Tokenizer,
        dim: usize,
    }

    impl OnnxBackend {
        /// Load `model.onnx` + `tokenizer.json` from a local directory.
        pub fn load(model_dir: &Path, dim: usize) -> Result<Self, BackendError> {
            let model_path = model_dir.join(MODEL_FILE);
            let tokenizer_path = model_dir.join(TOKENIZER_FILE);
            if !model_path.exists() {
                return Err(BackendError::ModelNotFound(model_path.display().to_string()));
            }

            let session = Session::builder()
                .and_then(|b| b.commit_from_file(&model_path))
                .map_err(|e| BackendError::Inference(e.to_string()))?;
            let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| BackendError::Tokenizer(e.to_string()))?;

            Ok(Self {
                session,
                tokenizer,
                dim,
            })
        }
    }

    impl Backend for OnnxBackend {
        fn name(&self) -> &'static str {
            "onnx"
        }

        fn embed(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>, BackendError> {
            use ort::value::Tensor;

            if texts.is_empty() {
                return Ok(vec![]);
            }

            let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
            let encodings = self
                .tokenizer
                .encode_batch(owned, true)
                .map_err(|e| BackendError::Tokenizer(e.to_string()))?;

            let input_ids: Vec<Vec<i64>> = encodings
                .iter()
                .map(|e| e.get_ids().iter().map(|&id| id as i64).collect())
                .collect();
            let attention_mask: Vec<Vec<i64>> = encodings
                .iter()
                .map(|e| e.get_attention_mask().iter().map(|&m| m as i64).collect())
                .collect();

            let max_len = input_ids
                .iter()
                .map(|v| v.len())
                .max()
                .unwrap_or(0)
                .min(MAX_LENGTH);

            let input_ids_arr = pad_2d_i64(&input_ids, max_len, 0);
            let attention_mask_arr = pad_2d_i64(&attention_mask, max_len, 0);
            let token_type_ids_arr = Array2::<i64>::zeros((texts.len(), max_len));

            let outputs = self
                .session
                .run(ort::inputs![
                    "input_ids" => Tensor::from_array(input_ids_arr)
                        .map_err(|e| BackendError::Inference(e.to_string()))?,
                    "attention_mask" => Tensor::from_array(attention_mask_arr)
                        .map_err(|e| BackendError::Inference(e.to_string()))?,
                    "token_type_ids" => Tensor::from_array(token_type_ids_arr)
                        .map_err(|e| BackendError::Inference(e.to_string()))?,
                ])
                .map_err(|e| BackendError::Inference(e.to_string()))?;

            let (shape, data) = outputs["last_hidden_state"]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::Inference(e.to_string()))?;
            let hidden = *shape.last().unwrap_or(&0) as usize;
            if hidden != self.dim {
                return Err(BackendError::DimMismatch {
                    produced: hidden,
                    expected: self.dim,
                });
            }

            // Mean pool over the sequence dimension, weighted by the mask.
            let mut results = Vec::with_capacity(texts.len());
            for (i, mask_vec) in attention_mask.iter().enumerate().take(texts.len()) {
                let mut sum = vec![0.0f32; hidden];
                let mut count = 0.0f32;
                for j in 0..max_len {
                    let mask = mask_vec.get(j).copied().unwrap_or(0) as f32;
                    if mask > 0.0 {
                        count += mask;
                        let offset = i * max_len * hidden + j * hidden;
                        for (k, sum_val) in sum.iter_mut().enumerate() {
                            *sum_val += data[offset + k] * mask;
                        }
                    }
                }
                if count > 0.0 {
                    for sum_val in &mut sum {
                        *sum_val /= count;
                    }
                }
                normalize_l2(&mut sum);
                results.push(sum);
            }

            Ok(results)
        }
    }

    /// Pad 2D sequences to a fixed length.
    fn pad_2d_i64(inputs: &[Vec<i64>], max_len: usize, pad_value: i64) -> Array2<i64> {
        let batch_size = inputs.len();
        let mut arr = Array2::from_elem((batch_size, max_len), pad_value);
        for (i, seq) in inputs.iter().enumerate() {
            for (j, &val) in seq.iter().take(max_len).enumerate() {
                arr[[i, j]] = val;
            }
        }
        arr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_backend_is_deterministic() {
        let mut a = HashBackend::new(16);
        let mut b = HashBackend::new(16);
        let va = a.embed(&["fn main() {}"]).unwrap();
        let vb = b.embed(&["fn main() {}"]).unwrap();
        assert_eq!(va, vb);
    }

    #[test]
    fn test_hash_backend_distinguishes_texts() {
        let mut backend = HashBackend::new(16);
        let vectors = backend.embed(&["alpha", "beta"]).unwrap();
        assert_ne!(vectors[0], vectors[1]);
    }

    #[test]
    fn test_hash_backend_dim_and_norm() {
        let mut backend = HashBackend::new(384);
        let vectors = backend.embed(&["some chunk of code"]).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 384);
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm {}", norm);
    }

    #[test]
    fn test_hash_backend_empty_batch() {
        let mut backend = HashBackend::new(8);
        assert!(backend.embed(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_load_backend_by_name() {
        let dir = std::env::temp_dir();
        assert!(load_backend("hash", 8, &dir).is_ok());
        assert!(matches!(
            load_backend("quantum", 8, &dir),
            Err(BackendError::UnknownBackend(_))
        ));
    }
}
