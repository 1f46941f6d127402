//! Small randomly initialized transformer for offline runs.
//!
//! Used by `--reference` smoke runs and the test suite so the generation
//! pipeline can be exercised without network access or downloaded weights.

use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TextGenError};
use crate::model::CausalLm;

/// Shape of the reference transformer.
#[derive(Clone, Debug)]
pub struct ReferenceConfig {
    /// Longest context fed to the model; older tokens are dropped.
    pub max_seq_len: usize,
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Hidden dimension of the feed-forward network.
    pub hidden_dim: usize,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            max_seq_len: 128,
            vocab_size: 1024,
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            hidden_dim: 256,
        }
    }
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.1..0.1))
}

struct Embedding {
    weight: Array2<f32>, // vocab_size x dim
}

impl Embedding {
    fn new(rng: &mut StdRng, vocab_size: usize, dim: usize) -> Self {
        Self {
            weight: random_matrix(rng, vocab_size, dim),
        }
    }

    fn forward(&self, tokens: &[u32]) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((tokens.len(), self.weight.ncols()));
        for (i, &tok) in tokens.iter().enumerate() {
            out.row_mut(i).assign(&self.weight.row(tok as usize));
        }
        out
    }
}

struct Linear {
    weight: Array2<f32>, // out x in
}

impl Linear {
    fn new(rng: &mut StdRng, in_features: usize, out_features: usize) -> Self {
        Self {
            weight: random_matrix(rng, out_features, in_features),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t())
    }
}

struct RmsNorm {
    weight: Array1<f32>,
    eps: f32,
}

impl RmsNorm {
    fn new(dim: usize) -> Self {
        Self {
            weight: Array1::ones(dim),
            eps: 1e-6,
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mean = x.mapv(|v| v * v).sum_axis(Axis(1)) / x.ncols() as f32;
        let denom = mean.mapv(|m| (m + self.eps).sqrt()).insert_axis(Axis(1));
        let norm = x / &denom;
        norm * &self.weight.view().insert_axis(Axis(0))
    }
}

/// Causal multi-head self attention.
struct Attention {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(rng: &mut StdRng, dim: usize, n_heads: usize) -> Self {
        Self {
            wq: Linear::new(rng, dim, dim),
            wk: Linear::new(rng, dim, dim),
            wv: Linear::new(rng, dim, dim),
            wo: Linear::new(rng, dim, dim),
            n_heads,
            head_dim: dim / n_heads,
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let q = self.wq.forward(x);
        let k = self.wk.forward(x);
        let v = self.wv.forward(x);
        let seq = x.nrows();
        let scale = (self.head_dim as f32).sqrt();

        let mut out = Array2::<f32>::zeros((seq, self.n_heads * self.head_dim));
        for h in 0..self.n_heads {
            let (lo, hi) = (h * self.head_dim, (h + 1) * self.head_dim);
            let qh = q.slice(s![.., lo..hi]);
            let kh = k.slice(s![.., lo..hi]);
            let vh = v.slice(s![.., lo..hi]);

            // position i only sees positions 0..=i
            let mut scores = Array2::<f32>::from_elem((seq, seq), f32::NEG_INFINITY);
            for i in 0..seq {
                for j in 0..=i {
                    scores[[i, j]] = qh.row(i).dot(&kh.row(j)) / scale;
                }
            }
            for mut row in scores.axis_iter_mut(Axis(0)) {
                let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                row.mapv_inplace(|x| (x - max).exp());
                let sum = row.sum();
                row.mapv_inplace(|p| p / sum);
            }
            out.slice_mut(s![.., lo..hi]).assign(&scores.dot(&vh));
        }
        self.wo.forward(&out)
    }
}

/// Feed-forward network with SiLU activation.
struct Mlp {
    w1: Linear,
    w2: Linear,
}

impl Mlp {
    fn new(rng: &mut StdRng, dim: usize, hidden_dim: usize) -> Self {
        Self {
            w1: Linear::new(rng, dim, hidden_dim),
            w2: Linear::new(rng, hidden_dim, dim),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let hidden = self.w1.forward(x).mapv(|v| v / (1.0 + (-v).exp()));
        self.w2.forward(&hidden)
    }
}

struct Block {
    attn_norm: RmsNorm,
    attn: Attention,
    ffn_norm: RmsNorm,
    ffn: Mlp,
}

impl Block {
    fn new(rng: &mut StdRng, cfg: &ReferenceConfig) -> Self {
        Self {
            attn_norm: RmsNorm::new(cfg.dim),
            attn: Attention::new(rng, cfg.dim, cfg.n_heads),
            ffn_norm: RmsNorm::new(cfg.dim),
            ffn: Mlp::new(rng, cfg.dim, cfg.hidden_dim),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let h = self.attn.forward(&self.attn_norm.forward(x));
        let x = x + &h;
        let h = self.ffn.forward(&self.ffn_norm.forward(&x));
        x + &h
    }
}

/// Decoder-only transformer with random weights.
///
/// Keeps no KV cache: every call reruns the whole (windowed) sequence.
pub struct ReferenceTransformer {
    pub config: ReferenceConfig,
    embed: Embedding,
    layers: Vec<Block>,
    norm: RmsNorm,
    head: Linear,
    tokens: Vec<u32>,
}

impl ReferenceTransformer {
    pub fn new(config: ReferenceConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let embed = Embedding::new(&mut rng, config.vocab_size, config.dim);
        let layers = (0..config.n_layers)
            .map(|_| Block::new(&mut rng, &config))
            .collect();
        let norm = RmsNorm::new(config.dim);
        let head = Linear::new(&mut rng, config.dim, config.vocab_size);
        Self {
            config,
            embed,
            layers,
            norm,
            head,
            tokens: Vec::new(),
        }
    }

    /// Logits for every position of `tokens`, shape `(len, vocab_size)`.
    pub fn logits(&self, tokens: &[u32]) -> Array2<f32> {
        let mut h = self.embed.forward(tokens);
        for layer in &self.layers {
            h = layer.forward(&h);
        }
        self.head.forward(&self.norm.forward(&h))
    }
}

impl CausalLm for ReferenceTransformer {
    fn forward(&mut self, input_ids: &[u32], seqlen_offset: usize) -> Result<Vec<f32>> {
        if input_ids.is_empty() {
            return Err(TextGenError::Generation("empty input".to_string()));
        }
        if let Some(&bad) = input_ids
            .iter()
            .find(|&&id| id as usize >= self.config.vocab_size)
        {
            return Err(TextGenError::Generation(format!(
                "token id {bad} outside vocabulary of {}",
                self.config.vocab_size
            )));
        }
        self.tokens.truncate(seqlen_offset);
        self.tokens.extend_from_slice(input_ids);

        let start = self.tokens.len().saturating_sub(self.config.max_seq_len);
        let logits = self.logits(&self.tokens[start..]);
        Ok(logits.row(logits.nrows() - 1).to_vec())
    }

    fn clear_kv_cache(&mut self) -> Result<()> {
        self.tokens.clear();
        Ok(())
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ReferenceConfig {
        ReferenceConfig {
            max_seq_len: 16,
            vocab_size: 50,
            dim: 16,
            n_layers: 1,
            n_heads: 2,
            hidden_dim: 32,
        }
    }

    #[test]
    fn logits_have_one_row_per_token() {
        let model = ReferenceTransformer::new(small(), 0);
        let logits = model.logits(&[0, 1, 2]);
        assert_eq!(logits.nrows(), 3);
        assert_eq!(logits.ncols(), 50);
    }

    #[test]
    fn same_seed_same_weights() {
        let a = ReferenceTransformer::new(small(), 7);
        let b = ReferenceTransformer::new(small(), 7);
        assert_eq!(a.logits(&[3, 4]), b.logits(&[3, 4]));
    }

    #[test]
    fn earlier_positions_ignore_later_tokens() {
        let model = ReferenceTransformer::new(small(), 1);
        let short = model.logits(&[5, 6]);
        let long = model.logits(&[5, 6, 7, 8]);
        for (a, b) in short.row(1).iter().zip(long.row(1).iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn incremental_forward_matches_full_forward() {
        let mut model = ReferenceTransformer::new(small(), 2);
        let full = model.forward(&[1, 2, 3], 0).unwrap();
        model.clear_kv_cache().unwrap();
        model.forward(&[1, 2], 0).unwrap();
        let step = model.forward(&[3], 2).unwrap();
        assert_eq!(full, step);
    }

    #[test]
    fn out_of_vocab_token_is_an_error() {
        let mut model = ReferenceTransformer::new(small(), 0);
        assert!(model.forward(&[50], 0).is_err());
        assert!(model.forward(&[], 0).is_err());
    }
}
