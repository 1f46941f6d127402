//! Next-token selection: greedy, temperature and nucleus (top-p) sampling.

use ndarray::Array1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::GenerationConfig;
use crate::error::{Result, TextGenError};

/// Picks the next token from a row of logits.
pub struct Sampler {
    rng: StdRng,
    temperature: f64,
    top_p: f64,
    greedy: bool,
}

impl Sampler {
    pub fn new(config: &GenerationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            temperature: config.temperature,
            top_p: config.top_p,
            greedy: !config.do_sample || config.temperature <= 0.0,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.greedy
    }

    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(TextGenError::Generation("empty logits".to_string()));
        }
        if self.greedy {
            return Ok(argmax(logits));
        }

        let probs = softmax(logits, self.temperature);
        let candidates = nucleus(&probs, self.top_p);
        let weights: Vec<f32> = candidates.iter().map(|&(_, p)| p).collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => Ok(candidates[dist.sample(&mut self.rng)].0 as u32),
            Err(_) => Ok(argmax(logits)),
        }
    }
}

/// Index of the largest finite logit, 0 when there is none.
pub fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Temperature-scaled softmax. NaN and `-inf` logits get probability zero;
/// `+inf` logits share all the mass.
pub fn softmax(logits: &[f32], temperature: f64) -> Array1<f32> {
    let max = logits
        .iter()
        .cloned()
        .filter(|v| !v.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return Array1::zeros(logits.len());
    }
    let weights = Array1::from_iter(logits.iter().map(|&v| {
        if max == f32::INFINITY {
            if v == f32::INFINITY {
                1.0
            } else {
                0.0
            }
        } else if v.is_finite() {
            ((v - max) as f64 / temperature).exp() as f32
        } else {
            0.0
        }
    }));
    let sum = weights.sum();
    weights / sum
}

/// Smallest set of most likely tokens whose probability mass reaches
/// `top_p`, as `(token, probability)` in descending order. The most likely
/// token always survives; `top_p >= 1` keeps every token with nonzero mass.
pub fn nucleus(probs: &Array1<f32>, top_p: f64) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs
        .iter()
        .cloned()
        .enumerate()
        .filter(|&(_, p)| p > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    if top_p >= 1.0 {
        return ranked;
    }

    let mut mass = 0.0f64;
    let mut keep = 0;
    for &(_, p) in &ranked {
        keep += 1;
        mass += p as f64;
        if mass >= top_p {
            break;
        }
    }
    ranked.truncate(keep.max(1));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(config: GenerationConfig) -> Sampler {
        Sampler::new(&config)
    }

    #[test]
    fn argmax_skips_nan() {
        assert_eq!(argmax(&[0.1, f32::NAN, 0.7, 0.2]), 2);
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]), 0);
    }

    #[test]
    fn softmax_sums_to_one_and_masks_neg_infinity() {
        let probs = softmax(&[1.0, 2.0, f32::NEG_INFINITY, 0.5], 0.7);
        assert!((probs.sum() - 1.0).abs() < 1e-6);
        assert_eq!(probs[2], 0.0);
        assert!(probs[1] > probs[0] && probs[0] > probs[3]);
    }

    #[test]
    fn lower_temperature_sharpens_distribution() {
        let logits = [1.0, 2.0, 3.0];
        let hot = softmax(&logits, 2.0);
        let cold = softmax(&logits, 0.2);
        assert!(cold[2] > hot[2]);
    }

    #[test]
    fn tiny_temperature_is_near_greedy() {
        let probs = softmax(&[5.0, 0.0, -1.0], 1e-40);
        assert_eq!(probs[0], 1.0);
        assert_eq!(probs[1], 0.0);

        let cfg = GenerationConfig::default()
            .with_temperature(1e-40)
            .with_top_p(1.0)
            .with_seed(0);
        let mut s = sampler(cfg);
        for _ in 0..10 {
            assert_eq!(s.sample(&[5.0, 0.0, -1.0]).unwrap(), 0);
        }
    }

    #[test]
    fn positive_infinity_takes_all_mass() {
        let probs = softmax(&[1.0, f32::INFINITY, 2.0], 0.7);
        assert_eq!(probs.to_vec(), vec![0.0, 1.0, 0.0]);
        let mut s = sampler(GenerationConfig::default().with_seed(1));
        assert_eq!(s.sample(&[1.0, f32::INFINITY, 2.0]).unwrap(), 1);
    }

    #[test]
    fn nucleus_keeps_smallest_covering_prefix() {
        let probs = Array1::from(vec![0.1, 0.5, 0.3, 0.1]);
        let kept: Vec<usize> = nucleus(&probs, 0.75).into_iter().map(|(i, _)| i).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn nucleus_always_keeps_top_token() {
        let probs = Array1::from(vec![0.2, 0.8]);
        assert_eq!(nucleus(&probs, 0.0), vec![(1, 0.8)]);
        assert_eq!(nucleus(&probs, 1.0).len(), 2);
    }

    #[test]
    fn greedy_config_takes_argmax() {
        let mut s = sampler(GenerationConfig::default().greedy());
        assert!(s.is_greedy());
        assert_eq!(s.sample(&[0.0, 5.0, 1.0]).unwrap(), 1);

        let mut zero_t = sampler(GenerationConfig::default().with_temperature(0.0));
        assert!(zero_t.is_greedy());
        assert_eq!(zero_t.sample(&[3.0, 1.0]).unwrap(), 0);
    }

    #[test]
    fn tiny_top_p_behaves_greedily() {
        let mut s = sampler(GenerationConfig::default().with_top_p(1e-6));
        for _ in 0..20 {
            assert_eq!(s.sample(&[0.5, 0.4, 3.0, 0.1]).unwrap(), 2);
        }
    }

    #[test]
    fn fixed_seed_repeats_draws() {
        let logits: Vec<f32> = (0..32).map(|i| (i % 7) as f32 * 0.3).collect();
        let cfg = GenerationConfig::default().with_temperature(1.5).with_top_p(1.0).with_seed(42);
        let mut a = sampler(cfg.clone());
        let mut b = sampler(cfg);
        let da: Vec<u32> = (0..16).map(|_| a.sample(&logits).unwrap()).collect();
        let db: Vec<u32> = (0..16).map(|_| b.sample(&logits).unwrap()).collect();
        assert_eq!(da, db);
    }

    #[test]
    fn samples_stay_inside_nucleus() {
        let logits = [4.0, 3.9, -2.0, -3.0, -4.0];
        let mut s = sampler(GenerationConfig::default().with_seed(3));
        for _ in 0..50 {
            let tok = s.sample(&logits).unwrap();
            assert!(tok == 0 || tok == 1, "sampled {tok}");
        }
    }

    #[test]
    fn empty_logits_are_rejected() {
        let mut s = sampler(GenerationConfig::default());
        assert!(s.sample(&[]).is_err());
    }
}
