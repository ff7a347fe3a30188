//! Reference generation: signal-null backgrounds for one-hot sequences.
//!
//! The driver compares every example against a set of references that carry
//! the same low-order composition but none of the signal. The default
//! strategy is the Altschul-Erickson dinucleotide-preserving shuffle, which
//! permutes a sequence while keeping every adjacent-pair count intact.

use crate::error::{AtribuirError, Result};
use ndarray::{Array3, Array4};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Produces `n` background variants per example.
///
/// Implementations must be deterministic for a given `random_state`:
/// calling twice with the same seed yields identical tensors.
pub trait ReferenceGenerator {
    /// Generate references of shape (batch, n, alphabet, length) for a
    /// batch of one-hot examples of shape (batch, alphabet, length).
    fn generate(&self, x: &Array3<f32>, n: usize, random_state: Option<u64>)
        -> Result<Array4<f32>>;
}

/// Where the driver gets its references from.
pub enum ReferenceSource<'a> {
    /// Precomputed tensor of shape (n_examples, n_shuffles, alphabet,
    /// length); the driver takes `n_shuffles` from the second axis.
    Tensor(&'a Array4<f32>),
    /// A generator invoked per example. [`DinucleotideShuffle`] is the
    /// conventional choice for nucleotide alphabets.
    Generator(&'a dyn ReferenceGenerator),
}

/// Dinucleotide-content-preserving shuffle (Altschul-Erickson).
///
/// Decodes each one-hot row to tokens, collects the successor list of every
/// token, permutes each list except its final entry, then rebuilds the
/// sequence by walking the successors from the original first token. The
/// walk consumes every adjacency exactly once, so dinucleotide counts are
/// preserved and the sequence ends on the original terminal token.
#[derive(Debug, Clone, Copy, Default)]
pub struct DinucleotideShuffle;

impl DinucleotideShuffle {
    fn shuffle_tokens(tokens: &[usize], alphabet: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
        if tokens.len() <= 2 {
            return tokens.to_vec();
        }

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); alphabet];
        for i in 0..tokens.len() - 1 {
            successors[tokens[i]].push(i + 1);
        }

        // Keep each list's final successor in place so the walk terminates
        // at the original last token.
        for list in &mut successors {
            if list.len() > 1 {
                let last = list.len() - 1;
                list[..last].shuffle(rng);
            }
        }

        let mut counters = vec![0usize; alphabet];
        let mut position = 0usize;
        let mut shuffled = Vec::with_capacity(tokens.len());
        shuffled.push(tokens[0]);
        while shuffled.len() < tokens.len() {
            let token = tokens[position];
            position = successors[token][counters[token]];
            counters[token] += 1;
            shuffled.push(tokens[position]);
        }
        shuffled
    }
}

impl ReferenceGenerator for DinucleotideShuffle {
    fn generate(
        &self,
        x: &Array3<f32>,
        n: usize,
        random_state: Option<u64>,
    ) -> Result<Array4<f32>> {
        let (batch, alphabet, length) = x.dim();
        let mut rng = match random_state {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let mut references = Array4::<f32>::zeros((batch, n, alphabet, length));
        for b in 0..batch {
            let tokens = decode_one_hot(x, b)?;
            for s in 0..n {
                let shuffled = Self::shuffle_tokens(&tokens, alphabet, &mut rng);
                for (pos, &token) in shuffled.iter().enumerate() {
                    references[[b, s, token, pos]] = 1.0;
                }
            }
        }
        Ok(references)
    }
}

/// Decode one example row of a one-hot tensor into token indices.
fn decode_one_hot(x: &Array3<f32>, example: usize) -> Result<Vec<usize>> {
    let (_, alphabet, length) = x.dim();
    let mut tokens = Vec::with_capacity(length);
    for pos in 0..length {
        let mut active = None;
        for a in 0..alphabet {
            if x[[example, a, pos]] > 0.5 {
                if active.is_some() {
                    return Err(AtribuirError::InvalidOneHot { example, position: pos });
                }
                active = Some(a);
            }
        }
        match active {
            Some(token) => tokens.push(token),
            None => return Err(AtribuirError::InvalidOneHot { example, position: pos }),
        }
    }
    Ok(tokens)
}
