//! Batched multi-reference attribution driver.
//!
//! Flattens the (example, reference) cross-product into fixed-size batches,
//! runs the engine once per batch, projects the multipliers, and averages
//! each example's per-reference attributions as soon as a full set has
//! accumulated. Batching is by pairs, not by examples: in memory-constrained
//! settings one example's references may span several batches without
//! changing the result.

use crate::engine::{DeepLiftShap, EngineConfig};
use crate::error::{AtribuirError, Result};
use crate::nn::{Device, Model};
use crate::project::hypothetical_attributions;
use crate::shuffle::ReferenceSource;
use ndarray::{Array2, Array3, Array4, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// References generated per example when a generator is used; ignored
    /// for a precomputed reference tensor.
    pub n_shuffles: usize,
    /// Number of (example, reference) pairs per engine call.
    pub batch_size: usize,
    /// Collect and return the references that were used.
    pub return_references: bool,
    /// Return attributions for every possible character instead of
    /// collapsing to the observed one-hot characters.
    pub hypothetical: bool,
    /// Convergence deltas above this raise a warning.
    pub warning_threshold: f32,
    /// Near-zero denominator guard for the rescale rule.
    pub eps: f32,
    /// Compute target handed to the model.
    pub device: Device,
    /// Seed for reference generation. `None` is non-deterministic.
    pub random_state: Option<u64>,
    /// Emit per-batch progress.
    pub verbose: bool,
    /// Report every example's convergence delta.
    pub print_convergence_deltas: bool,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            n_shuffles: 20,
            batch_size: 32,
            return_references: false,
            hypothetical: false,
            warning_threshold: 1e-3,
            eps: 1e-6,
            device: Device::Cpu,
            random_state: None,
            verbose: false,
            print_convergence_deltas: false,
        }
    }
}

impl AttributionConfig {
    /// Set the number of references per example.
    pub fn with_n_shuffles(mut self, n_shuffles: usize) -> Self {
        self.n_shuffles = n_shuffles;
        self
    }

    /// Set the pairs-per-batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Collect the references used.
    pub fn with_return_references(mut self) -> Self {
        self.return_references = true;
        self
    }

    /// Keep attributions for every possible character.
    pub fn with_hypothetical(mut self) -> Self {
        self.hypothetical = true;
        self
    }

    /// Seed reference generation.
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    /// Set the compute device.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

/// Driver result: final attributions, plus the references used when
/// requested.
#[derive(Debug, Clone)]
pub struct AttributionOutput {
    /// Per-example attributions, shape (n_examples, alphabet, length).
    pub attributions: Array3<f32>,
    /// References reshaped to (n_examples, n_shuffles, alphabet, length);
    /// present only with `return_references`.
    pub references: Option<Array4<f32>>,
}

/// Compute DeepLIFT/SHAP attributions for a set of one-hot sequences.
///
/// For every example, `n_shuffles` references are drawn from `references`
/// (or taken from the precomputed tensor), each (example, reference) pair is
/// attributed by the engine, projected into hypothetical attributions, and
/// the per-reference results are averaged. Unless `hypothetical` is set the
/// average is collapsed onto the observed characters by an elementwise
/// multiply with the example itself.
///
/// With a seeded `random_state`, pair (example, j) is always generated with
/// seed `random_state + j`, so results are identical for every `batch_size`.
pub fn deep_lift_shap(
    model: &dyn Model,
    x: &Array3<f32>,
    args: Option<&[ArrayD<f32>]>,
    references: ReferenceSource<'_>,
    config: &AttributionConfig,
) -> Result<AttributionOutput> {
    let (n_examples, alphabet, length) = x.dim();
    model.prepare(config.device)?;

    let n_shuffles = match &references {
        ReferenceSource::Tensor(tensor) => {
            let (rn, shuffles, ra, rl) = tensor.dim();
            if rn != n_examples || ra != alphabet || rl != length {
                return Err(AtribuirError::shape(
                    "precomputed references",
                    &[n_examples, shuffles, alphabet, length],
                    tensor.shape(),
                ));
            }
            shuffles
        }
        ReferenceSource::Generator(_) => config.n_shuffles,
    };
    if n_shuffles == 0 {
        return Err(AtribuirError::Config {
            field: "n_shuffles".into(),
            message: "at least one reference per example is required".into(),
        });
    }
    if config.batch_size == 0 {
        return Err(AtribuirError::Config {
            field: "batch_size".into(),
            message: "batch size must be at least 1".into(),
        });
    }

    let engine_config = EngineConfig::default()
        .with_eps(config.eps)
        .with_warning_threshold(config.warning_threshold);
    let engine_config = if config.print_convergence_deltas {
        engine_config.with_verbose()
    } else {
        engine_config
    };
    // Construction also rejects unsupported layers before any work is done.
    let engine = DeepLiftShap::new(model, engine_config)?;

    if n_examples == 0 {
        return Ok(AttributionOutput {
            attributions: Array3::zeros((0, alphabet, length)),
            references: config.return_references.then(|| Array4::zeros((0, n_shuffles, alphabet, length))),
        });
    }

    let total = n_examples * n_shuffles;
    let mut example_idx: Vec<usize> = Vec::new();
    let mut shuffle_idx: Vec<usize> = Vec::new();
    let mut pending: VecDeque<Array2<f32>> = VecDeque::new();
    let mut attributions: Vec<Array2<f32>> = Vec::with_capacity(n_examples);
    let mut used_references: Vec<Array2<f32>> = Vec::new();
    let mut completed = 0usize;

    for i in 0..total {
        example_idx.push(i / n_shuffles);
        shuffle_idx.push(i % n_shuffles);
        if example_idx.len() < config.batch_size && i != total - 1 {
            continue;
        }

        let batch_x = x.select(Axis(0), &example_idx);
        let batch_args: Option<Vec<ArrayD<f32>>> =
            args.map(|args| args.iter().map(|a| a.select(Axis(0), &example_idx)).collect());
        let batch_refs = assemble_references(
            &references,
            &batch_x,
            &example_idx,
            &shuffle_idx,
            config.random_state,
        )?;

        if config.verbose {
            debug!(pairs = example_idx.len(), done = i + 1, total, "attribution batch");
        }

        let multipliers = engine.attribute(&batch_x, &batch_refs, batch_args.as_deref())?;
        let projected = hypothetical_attributions(&multipliers, &batch_x, &batch_refs)?;

        for row in 0..example_idx.len() {
            pending.push_back(slice_pair(&projected, row));
            if config.return_references {
                used_references.push(slice_pair(&batch_refs, row));
            }
        }

        // Average each example as soon as its full reference set is in.
        while pending.len() >= n_shuffles && completed < n_examples {
            let mut average = Array2::<f32>::zeros((alphabet, length));
            for attr in pending.drain(0..n_shuffles) {
                average += &attr;
            }
            average /= n_shuffles as f32;
            if !config.hypothetical {
                average *= &x.index_axis(Axis(0), completed);
            }
            attributions.push(average);
            completed += 1;
        }

        example_idx.clear();
        shuffle_idx.clear();
    }

    let views: Vec<_> = attributions.iter().map(Array2::view).collect();
    let attributions = ndarray::stack(Axis(0), &views)?;

    let references_out = if config.return_references {
        let mut out = Array4::<f32>::zeros((n_examples, n_shuffles, alphabet, length));
        for (pair, reference) in used_references.iter().enumerate() {
            out.index_axis_mut(Axis(0), pair / n_shuffles)
                .index_axis_mut(Axis(0), pair % n_shuffles)
                .assign(reference);
        }
        Some(out)
    } else {
        None
    };

    Ok(AttributionOutput { attributions, references: references_out })
}

/// Pull the references for one batch of (example, reference-index) pairs.
///
/// Seeded generation works one pair at a time with seed `random_state + j`,
/// so the same reference is produced for a pair no matter how the work is
/// batched.
fn assemble_references(
    source: &ReferenceSource<'_>,
    batch_x: &Array3<f32>,
    example_idx: &[usize],
    shuffle_idx: &[usize],
    random_state: Option<u64>,
) -> Result<Array3<f32>> {
    let (pairs, alphabet, length) = batch_x.dim();
    match source {
        ReferenceSource::Tensor(tensor) => {
            let mut refs = Array3::<f32>::zeros((pairs, alphabet, length));
            for (row, (&e, &j)) in example_idx.iter().zip(shuffle_idx).enumerate() {
                refs.index_axis_mut(Axis(0), row)
                    .assign(&tensor.index_axis(Axis(0), e).index_axis(Axis(0), j));
            }
            Ok(refs)
        }
        ReferenceSource::Generator(generator) => match random_state {
            Some(seed) => {
                let mut refs = Array3::<f32>::zeros((pairs, alphabet, length));
                for (row, &j) in shuffle_idx.iter().enumerate() {
                    let example = batch_x
                        .index_axis(Axis(0), row)
                        .insert_axis(Axis(0))
                        .to_owned();
                    let generated = generator.generate(&example, 1, Some(seed + j as u64))?;
                    refs.index_axis_mut(Axis(0), row)
                        .assign(&generated.index_axis(Axis(0), 0).index_axis(Axis(0), 0));
                }
                Ok(refs)
            }
            None => {
                let generated = generator.generate(batch_x, 1, None)?;
                Ok(generated.index_axis(Axis(1), 0).to_owned())
            }
        },
    }
}

/// One (alphabet, length) row of a batch tensor, owned.
fn slice_pair(batch: &Array3<f32>, row: usize) -> Array2<f32> {
    batch.index_axis(Axis(0), row).to_owned()
}
