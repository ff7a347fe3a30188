//! # atribuir
//!
//! Vectorized DeepLIFT/SHAP feature attribution for neural networks over
//! one-hot encoded categorical sequences.
//!
//! For each input example, atribuir explains which positions and characters
//! contributed how much to the model's output, relative to a set of
//! signal-null reference sequences, and validates the conservation property
//! (attributions sum to the output difference from the reference) on every
//! call.
//!
//! The crate has three moving parts:
//!
//! - [`DeepLiftShap`]: the rescale-rule gradient engine. It intercepts the
//!   model's backward pass at each configured nonlinearity and rewrites the
//!   gradient as the Δout/Δin ratio between each input and its baseline.
//! - [`hypothetical_attributions`]: the projection that turns raw
//!   multipliers into per-character attributions, accounting for the fact
//!   that choosing one character implies not choosing the others.
//! - [`deep_lift_shap`]: the batched driver that fans each example out over
//!   many references, runs the engine, and averages the results.
//!
//! ```
//! use atribuir::nn::{Activation, Dense, Flatten, Sequential};
//! use atribuir::{deep_lift_shap, AttributionConfig, DinucleotideShuffle, ReferenceSource};
//! use ndarray::{arr1, arr2, Array3};
//!
//! // A toy scoring model over 4-character sequences of length 1.
//! let model = Sequential::new(vec![
//!     Box::new(Flatten),
//!     Box::new(Dense::new(arr2(&[[2.0, -1.0, 0.0, 0.0]]), arr1(&[0.0])).unwrap()),
//! ])
//! .unwrap();
//!
//! let mut x = Array3::<f32>::zeros((1, 4, 1));
//! x[[0, 0, 0]] = 1.0;
//!
//! let config = AttributionConfig::default().with_n_shuffles(5).with_random_state(0);
//! let out = deep_lift_shap(&model, &x, None, ReferenceSource::Generator(&DinucleotideShuffle), &config)
//!     .unwrap();
//! assert_eq!(out.attributions.dim(), (1, 4, 1));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod crosscheck;
pub mod driver;
pub mod engine;
pub mod error;
pub mod nn;
pub mod project;
pub mod shuffle;

pub use crosscheck::{black_box_deep_lift_shap, BlackBoxAttributor};
pub use driver::{deep_lift_shap, AttributionConfig, AttributionOutput};
pub use engine::{DeepLiftShap, EngineConfig};
pub use error::{AtribuirError, Result};
pub use nn::{Activation, Device, Model, Sequential};
pub use project::hypothetical_attributions;
pub use shuffle::{DinucleotideShuffle, ReferenceGenerator, ReferenceSource};
