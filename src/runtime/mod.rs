//! Model runtime abstraction and RL policy interface
//!
//! The engine never touches model files directly; it consumes the
//! [`ModelRuntime`] trait. The bundled [`LinearRuntime`] reads a JSON weight
//! matrix and is the reference implementation used by validation and tests.

use async_trait::async_trait;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::types::Experience;

/// Errors at the model-runtime boundary. Callers convert these to safe
/// fallback values; they never cross the top-level decision call.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),
    #[error("model file is empty: {0}")]
    Empty(PathBuf),
    #[error("invalid model format: {0}")]
    Format(String),
    #[error("input has {got} features, model expects {want}")]
    InputShape { got: usize, want: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A loaded, immutable inference model
pub trait Model: Send + Sync {
    fn input_dim(&self) -> usize;
    fn run(&self, input: &[f64]) -> Result<Vec<f64>, ModelError>;
}

/// Loads model artifacts from disk
pub trait ModelRuntime: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn Model>, ModelError>;
}

/// On-disk linear model format: `out = W x + b`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModelSpec {
    pub version: u32,
    pub input_dim: usize,
    /// Row-major weight matrix, one row per output
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

pub struct LinearModel {
    input_dim: usize,
    weights: Array2<f64>,
    bias: Array1<f64>,
}

impl Model for LinearModel {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn run(&self, input: &[f64]) -> Result<Vec<f64>, ModelError> {
        if input.len() != self.input_dim {
            return Err(ModelError::InputShape {
                got: input.len(),
                want: self.input_dim,
            });
        }
        let x = ArrayView1::from(input);
        let out = self.weights.dot(&x) + &self.bias;
        Ok(out.to_vec())
    }
}

/// JSON linear-model loader
pub struct LinearRuntime;

impl ModelRuntime for LinearRuntime {
    fn load(&self, path: &Path) -> Result<Arc<dyn Model>, ModelError> {
        if !path.exists() {
            return Err(ModelError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Err(ModelError::Empty(path.to_path_buf()));
        }
        let spec: LinearModelSpec =
            serde_json::from_str(&raw).map_err(|e| ModelError::Format(e.to_string()))?;

        let rows = spec.weights.len();
        if rows == 0 || spec.bias.len() != rows {
            return Err(ModelError::Format(format!(
                "weight rows ({}) and bias length ({}) disagree",
                rows,
                spec.bias.len()
            )));
        }
        let mut flat = Vec::with_capacity(rows * spec.input_dim);
        for row in &spec.weights {
            if row.len() != spec.input_dim {
                return Err(ModelError::Format(format!(
                    "weight row has {} columns, expected {}",
                    row.len(),
                    spec.input_dim
                )));
            }
            flat.extend_from_slice(row);
        }
        let weights = Array2::from_shape_vec((rows, spec.input_dim), flat)
            .map_err(|e| ModelError::Format(e.to_string()))?;

        Ok(Arc::new(LinearModel {
            input_dim: spec.input_dim,
            weights,
            bias: Array1::from_vec(spec.bias),
        }))
    }
}

/// Hot-swappable reference to the currently deployed model.
///
/// `replace` makes the new model visible to subsequent decisions immediately;
/// in-flight inference keeps the `Arc` it already cloned.
pub struct ModelStore {
    current: RwLock<Option<Arc<dyn Model>>>,
}

impl ModelStore {
    pub fn empty() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<dyn Model>> {
        self.current.read().ok().and_then(|m| m.clone())
    }

    pub fn replace(&self, model: Option<Arc<dyn Model>>) {
        if let Ok(mut slot) = self.current.write() {
            *slot = model;
        }
    }
}

/// Discrete sizing action with policy diagnostics
#[derive(Debug, Clone, Copy)]
pub struct SizingAction {
    /// Discrete action in 0..=5
    pub action: usize,
    pub probability: f64,
    pub value_estimate: f64,
    pub cvar_estimate: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TrainingSummary {
    pub episode: u64,
    pub total_loss: f64,
    pub average_reward: f64,
}

/// Reinforcement-learned sizing policy boundary
#[async_trait]
pub trait RlPolicy: Send + Sync {
    fn action(&self, state: &[f64]) -> anyhow::Result<SizingAction>;
    fn add_experience(&self, exp: Experience);
    async fn train(&self) -> anyhow::Result<TrainingSummary>;
    fn buffer_len(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_spec(dir: &Path, name: &str, spec: &LinearModelSpec) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string(spec).unwrap()).unwrap();
        path
    }

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tradebrain_runtime_{}", tag));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_linear_model_roundtrip() {
        let dir = test_dir("roundtrip");
        let spec = LinearModelSpec {
            version: 1,
            input_dim: 3,
            weights: vec![vec![1.0, 0.0, 0.0], vec![0.0, 2.0, 0.0]],
            bias: vec![0.5, -0.5],
        };
        let path = write_spec(&dir, "m.json", &spec);
        let model = LinearRuntime.load(&path).unwrap();
        assert_eq!(model.input_dim(), 3);
        let out = model.run(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(out, vec![1.5, 3.5]);
    }

    #[test]
    fn test_missing_and_empty_files() {
        let dir = test_dir("missing");
        assert!(matches!(
            LinearRuntime.load(&dir.join("nope.json")),
            Err(ModelError::NotFound(_))
        ));
        let empty = dir.join("empty.json");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(
            LinearRuntime.load(&empty),
            Err(ModelError::Empty(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = test_dir("shape");
        let spec = LinearModelSpec {
            version: 1,
            input_dim: 3,
            weights: vec![vec![1.0, 0.0]],
            bias: vec![0.0],
        };
        let path = write_spec(&dir, "bad.json", &spec);
        assert!(matches!(
            LinearRuntime.load(&path),
            Err(ModelError::Format(_))
        ));
    }

    #[test]
    fn test_store_swap_keeps_prior_arc_alive() {
        let store = ModelStore::empty();
        assert!(store.current().is_none());

        let dir = test_dir("swap");
        let spec = LinearModelSpec {
            version: 1,
            input_dim: 1,
            weights: vec![vec![2.0]],
            bias: vec![0.0],
        };
        let path = write_spec(&dir, "m.json", &spec);
        store.replace(Some(LinearRuntime.load(&path).unwrap()));

        let in_flight = store.current().unwrap();
        store.replace(None);
        // The in-flight handle still works after the swap
        assert_eq!(in_flight.run(&[3.0]).unwrap(), vec![6.0]);
        assert!(store.current().is_none());
    }
}
