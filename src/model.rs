//! Model loading and inference
//!
//! The trained model is an opaque, externally produced GBDT ensemble
//! artifact. It is loaded lazily on first use and cached for the process
//! lifetime behind a single-flight guard: concurrent first requests trigger
//! exactly one load, and every caller observes the same shared instance.
//! A failed load is not cached; the next request retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use gbdt::decision_tree::{Data, DataVec};
use gbdt::gradient_boost::GBDT;
use tokio::sync::OnceCell;
use tracing::info;

/// Stateless per-call predictor over a prepared feature matrix.
///
/// Implementations must tolerate concurrent read-only inference; the handle
/// shares one instance across all in-flight requests.
pub trait Predictor: Send + Sync {
    /// One predicted box label per input row, in row order.
    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<f32>>;
}

pub type SharedPredictor = Arc<dyn Predictor>;

type Loader = Arc<dyn Fn() -> Result<SharedPredictor> + Send + Sync>;

/// Shared handle over the lazily loaded model.
///
/// Cloning is cheap; all clones share the same cache cell. Tests inject a
/// stub through [`ModelHandle::from_loader`] instead of touching process
/// globals.
#[derive(Clone)]
pub struct ModelHandle {
    loader: Loader,
    cell: Arc<OnceCell<SharedPredictor>>,
}

impl ModelHandle {
    /// Handle backed by a GBDT artifact on disk. The file is not touched
    /// until the first prediction request.
    pub fn from_path(path: PathBuf) -> Self {
        Self::from_loader(move || {
            let model = GbdtModel::load(&path)?;
            Ok(Arc::new(model) as SharedPredictor)
        })
    }

    /// Handle backed by an arbitrary loader. Used by tests to inject stub
    /// predictors and to observe load counts.
    pub fn from_loader(loader: impl Fn() -> Result<SharedPredictor> + Send + Sync + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
            cell: Arc::new(OnceCell::new()),
        }
    }

    /// Get the shared predictor, loading it on first use.
    ///
    /// `OnceCell::get_or_try_init` provides the single-flight guarantee;
    /// the loader itself runs on the blocking pool since artifact
    /// deserialization is synchronous file IO.
    pub async fn get(&self) -> Result<SharedPredictor> {
        let predictor = self
            .cell
            .get_or_try_init(|| {
                let loader = self.loader.clone();
                async move { tokio::task::spawn_blocking(move || loader()).await? }
            })
            .await?;
        Ok(predictor.clone())
    }
}

/// Gradient-boosted decision tree model deserialized from the artifact
/// produced by the external training pipeline.
pub struct GbdtModel {
    inner: GBDT,
}

impl GbdtModel {
    pub fn load(path: &Path) -> Result<Self> {
        ensure!(
            path.exists(),
            "model artifact not found at {}",
            path.display()
        );
        let path_str = path
            .to_str()
            .with_context(|| format!("model path is not valid UTF-8: {}", path.display()))?;
        let inner = GBDT::load_model(path_str)
            .map_err(|e| anyhow!("failed to load model from {}: {}", path.display(), e))?;
        info!("Loaded model from {}", path.display());
        Ok(Self { inner })
    }
}

impl Predictor for GbdtModel {
    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<f32>> {
        let data: DataVec = features
            .iter()
            .map(|row| Data::new_test_data(row.clone(), None))
            .collect();
        let predictions = self.inner.predict(&data);
        ensure!(
            predictions.len() == features.len(),
            "model returned {} predictions for {} rows",
            predictions.len(),
            features.len()
        );
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ConstPredictor(f32);

    impl Predictor for ConstPredictor {
        fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<f32>> {
            Ok(vec![self.0; features.len()])
        }
    }

    #[tokio::test]
    async fn test_loader_runs_once_across_concurrent_first_calls() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let handle = ModelHandle::from_loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ConstPredictor(7.0)) as SharedPredictor)
        });

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.get().await.unwrap() }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handle = ModelHandle::from_loader(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("artifact missing"))
            } else {
                Ok(Arc::new(ConstPredictor(1.0)) as SharedPredictor)
            }
        });

        assert!(handle.get().await.is_err());
        assert!(handle.get().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ModelHandle::from_path(dir.path().join("no_such_model.gbdt"));
        let err = handle.get().await.err().unwrap();
        assert!(err.to_string().contains("model artifact not found"));
    }
}
