//! Lazy, memoized model loading.
//!
//! Each mode has at most one load in flight. Every caller asking for the
//! same mode gets a clone of the same [`ModelLoad`], and a failed load stays
//! failed for the rest of the session.

use crate::error::ModelLoadError;
use crate::inference::{Mode, ModelBackend, ObjectDetector, SegmenterHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

pub type SharedDetector = Arc<Mutex<Box<dyn ObjectDetector>>>;
pub type SharedSegmenter = Arc<Mutex<SegmenterHandle>>;

/// A loaded inference pipeline, shared by every frame of a loop.
#[derive(Clone)]
pub enum ModelHandle {
    Detection(SharedDetector),
    Segmentation(SharedSegmenter),
}

impl ModelHandle {
    pub fn mode(&self) -> Mode {
        match self {
            ModelHandle::Detection(_) => Mode::Detection,
            ModelHandle::Segmentation(_) => Mode::Segmentation,
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelHandle").field(&self.mode()).finish()
    }
}

#[derive(Clone)]
enum LoadState {
    Pending,
    Ready(ModelHandle),
    Failed(ModelLoadError),
}

/// Shared view of one in-flight (or settled) model load.
#[derive(Clone)]
pub struct ModelLoad {
    mode: Mode,
    state: watch::Receiver<LoadState>,
}

impl ModelLoad {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// True when both values observe the same underlying load.
    #[cfg(test)]
    pub fn same_load(&self, other: &ModelLoad) -> bool {
        self.state.same_channel(&other.state)
    }

    /// Resolves once the load settles.
    pub async fn ready(&self) -> Result<ModelHandle, ModelLoadError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, LoadState::Pending))
            .await
            .map_err(|_| ModelLoadError::new(self.mode, "load task ended without a result"))?;
        match &*settled {
            LoadState::Ready(handle) => Ok(handle.clone()),
            LoadState::Failed(err) => Err(err.clone()),
            LoadState::Pending => unreachable!("wait_for only returns settled states"),
        }
    }
}

struct ProviderInner {
    backend: Arc<dyn ModelBackend>,
    loads: Mutex<HashMap<Mode, ModelLoad>>,
}

#[derive(Clone)]
pub struct ModelProvider {
    inner: Arc<ProviderInner>,
}

impl ModelProvider {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                backend,
                loads: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the load for `mode`, starting it on first request.
    pub fn get_or_load(&self, mode: Mode) -> ModelLoad {
        let mut loads = self
            .inner
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = loads.get(&mode) {
            return existing.clone();
        }

        let (tx, rx) = watch::channel(LoadState::Pending);
        let load = ModelLoad { mode, state: rx };
        loads.insert(mode, load.clone());
        drop(loads);

        tracing::info!("Loading {} model", mode);
        let backend = Arc::clone(&self.inner.backend);
        tokio::spawn(async move {
            let state = match load_pipeline(backend, mode).await {
                Ok(handle) => {
                    tracing::info!("{} model ready", mode);
                    LoadState::Ready(handle)
                }
                Err(err) => {
                    tracing::error!("{}", err);
                    LoadState::Failed(err)
                }
            };
            tx.send_replace(state);
        });

        load
    }

    /// Returns the load for `mode` only if one has already been requested.
    pub fn pending(&self, mode: Mode) -> Option<ModelLoad> {
        self.inner
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&mode)
            .cloned()
    }

    /// Startup chain: detection first, then the segmentation pipeline once
    /// detection has settled.
    pub fn spawn_preload(&self) -> tokio::task::JoinHandle<()> {
        let provider = self.clone();
        tokio::spawn(async move {
            let detection = provider.get_or_load(Mode::Detection);
            if let Err(err) = detection.ready().await {
                tracing::warn!("Continuing preload after failure: {}", err);
            }
            provider.get_or_load(Mode::Segmentation);
        })
    }
}

async fn load_pipeline(
    backend: Arc<dyn ModelBackend>,
    mode: Mode,
) -> Result<ModelHandle, ModelLoadError> {
    match mode {
        Mode::Detection => {
            let detector = run_blocking(mode, {
                let backend = Arc::clone(&backend);
                move || backend.load_detector()
            })
            .await?;
            Ok(ModelHandle::Detection(Arc::new(Mutex::new(detector))))
        }
        Mode::Segmentation => {
            // The pose estimator is the auxiliary capability; the mode is only
            // ready once both halves have loaded.
            let parts = run_blocking(mode, {
                let backend = Arc::clone(&backend);
                move || backend.load_part_segmenter()
            });
            let poses = run_blocking(mode, {
                let backend = Arc::clone(&backend);
                move || backend.load_pose_estimator()
            });
            let (parts, poses) = tokio::try_join!(parts, poses)?;
            Ok(ModelHandle::Segmentation(Arc::new(Mutex::new(
                SegmenterHandle::new(parts, poses),
            ))))
        }
    }
}

async fn run_blocking<T, F>(mode: Mode, load: F) -> Result<T, ModelLoadError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(load)
        .await
        .map_err(|err| ModelLoadError::new(mode, err))?
        .map_err(|err| ModelLoadError::new(mode, format!("{:#}", err)))
}
