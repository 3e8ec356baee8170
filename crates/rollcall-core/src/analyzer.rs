//! Face-analysis capability: detection plus embedding.

use crate::types::{BoundingBox, Detection, Embedding, EMBEDDING_DIM};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("frame is {actual} bytes, expected {expected} for {width}x{height} grayscale")]
    InvalidFrame {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding extraction is unavailable in simulated mode")]
    Simulated,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Whether results come from a real model or the degraded fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerMode {
    Model,
    Simulated,
}

/// Borrowed grayscale image (`width * height` bytes).
#[derive(Debug, Clone, Copy)]
pub struct GrayImage<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> GrayImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Result<Self, AnalyzerError> {
        let expected = width as usize * height as usize;
        if data.len() < expected || expected == 0 {
            return Err(AnalyzerError::InvalidFrame {
                expected,
                actual: data.len(),
                width,
                height,
            });
        }
        Ok(Self {
            data: &data[..expected],
            width,
            height,
        })
    }
}

/// An opaque detector + embedder.
///
/// Implementations are blocking and are driven from `spawn_blocking`.
pub trait FaceAnalyzer: Send {
    /// Detect every face in the frame and embed each one.
    fn analyze(&mut self, frame: GrayImage<'_>) -> Result<Vec<Detection>, AnalyzerError>;

    /// Embed the most confident face of a still image; `None` when no face is found.
    fn extract_embedding(&mut self, still: GrayImage<'_>) -> Result<Option<Embedding>, AnalyzerError>;

    fn mode(&self) -> AnalyzerMode;
}

/// Degraded-mode backend producing random, clearly flagged detections.
#[derive(Debug, Default)]
pub struct SyntheticAnalyzer;

impl FaceAnalyzer for SyntheticAnalyzer {
    fn analyze(&mut self, frame: GrayImage<'_>) -> Result<Vec<Detection>, AnalyzerError> {
        let mut rng = rand::thread_rng();
        let faces = rng.gen_range(0..=2usize);
        let (w, h) = (frame.width as f32, frame.height as f32);

        let detections = (0..faces)
            .map(|_| {
                let size = rng.gen_range(0.15..0.35) * w.min(h);
                let values: Vec<f32> = (0..EMBEDDING_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
                Detection {
                    bbox: BoundingBox {
                        x: rng.gen_range(0.0..(w - size).max(1.0)),
                        y: rng.gen_range(0.0..(h - size).max(1.0)),
                        width: size,
                        height: size,
                        confidence: rng.gen_range(0.5..1.0),
                    },
                    embedding: Embedding::new(values).l2_normalized(),
                    captured_at: Utc::now(),
                    synthetic: true,
                }
            })
            .collect();

        Ok(detections)
    }

    fn extract_embedding(&mut self, _still: GrayImage<'_>) -> Result<Option<Embedding>, AnalyzerError> {
        Err(AnalyzerError::Simulated)
    }

    fn mode(&self) -> AnalyzerMode {
        AnalyzerMode::Simulated
    }
}
