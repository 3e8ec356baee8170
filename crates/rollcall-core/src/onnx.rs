//! ONNX Runtime backend: UltraFace-style detector and a 128-d face embedder.
//!
//! Artifacts are described by a `manifest.toml` in the model directory. The
//! whole set is validated (presence and SHA-256) before any session is built.

use crate::analyzer::{AnalyzerError, AnalyzerMode, FaceAnalyzer, GrayImage};
use crate::lifecycle::{ModelLoadError, ModelLoader};
use crate::types::{BoundingBox, Detection, Embedding, EMBEDDING_DIM};
use chrono::Utc;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.toml";

const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_CONFIDENCE_THRESHOLD: f32 = 0.7;
const DETECTOR_NMS_THRESHOLD: f32 = 0.3;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 128.0;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.1;

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorArtifact {
    pub file: String,
    pub sha256: String,
    #[serde(default = "default_detector_width")]
    pub input_width: u32,
    #[serde(default = "default_detector_height")]
    pub input_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedderArtifact {
    pub file: String,
    pub sha256: String,
    #[serde(default = "default_embedder_size")]
    pub input_size: u32,
}

fn default_detector_width() -> u32 {
    320
}

fn default_detector_height() -> u32 {
    240
}

fn default_embedder_size() -> u32 {
    160
}

/// Contents of `manifest.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelManifest {
    pub detector: DetectorArtifact,
    pub embedder: EmbedderArtifact,
}

impl ModelManifest {
    pub fn read(model_dir: &Path) -> Result<Self, ModelLoadError> {
        let path = model_dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| ModelLoadError::Fetch {
            artifact: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ModelLoadError::Manifest(e.to_string()))
    }

    /// Check every listed artifact before anything is loaded.
    ///
    /// Returns the resolved (detector, embedder) paths.
    pub fn validate(&self, model_dir: &Path) -> Result<(PathBuf, PathBuf), ModelLoadError> {
        let detector = model_dir.join(&self.detector.file);
        let embedder = model_dir.join(&self.embedder.file);
        verify_digest(&detector, &self.detector.sha256)?;
        verify_digest(&embedder, &self.embedder.sha256)?;
        Ok((detector, embedder))
    }
}

fn verify_digest(path: &Path, expected: &str) -> Result<(), ModelLoadError> {
    let bytes = std::fs::read(path).map_err(|e| ModelLoadError::Fetch {
        artifact: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let actual = format!("{:x}", Sha256::digest(&bytes));
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(ModelLoadError::DigestMismatch {
            artifact: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Production loader reading artifacts from a model directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxLoader;

impl ModelLoader for OnnxLoader {
    fn load(&self, location: &Path) -> Result<Box<dyn FaceAnalyzer>, ModelLoadError> {
        let manifest = ModelManifest::read(location)?;
        let (detector_path, embedder_path) = manifest.validate(location)?;

        let detector = build_session(&detector_path)?;
        let embedder = build_session(&embedder_path)?;

        tracing::info!(
            detector = %detector_path.display(),
            embedder = %embedder_path.display(),
            "ONNX face models loaded"
        );

        Ok(Box::new(OnnxAnalyzer {
            detector,
            embedder,
            detector_size: (manifest.detector.input_width, manifest.detector.input_height),
            embedder_size: manifest.embedder.input_size,
        }))
    }
}

fn build_session(path: &Path) -> Result<Session, ModelLoadError> {
    let session = Session::builder()
        .map_err(|e| parse_error(path, e))?
        .with_intra_threads(2)
        .map_err(|e| parse_error(path, e))?
        .commit_from_file(path)
        .map_err(|e| parse_error(path, e))?;

    tracing::debug!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "ONNX session ready"
    );
    Ok(session)
}

fn parse_error(path: &Path, e: impl std::fmt::Display) -> ModelLoadError {
    ModelLoadError::Parse {
        artifact: path.display().to_string(),
        reason: e.to_string(),
    }
}

pub struct OnnxAnalyzer {
    detector: Session,
    embedder: Session,
    detector_size: (u32, u32),
    embedder_size: u32,
}

impl OnnxAnalyzer {
    fn detect(&mut self, frame: GrayImage<'_>) -> Result<Vec<BoundingBox>, AnalyzerError> {
        let input = detector_tensor(frame, self.detector_size)?;
        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalyzerError::InferenceFailed(format!("detector scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalyzerError::InferenceFailed(format!("detector boxes: {e}")))?;

        let candidates = decode_detections(
            scores,
            boxes,
            frame.width as f32,
            frame.height as f32,
            DETECTOR_CONFIDENCE_THRESHOLD,
        );
        Ok(nms(candidates, DETECTOR_NMS_THRESHOLD))
    }

    fn embed(&mut self, frame: GrayImage<'_>, face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
        let input = embedder_tensor(frame, face, self.embedder_size)?;
        let outputs = self
            .embedder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalyzerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(AnalyzerError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(raw.to_vec()).l2_normalized())
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, frame: GrayImage<'_>) -> Result<Vec<Detection>, AnalyzerError> {
        let captured_at = Utc::now();
        let faces = self.detect(frame)?;
        Ok(embed_faces(faces, captured_at, |bbox| self.embed(frame, bbox)))
    }

    fn extract_embedding(&mut self, still: GrayImage<'_>) -> Result<Option<Embedding>, AnalyzerError> {
        let faces = self.detect(still)?;
        match faces.first() {
            Some(face) => self.embed(still, face).map(Some),
            None => Ok(None),
        }
    }

    fn mode(&self) -> AnalyzerMode {
        AnalyzerMode::Model
    }
}

/// Embed each detected face. A face that cannot be embedded is dropped
/// and the rest of the frame is kept.
fn embed_faces(
    faces: Vec<BoundingBox>,
    captured_at: chrono::DateTime<Utc>,
    mut embed: impl FnMut(&BoundingBox) -> Result<Embedding, AnalyzerError>,
) -> Vec<Detection> {
    let mut detections = Vec::with_capacity(faces.len());
    for bbox in faces {
        match embed(&bbox) {
            Ok(embedding) => detections.push(Detection {
                bbox,
                embedding,
                captured_at,
                synthetic: false,
            }),
            Err(e) => {
                tracing::warn!(?bbox, error = %e, "face skipped: embedding failed");
            }
        }
    }
    detections
}

fn to_image(frame: GrayImage<'_>) -> Result<image::GrayImage, AnalyzerError> {
    image::GrayImage::from_raw(frame.width, frame.height, frame.data.to_vec())
        .ok_or_else(|| AnalyzerError::InferenceFailed("frame buffer does not match dimensions".into()))
}

/// Grayscale → 3-channel NCHW tensor, normalized per the given mean/std.
fn gray_to_tensor(img: &image::GrayImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in img.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - mean) / std;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = v;
        }
    }
    tensor
}

fn detector_tensor(frame: GrayImage<'_>, (iw, ih): (u32, u32)) -> Result<Array4<f32>, AnalyzerError> {
    let img = to_image(frame)?;
    let resized = imageops::resize(&img, iw, ih, FilterType::Triangle);
    Ok(gray_to_tensor(&resized, DETECTOR_MEAN, DETECTOR_STD))
}

fn embedder_tensor(
    frame: GrayImage<'_>,
    face: &BoundingBox,
    size: u32,
) -> Result<Array4<f32>, AnalyzerError> {
    let img = to_image(frame)?;
    let (x, y, w, h) = crop_region(face, frame.width, frame.height, CROP_MARGIN)
        .ok_or_else(|| AnalyzerError::InferenceFailed("face box lies outside the frame".into()))?;
    let crop = imageops::crop_imm(&img, x, y, w, h).to_image();
    let resized = imageops::resize(&crop, size, size, FilterType::Triangle);
    Ok(gray_to_tensor(&resized, EMBEDDER_MEAN, EMBEDDER_STD))
}

/// Expand a box by `margin` on each side and clamp it to the frame.
fn crop_region(face: &BoundingBox, width: u32, height: u32, margin: f32) -> Option<(u32, u32, u32, u32)> {
    let mx = face.width * margin;
    let my = face.height * margin;
    let x1 = (face.x - mx).max(0.0);
    let y1 = (face.y - my).max(0.0);
    let x2 = (face.x + face.width + mx).min(width as f32);
    let y2 = (face.y + face.height + my).min(height as f32);
    if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
        return None;
    }
    Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// Decode `[N, 2]` class scores and `[N, 4]` normalized corner boxes.
fn decode_detections(
    scores: &[f32],
    boxes: &[f32],
    width: f32,
    height: f32,
    threshold: f32,
) -> Vec<BoundingBox> {
    let n = (scores.len() / 2).min(boxes.len() / 4);
    let mut out = Vec::new();

    for i in 0..n {
        let score = scores[i * 2 + 1];
        if score <= threshold {
            continue;
        }
        let x1 = boxes[i * 4].clamp(0.0, 1.0) * width;
        let y1 = boxes[i * 4 + 1].clamp(0.0, 1.0) * height;
        let x2 = boxes[i * 4 + 2].clamp(0.0, 1.0) * width;
        let y2 = boxes[i * 4 + 3].clamp(0.0, 1.0) * height;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }
    out
}

/// Non-maximum suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> String {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(bytes).unwrap();
        format!("{:x}", Sha256::digest(bytes))
    }

    fn write_manifest(dir: &Path, det_sha: &str, emb_sha: &str) {
        let manifest = format!(
            "[detector]\nfile = \"det.onnx\"\nsha256 = \"{det_sha}\"\n\n\
             [embedder]\nfile = \"emb.onnx\"\nsha256 = \"{emb_sha}\"\ninput_size = 96\n"
        );
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[test]
    fn test_manifest_defaults_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let det = write_file(dir.path(), "det.onnx", b"detector-bytes");
        let emb = write_file(dir.path(), "emb.onnx", b"embedder-bytes");
        write_manifest(dir.path(), &det, &emb);

        let manifest = ModelManifest::read(dir.path()).unwrap();
        assert_eq!(manifest.detector.input_width, 320);
        assert_eq!(manifest.detector.input_height, 240);
        assert_eq!(manifest.embedder.input_size, 96);

        let (d, e) = manifest.validate(dir.path()).unwrap();
        assert!(d.ends_with("det.onnx"));
        assert!(e.ends_with("emb.onnx"));
    }

    #[test]
    fn test_digest_mismatch_rejects_whole_set() {
        let dir = tempfile::tempdir().unwrap();
        let det = write_file(dir.path(), "det.onnx", b"detector-bytes");
        write_file(dir.path(), "emb.onnx", b"tampered");
        write_manifest(dir.path(), &det, &"0".repeat(64));

        let manifest = ModelManifest::read(dir.path()).unwrap();
        assert!(matches!(
            manifest.validate(dir.path()),
            Err(ModelLoadError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_manifest_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            OnnxLoader.load(dir.path()),
            Err(ModelLoadError::Fetch { .. })
        ));
    }

    #[test]
    fn test_malformed_manifest_is_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "detector = 3").unwrap();
        assert!(matches!(
            ModelManifest::read(dir.path()),
            Err(ModelLoadError::Manifest(_))
        ));
    }

    #[test]
    fn test_decode_filters_and_scales() {
        // Two anchors: one background, one face covering the left half.
        let scores = [0.9, 0.1, 0.05, 0.95];
        let boxes = [0.0, 0.0, 0.1, 0.1, 0.0, 0.25, 0.5, 0.75];
        let dets = decode_detections(&scores, &boxes, 640.0, 480.0, 0.7);

        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].x, 0.0);
        assert_eq!(dets[0].y, 120.0);
        assert_eq!(dets[0].width, 320.0);
        assert_eq!(dets[0].height, 240.0);
        assert_eq!(dets[0].confidence, 0.95);
    }

    #[test]
    fn test_nms_suppresses_overlap() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 100.0, height: 100.0, confidence: 0.8 };
        let b = BoundingBox { x: 5.0, y: 5.0, width: 100.0, height: 100.0, confidence: 0.9 };
        let c = BoundingBox { x: 300.0, y: 300.0, width: 50.0, height: 50.0, confidence: 0.75 };

        let kept = nms(vec![a, b, c], 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.75);
    }

    #[test]
    fn test_crop_region_clamps_to_frame() {
        let face = BoundingBox { x: -10.0, y: 20.0, width: 100.0, height: 50.0, confidence: 1.0 };
        let (x, y, w, h) = crop_region(&face, 80, 60, 0.1).unwrap();
        assert_eq!((x, y), (0, 15));
        assert_eq!(w, 80);
        assert_eq!(h, 45);

        let outside = BoundingBox { x: 500.0, y: 500.0, width: 10.0, height: 10.0, confidence: 1.0 };
        assert!(crop_region(&outside, 80, 60, 0.1).is_none());
    }

    #[test]
    fn test_tensor_shape_and_channels() {
        let data = vec![128u8; 32 * 24];
        let frame = GrayImage::new(&data, 32, 24).unwrap();
        let tensor = detector_tensor(frame, (16, 12)).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 12, 16]);

        let expected = (128.0 - DETECTOR_MEAN) / DETECTOR_STD;
        assert!((tensor[[0, 0, 3, 5]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 3, 5]], tensor[[0, 2, 3, 5]]);
    }

    #[test]
    fn test_unembeddable_face_is_skipped() {
        let data = vec![100u8; 64 * 48];
        let frame = GrayImage::new(&data, 64, 48).unwrap();
        let good = BoundingBox { x: 10.0, y: 10.0, width: 20.0, height: 20.0, confidence: 0.9 };
        // Clamped against the right edge it is narrower than one pixel.
        let sliver = BoundingBox { x: 63.8, y: 5.0, width: 0.1, height: 10.0, confidence: 0.95 };

        let detections = embed_faces(vec![sliver, good], Utc::now(), |bbox| {
            embedder_tensor(frame, bbox, 16)?;
            Ok(Embedding::new(vec![0.5; EMBEDDING_DIM]))
        });

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, good);
        assert!(!detections[0].synthetic);
    }
}
