use crate::common::config::FaceConfig;
use crate::common::error::{RecognitionError, Result};
use crate::core::{quality, BBox, Track, TrackStatus};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Store-wide encoding length, enforced on every insert.
pub const ENCODING_LEN: usize = 128;

pub type Encoding = Vec<f32>;

/// A face found at any quality is good enough to stop the multi-scale sweep.
const EARLY_EXIT_QUALITY: f32 = 0.6;
/// Faces from different upsample levels overlapping above this are the same face.
const DEDUPE_IOU: f32 = 0.5;
/// Matches on low-quality faces get their confidence damped.
const LOW_QUALITY_CUTOFF: f32 = 0.6;
const LOW_QUALITY_PENALTY: f32 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub bbox: BBox,
    pub confidence: f32,
}

/// A face detection/encoding engine. Upsample level `n` examines the crop
/// magnified by 2^n, pulling small distant faces into range.
pub trait FaceBackend: Send + Sync {
    fn detect(&self, image: &RgbImage, upsample: u32) -> Result<Vec<FaceBox>>;
    fn encode(&self, image: &RgbImage, face: &FaceBox) -> Result<Encoding>;
}

/// Immutable snapshot of every known encoding. Mutations build a fresh
/// snapshot and publish it atomically, so readers never observe a torn view.
#[derive(Debug, Clone, Default)]
pub struct FaceIndex {
    pub encodings: Vec<Encoding>,
    pub names: Vec<String>,
    pub person_ids: Vec<String>,
}

impl FaceIndex {
    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    /// Index and Euclidean distance of the closest stored encoding.
    pub fn best_match(&self, encoding: &[f32]) -> Option<(usize, f32)> {
        self.encodings
            .iter()
            .map(|known| euclidean_distance(known, encoding))
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[derive(Debug, Clone)]
pub struct ScoredFace {
    pub face: FaceBox,
    pub quality: f32,
    pub upsample: u32,
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Known {
        name: String,
        person_id: String,
        confidence: f32,
    },
    Unknown {
        distance: Option<f32>,
    },
}

/// Result of examining one person crop: the face location in crop-local
/// coordinates plus the match verdict.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub face_bbox: BBox,
    pub quality: f32,
    pub outcome: MatchOutcome,
}

/// Face recognizer: multi-scale detection, quality-gated encoding, and
/// adaptive-tolerance matching against the in-memory encoding mirror.
pub struct FaceRecognizer {
    backend: Arc<dyn FaceBackend>,
    cfg: FaceConfig,
    index: RwLock<Arc<FaceIndex>>,
}

impl FaceRecognizer {
    pub fn new(backend: Arc<dyn FaceBackend>, cfg: FaceConfig) -> Self {
        Self {
            backend,
            cfg,
            index: RwLock::new(Arc::new(FaceIndex::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<FaceIndex> {
        self.index.read().unwrap().clone()
    }

    pub fn known_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Replace the mirror wholesale, e.g. from the face store at startup.
    pub fn install<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String, Encoding)>,
    {
        let mut index = FaceIndex::default();
        for (name, person_id, encoding) in entries {
            check_encoding(&encoding)?;
            index.names.push(name);
            index.person_ids.push(person_id);
            index.encodings.push(encoding);
        }
        *self.index.write().unwrap() = Arc::new(index);
        Ok(())
    }

    /// Append one entry, publishing a new snapshot.
    pub fn push(&self, name: &str, person_id: &str, encoding: Encoding) -> Result<()> {
        check_encoding(&encoding)?;
        let mut guard = self.index.write().unwrap();
        let mut next = (**guard).clone();
        next.names.push(name.to_string());
        next.person_ids.push(person_id.to_string());
        next.encodings.push(encoding);
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn clear(&self) {
        *self.index.write().unwrap() = Arc::new(FaceIndex::default());
    }

    /// Matching threshold, relaxed monotonically as quality drops.
    pub fn adaptive_tolerance(&self, face_quality: f32) -> f32 {
        let base = self.cfg.base_tolerance;
        if face_quality >= 0.7 {
            base
        } else if face_quality >= 0.5 {
            (base + 0.05).min(0.70)
        } else {
            (base + 0.10).min(0.75)
        }
    }

    /// A Known track refreshed within the tracking TTL needs no re-detection;
    /// Unknown and Tracking tracks are always re-examined.
    pub fn may_skip(&self, track: &Track) -> bool {
        if track.status != TrackStatus::Known {
            return false;
        }
        let ttl = Duration::from_secs_f64(self.cfg.tracking_ttl_secs);
        track
            .face_last_seen
            .and_then(|seen| seen.elapsed().ok())
            .map(|elapsed| elapsed < ttl)
            .unwrap_or(false)
    }

    /// Multi-scale sweep over upsample levels 0..=max, stopping as soon as a
    /// good face appears. Overlapping candidates collapse to the best
    /// quality.
    pub fn detect_best_face(&self, crop: &RgbImage) -> Result<Option<ScoredFace>> {
        let mut found: Vec<ScoredFace> = Vec::new();

        for upsample in 0..=self.cfg.max_upsample {
            let faces = match self.backend.detect(crop, upsample) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::debug!(upsample, "Face detection failed: {}", e);
                    continue;
                }
            };

            for face in faces {
                let clamped = face.bbox.clamp_to(crop.width(), crop.height());
                if clamped.area() < 1.0 {
                    continue;
                }
                let face_crop = crop_region(crop, &clamped);
                let quality = quality::assess(&face_crop);
                let candidate = ScoredFace {
                    face: FaceBox {
                        bbox: clamped,
                        confidence: face.confidence,
                    },
                    quality,
                    upsample,
                };

                match found
                    .iter_mut()
                    .find(|existing| existing.face.bbox.iou(&clamped) > DEDUPE_IOU)
                {
                    Some(existing) => {
                        if candidate.quality > existing.quality {
                            *existing = candidate;
                        }
                    }
                    None => found.push(candidate),
                }
            }

            if found.iter().any(|f| f.quality >= EARLY_EXIT_QUALITY) {
                break;
            }
        }

        found.sort_by(|a, b| {
            b.quality
                .partial_cmp(&a.quality)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(found.into_iter().next())
    }

    /// Encode a face crop after the angle/lighting preprocessing.
    pub fn encode_face(&self, image: &RgbImage, face: &FaceBox) -> Result<Encoding> {
        let enhanced = quality::enhance_for_encoding(image);
        let encoding = self.backend.encode(&enhanced, face)?;
        check_encoding(&encoding)?;
        Ok(encoding)
    }

    pub fn match_encoding(&self, encoding: &[f32], face_quality: f32) -> MatchOutcome {
        let index = self.snapshot();
        let Some((best, distance)) = index.best_match(encoding) else {
            return MatchOutcome::Unknown { distance: None };
        };

        let tolerance = self.adaptive_tolerance(face_quality);
        if distance <= tolerance {
            let mut confidence = (1.0 - distance / tolerance).clamp(0.0, 1.0);
            if face_quality < LOW_QUALITY_CUTOFF {
                confidence *= LOW_QUALITY_PENALTY;
            }
            MatchOutcome::Known {
                name: index.names[best].clone(),
                person_id: index.person_ids[best].clone(),
                confidence,
            }
        } else {
            MatchOutcome::Unknown {
                distance: Some(distance),
            }
        }
    }

    /// Full per-track path: detect, quality-gate, encode, match. `None`
    /// means no usable face; the track stays in `Tracking`.
    pub fn analyze(&self, crop: &RgbImage) -> Result<Option<FaceObservation>> {
        let Some(scored) = self.detect_best_face(crop)? else {
            return Ok(None);
        };

        if scored.quality < self.cfg.quality_threshold {
            tracing::debug!(quality = scored.quality, "Face below quality threshold, skipping");
            return Ok(None);
        }

        let encoding = self.encode_face(crop, &scored.face)?;
        let outcome = self.match_encoding(&encoding, scored.quality);
        Ok(Some(FaceObservation {
            face_bbox: scored.face.bbox,
            quality: scored.quality,
            outcome,
        }))
    }

    /// Registration fast path: the subject is close, so a single upsample=0
    /// pass suffices. Returns the best face and its encoding.
    pub fn register_encoding(&self, image: &RgbImage) -> Result<(FaceBox, Encoding)> {
        let mut faces = self.backend.detect(image, 0)?;
        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let face = faces.into_iter().next().ok_or(RecognitionError::NoFace)?;
        let face = FaceBox {
            bbox: face.bbox.clamp_to(image.width(), image.height()),
            confidence: face.confidence,
        };
        if face.bbox.area() < 1.0 {
            return Err(RecognitionError::NoFace);
        }
        let encoding = self.encode_face(image, &face)?;
        Ok((face, encoding))
    }
}

fn check_encoding(encoding: &[f32]) -> Result<()> {
    if encoding.len() != ENCODING_LEN {
        return Err(RecognitionError::Storage(format!(
            "Encoding length {} does not match store constant {}",
            encoding.len(),
            ENCODING_LEN
        )));
    }
    Ok(())
}

pub fn crop_region(img: &RgbImage, bbox: &BBox) -> RgbImage {
    let clamped = bbox.clamp_to(img.width(), img.height());
    let x = clamped.x1 as u32;
    let y = clamped.y1 as u32;
    let w = (clamped.width() as u32).max(1).min(img.width().saturating_sub(x).max(1));
    let h = (clamped.height() as u32).max(1).min(img.height().saturating_sub(y).max(1));
    image::imageops::crop_imm(img, x, y, w, h).to_image()
}

/// Two-stage ONNX face engine: a detector session plus a 128-d encoder
/// session.
pub struct OnnxFaceEngine {
    detector: Session,
    encoder: Session,
    _environment: Arc<Environment>,
    cfg: FaceConfig,
}

impl OnnxFaceEngine {
    pub fn new(cfg: &FaceConfig) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_engine")
                .build()
                .map_err(|e| RecognitionError::Model(format!("Failed to create environment: {}", e)))?,
        );

        for path in [&cfg.detector_model_path, &cfg.encoder_model_path] {
            if !path.exists() {
                return Err(RecognitionError::Model(format!(
                    "Face model not found at: {:?}",
                    path
                )));
            }
        }

        let detector = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(&cfg.detector_model_path)?;
        let encoder = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(&cfg.encoder_model_path)?;

        tracing::info!(
            detector = ?cfg.detector_model_path,
            encoder = ?cfg.encoder_model_path,
            "Face engine ready"
        );

        Ok(Self {
            detector,
            encoder,
            _environment: environment,
            cfg: cfg.clone(),
        })
    }

    fn image_to_array(img: &RgbImage) -> Array4<f32> {
        let width = img.width() as usize;
        let height = img.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));
        let norm = 1.0 / 255.0;
        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 * norm;
            array[[0, 1, y, x]] = pixel[1] as f32 * norm;
            array[[0, 2, y, x]] = pixel[2] as f32 * norm;
        }
        array
    }

    fn parse_faces(&self, outputs: &[Value], input_size: f32) -> Result<Vec<FaceBox>> {
        let mut faces = Vec::new();
        if outputs.is_empty() {
            return Ok(faces);
        }

        let output = outputs[0].try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let data = match output.as_slice() {
            Some(slice) => slice,
            None => return Ok(faces),
        };

        let (num_predictions, prediction_length, is_transposed) = if shape.len() >= 3 {
            if shape[2] > shape[1] {
                (shape[2], shape[1], true)
            } else {
                (shape[1], shape[2], false)
            }
        } else if shape.len() == 2 {
            (shape[0], shape[1], false)
        } else {
            return Ok(faces);
        };

        if prediction_length < 5 {
            return Ok(faces);
        }

        for i in 0..num_predictions {
            let at = |field: usize| -> f32 {
                if is_transposed {
                    data[field * num_predictions + i]
                } else {
                    data[i * prediction_length + field]
                }
            };

            let confidence = at(4);
            if confidence < 0.3 {
                continue;
            }

            let scale = if at(0) > 1.0 || at(2) > 1.0 { 1.0 } else { input_size };
            let x_center = at(0) * scale;
            let y_center = at(1) * scale;
            let width = at(2) * scale;
            let height = at(3) * scale;

            let x1 = (x_center - width / 2.0).max(0.0);
            let y1 = (y_center - height / 2.0).max(0.0);
            let x2 = (x_center + width / 2.0).min(input_size);
            let y2 = (y_center + height / 2.0).min(input_size);
            if x2 > x1 && y2 > y1 {
                faces.push(FaceBox {
                    bbox: BBox::new(x1, y1, x2, y2),
                    confidence,
                });
            }
        }

        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        faces.truncate(8);
        Ok(faces)
    }
}

impl FaceBackend for OnnxFaceEngine {
    fn detect(&self, image: &RgbImage, upsample: u32) -> Result<Vec<FaceBox>> {
        let magnify = 1u32 << upsample;
        let magnified;
        let working = if magnify > 1 {
            magnified = DynamicImage::ImageRgb8(image.clone())
                .resize_exact(
                    image.width() * magnify,
                    image.height() * magnify,
                    FilterType::Triangle,
                )
                .to_rgb8();
            &magnified
        } else {
            image
        };

        let input_size = self.cfg.detector_input_size;
        let resized = DynamicImage::ImageRgb8(working.clone())
            .resize_exact(input_size, input_size, FilterType::Triangle)
            .to_rgb8();

        let array = Self::image_to_array(&resized);
        let cow_array = CowArray::from(array.into_dyn());
        let input_tensor = Value::from_array(self.detector.allocator(), &cow_array)?;
        let outputs = self.detector.run(vec![input_tensor])?;

        let mut faces = self.parse_faces(&outputs, input_size as f32)?;

        // Back through the model input scale, then the magnification.
        let scale_x = working.width() as f32 / input_size as f32;
        let scale_y = working.height() as f32 / input_size as f32;
        let inv_magnify = 1.0 / magnify as f32;
        for face in &mut faces {
            face.bbox.x1 *= scale_x * inv_magnify;
            face.bbox.x2 *= scale_x * inv_magnify;
            face.bbox.y1 *= scale_y * inv_magnify;
            face.bbox.y2 *= scale_y * inv_magnify;
        }

        Ok(faces)
    }

    fn encode(&self, image: &RgbImage, face: &FaceBox) -> Result<Encoding> {
        let face_crop = crop_region(image, &face.bbox);
        let size = self.cfg.encoder_input_size;
        let resized = DynamicImage::ImageRgb8(face_crop)
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        // ArcFace-style normalization.
        let size = size as usize;
        let mut array = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = (pixel[0] as f32 - 127.5) / 127.5;
            array[[0, 1, y, x]] = (pixel[1] as f32 - 127.5) / 127.5;
            array[[0, 2, y, x]] = (pixel[2] as f32 - 127.5) / 127.5;
        }

        let cow_array = CowArray::from(array.into_dyn());
        let input_tensor = Value::from_array(self.encoder.allocator(), &cow_array)?;
        let outputs = self.encoder.run(vec![input_tensor])?;

        let embedding = outputs[0]
            .try_extract::<f32>()?
            .view()
            .to_owned()
            .into_raw_vec();
        check_encoding(&embedding)?;
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubBackend {
        faces_per_level: Vec<Vec<FaceBox>>,
        calls: AtomicU32,
        encoding: Encoding,
    }

    impl StubBackend {
        fn new(faces_per_level: Vec<Vec<FaceBox>>, encoding: Encoding) -> Self {
            Self {
                faces_per_level,
                calls: AtomicU32::new(0),
                encoding,
            }
        }
    }

    impl FaceBackend for StubBackend {
        fn detect(&self, _image: &RgbImage, upsample: u32) -> Result<Vec<FaceBox>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .faces_per_level
                .get(upsample as usize)
                .cloned()
                .unwrap_or_default())
        }

        fn encode(&self, _image: &RgbImage, _face: &FaceBox) -> Result<Encoding> {
            Ok(self.encoding.clone())
        }
    }

    fn face(x1: f32, y1: f32, x2: f32, y2: f32) -> FaceBox {
        FaceBox {
            bbox: BBox::new(x1, y1, x2, y2),
            confidence: 0.9,
        }
    }

    fn checkerboard(size: u32) -> RgbImage {
        let mut img = RgbImage::new(size, size);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let value = if (x + y) % 2 == 0 { 40 } else { 216 };
            *pixel = Rgb([value, value, value]);
        }
        img
    }

    fn encoding_at(value: f32) -> Encoding {
        let mut enc = vec![0.0; ENCODING_LEN];
        enc[0] = value;
        enc
    }

    fn recognizer(backend: StubBackend) -> FaceRecognizer {
        FaceRecognizer::new(Arc::new(backend), FaceConfig::default())
    }

    #[test]
    fn tolerance_relaxes_as_quality_drops() {
        let r = recognizer(StubBackend::new(vec![], encoding_at(0.0)));
        assert_eq!(r.adaptive_tolerance(0.9), 0.65);
        assert_eq!(r.adaptive_tolerance(0.7), 0.65);
        assert!((r.adaptive_tolerance(0.55) - 0.70).abs() < 1e-6);
        assert!((r.adaptive_tolerance(0.3) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn tolerance_caps_hold_for_high_bases() {
        let backend = StubBackend::new(vec![], encoding_at(0.0));
        let mut cfg = FaceConfig::default();
        cfg.base_tolerance = 0.72;
        let r = FaceRecognizer::new(Arc::new(backend), cfg);
        assert!((r.adaptive_tolerance(0.55) - 0.70).abs() < 1e-6);
        assert!((r.adaptive_tolerance(0.3) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn borderline_distance_matches_only_with_relaxed_tolerance() {
        let r = recognizer(StubBackend::new(vec![], encoding_at(0.0)));
        r.push("Alice", "A1", encoding_at(0.0)).unwrap();

        // Distance 0.68 sits in (0.65, 0.70].
        let probe = encoding_at(0.68);

        // Quality 0.55 relaxes tolerance to 0.70: Known.
        match r.match_encoding(&probe, 0.55) {
            MatchOutcome::Known { name, confidence, .. } => {
                assert_eq!(name, "Alice");
                assert!(confidence > 0.0);
            }
            other => panic!("expected Known, got {:?}", other),
        }

        // Quality 0.8 keeps the base tolerance 0.65: Unknown.
        match r.match_encoding(&probe, 0.8) {
            MatchOutcome::Unknown { distance } => {
                assert!((distance.unwrap() - 0.68).abs() < 1e-3);
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn exact_match_has_full_confidence() {
        let r = recognizer(StubBackend::new(vec![], encoding_at(0.4)));
        r.push("Bob", "B2", encoding_at(0.4)).unwrap();
        match r.match_encoding(&encoding_at(0.4), 0.9) {
            MatchOutcome::Known { confidence, person_id, .. } => {
                assert!((confidence - 1.0).abs() < 1e-6);
                assert_eq!(person_id, "B2");
            }
            other => panic!("expected Known, got {:?}", other),
        }
    }

    #[test]
    fn empty_index_is_always_unknown() {
        let r = recognizer(StubBackend::new(vec![], encoding_at(0.0)));
        match r.match_encoding(&encoding_at(0.1), 0.9) {
            MatchOutcome::Unknown { distance } => assert!(distance.is_none()),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn good_face_is_found_at_level_zero() {
        // A large sharp face at level 0 scores over 0.6.
        let backend = StubBackend::new(
            vec![vec![face(0.0, 0.0, 120.0, 120.0)], vec![], vec![]],
            encoding_at(0.0),
        );
        let r = FaceRecognizer::new(Arc::new(backend), FaceConfig::default());
        let scored = r.detect_best_face(&checkerboard(128)).unwrap().unwrap();
        assert!(scored.quality >= 0.6);
        assert_eq!(scored.upsample, 0);
    }

    #[test]
    fn sweep_visits_every_level_when_nothing_is_found() {
        let backend = Arc::new(StubBackend::new(vec![vec![], vec![], vec![]], encoding_at(0.0)));
        let r = FaceRecognizer::new(backend.clone(), FaceConfig::default());
        assert!(r.detect_best_face(&checkerboard(64)).unwrap().is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn sweep_stops_after_level_zero_on_good_quality() {
        let backend = Arc::new(StubBackend::new(
            vec![vec![face(0.0, 0.0, 120.0, 120.0)], vec![], vec![]],
            encoding_at(0.0),
        ));
        let r = FaceRecognizer::new(backend.clone(), FaceConfig::default());
        r.detect_best_face(&checkerboard(128)).unwrap().unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlapping_candidates_collapse_to_best_quality() {
        // Two boxes over the same face; the bigger one scores higher on size.
        let backend = StubBackend::new(
            vec![vec![
                face(0.0, 0.0, 90.0, 90.0),
                face(0.0, 0.0, 100.0, 100.0),
            ]],
            encoding_at(0.0),
        );
        let r = FaceRecognizer::new(Arc::new(backend), FaceConfig::default());
        let scored = r.detect_best_face(&checkerboard(128)).unwrap().unwrap();
        assert!((scored.face.bbox.x2 - 100.0).abs() < 1e-6);
    }

    #[test]
    fn low_quality_face_is_skipped_by_analyze() {
        // Tiny dark crop: face found but quality under the 0.25 gate.
        let img = RgbImage::from_pixel(24, 24, Rgb([8, 8, 8]));
        let backend = StubBackend::new(
            vec![
                vec![face(0.0, 0.0, 20.0, 20.0)],
                vec![face(0.0, 0.0, 20.0, 20.0)],
                vec![face(0.0, 0.0, 20.0, 20.0)],
            ],
            encoding_at(0.0),
        );
        let r = FaceRecognizer::new(Arc::new(backend), FaceConfig::default());
        assert!(r.analyze(&img).unwrap().is_none());
    }

    #[test]
    fn push_and_clear_publish_fresh_snapshots() {
        let r = recognizer(StubBackend::new(vec![], encoding_at(0.0)));
        let before = r.snapshot();
        r.push("Alice", "A1", encoding_at(0.0)).unwrap();
        let after = r.snapshot();
        assert_eq!(before.len(), 0);
        assert_eq!(after.len(), 1);

        r.clear();
        assert!(r.snapshot().is_empty());
        // The earlier snapshot is untouched.
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn wrong_encoding_length_is_rejected() {
        let r = recognizer(StubBackend::new(vec![], encoding_at(0.0)));
        assert!(r.push("Alice", "A1", vec![0.0; 64]).is_err());
        assert!(r.install([("A".into(), "1".into(), vec![0.0; 16])]).is_err());
    }

    #[test]
    fn register_encoding_requires_a_face() {
        let backend = StubBackend::new(vec![vec![]], encoding_at(0.0));
        let r = FaceRecognizer::new(Arc::new(backend), FaceConfig::default());
        match r.register_encoding(&checkerboard(64)) {
            Err(RecognitionError::NoFace) => {}
            other => panic!("expected NoFace, got {:?}", other),
        }
    }

    #[test]
    fn register_encoding_uses_the_most_confident_face() {
        let mut weak = face(0.0, 0.0, 30.0, 30.0);
        weak.confidence = 0.4;
        let strong = face(32.0, 32.0, 90.0, 90.0);
        let backend = StubBackend::new(vec![vec![weak, strong]], encoding_at(0.25));
        let r = FaceRecognizer::new(Arc::new(backend), FaceConfig::default());
        let (picked, encoding) = r.register_encoding(&checkerboard(128)).unwrap();
        assert!((picked.bbox.x1 - 32.0).abs() < 1e-6);
        assert_eq!(encoding.len(), ENCODING_LEN);
    }

    #[test]
    fn may_skip_only_recent_known_tracks() {
        use crate::core::tracker::{FaceUpdate, Tracker};
        use crate::core::Detection;

        let r = recognizer(StubBackend::new(vec![], encoding_at(0.0)));
        let mut tracker = Tracker::new(&crate::common::config::TrackerConfig::default());
        tracker.update(&[Detection {
            bbox: BBox::new(0.0, 0.0, 100.0, 200.0),
            confidence: 0.9,
        }]);

        let tracking = tracker.get(1).unwrap().clone();
        assert!(!r.may_skip(&tracking));

        tracker.apply_face(
            1,
            FaceUpdate {
                face_bbox: BBox::new(10.0, 10.0, 50.0, 50.0),
                matched: Some(("A".into(), "1".into())),
                confidence: 0.9,
            },
        );
        let known = tracker.get(1).unwrap().clone();
        assert!(r.may_skip(&known));
    }
}
