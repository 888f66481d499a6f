use crate::common::config::DetectorConfig;
use crate::common::error::{RecognitionError, Result};
use crate::core::BBox;
use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, ExecutionProvider, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::sync::Arc;

/// Overlapping raw boxes above this IoU collapse to the most confident one.
const NMS_IOU_THRESHOLD: f32 = 0.45;
/// Raw predictions below this are noise, dropped before NMS.
const RAW_CONFIDENCE_FLOOR: f32 = 0.001;
const MAX_DETECTIONS: usize = 50;

const MIN_PERSON_WIDTH: f32 = 20.0;
const MAX_PERSON_WIDTH: f32 = 800.0;
const MIN_PERSON_HEIGHT: f32 = 40.0;
const MAX_PERSON_HEIGHT: f32 = 1200.0;
const MIN_ASPECT_RATIO: f32 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
}

/// An object-detection engine that can emit person boxes for a frame.
pub trait PersonBackend: Send + Sync {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>>;
}

/// Person detector: backend inference followed by confidence and geometry
/// filters. Stateless between frames.
pub struct PersonDetector {
    backend: Arc<dyn PersonBackend>,
    cfg: DetectorConfig,
}

impl PersonDetector {
    pub fn new(backend: Arc<dyn PersonBackend>, cfg: DetectorConfig) -> Self {
        Self { backend, cfg }
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let raw = self.backend.infer(image)?;
        Ok(self.filter(raw))
    }

    /// Batched detection; outputs line up with inputs position-for-position.
    /// Callers hand over at most `batch_size` frames per call.
    pub fn detect_batch(&self, frames: &[&RgbImage]) -> Result<Vec<Vec<Detection>>> {
        frames.iter().map(|frame| self.detect(frame)).collect()
    }

    fn filter(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|det| det.confidence >= self.cfg.confidence)
            .filter(|det| det.bbox.area() >= self.cfg.min_person_area)
            .filter(|det| {
                let aspect = det.bbox.aspect_ratio();
                aspect >= MIN_ASPECT_RATIO && aspect <= self.cfg.max_aspect_ratio
            })
            .filter(|det| {
                let w = det.bbox.width();
                let h = det.bbox.height();
                (MIN_PERSON_WIDTH..=MAX_PERSON_WIDTH).contains(&w)
                    && (MIN_PERSON_HEIGHT..=MAX_PERSON_HEIGHT).contains(&h)
            })
            .collect()
    }
}

/// YOLOv8-family person detector running on ONNX Runtime.
pub struct YoloPersonDetector {
    session: Session,
    _environment: Arc<Environment>,
    cfg: DetectorConfig,
}

impl YoloPersonDetector {
    pub fn new(cfg: &DetectorConfig) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("person_detector")
                .build()
                .map_err(|e| RecognitionError::Model(format!("Failed to create environment: {}", e)))?,
        );

        if !cfg.model_path.exists() {
            return Err(RecognitionError::Model(format!(
                "Person detection model not found at: {:?}",
                cfg.model_path
            )));
        }

        let mut session_builder = SessionBuilder::new(&environment)?;

        let opt_level = match cfg.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        };
        session_builder = session_builder.with_optimization_level(opt_level)?;

        if cfg.device.starts_with("cuda") || cfg.device == "auto" {
            // Falls back to CPU when no accelerator is present.
            session_builder = session_builder
                .with_execution_providers([ExecutionProvider::CUDA(Default::default())])?;
        }

        let session = session_builder.with_model_from_file(&cfg.model_path)?;
        tracing::info!(model = ?cfg.model_path, device = %cfg.device, "Person detector ready");

        Ok(Self {
            session,
            _environment: environment,
            cfg: cfg.clone(),
        })
    }

    fn image_to_array(&self, img: &RgbImage) -> Array4<f32> {
        let width = img.width() as usize;
        let height = img.height() as usize;
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 * norm_factor;
            array[[0, 1, y, x]] = pixel[1] as f32 * norm_factor;
            array[[0, 2, y, x]] = pixel[2] as f32 * norm_factor;
        }
        array
    }

    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<Detection>> {
        let mut detections = Vec::new();
        let input_size = self.cfg.input_size as f32;

        if outputs.is_empty() {
            return Ok(detections);
        }

        let output = outputs[0].try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let data = match output.as_slice() {
            Some(slice) => slice,
            None => return Ok(detections),
        };

        // YOLOv8 emits [1, 4 + classes, N] (transposed) or [1, N, 4 + classes].
        let (num_predictions, prediction_length, is_transposed) = if shape.len() >= 3 {
            if shape[2] > shape[1] {
                (shape[2], shape[1], true)
            } else {
                (shape[1], shape[2], false)
            }
        } else if shape.len() == 2 {
            (shape[0], shape[1], false)
        } else {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Ok(detections);
        };

        if prediction_length < 5 {
            tracing::warn!("Detector output too narrow: {:?}", shape);
            return Ok(detections);
        }

        for i in 0..num_predictions {
            let at = |field: usize| -> f32 {
                if is_transposed {
                    data[field * num_predictions + i]
                } else {
                    data[i * prediction_length + field]
                }
            };

            let (x_center_raw, y_center_raw, width_raw, height_raw) = (at(0), at(1), at(2), at(3));
            // Class scores start at field 4; person is class 0.
            let confidence = at(4);

            if confidence <= RAW_CONFIDENCE_FLOOR {
                continue;
            }

            let scale_factor = if x_center_raw > 1.0 || y_center_raw > 1.0 || width_raw > 1.0 {
                1.0
            } else {
                input_size
            };

            let x_center = x_center_raw * scale_factor;
            let y_center = y_center_raw * scale_factor;
            let width = width_raw * scale_factor;
            let height = height_raw * scale_factor;

            let x1 = (x_center - width / 2.0).max(0.0);
            let y1 = (y_center - height / 2.0).max(0.0);
            let x2 = (x_center + width / 2.0).min(input_size);
            let y2 = (y_center + height / 2.0).min(input_size);

            if x2 > x1 && y2 > y1 {
                detections.push(Detection {
                    bbox: BBox::new(x1, y1, x2, y2),
                    confidence,
                });
            }
        }

        detections = apply_nms(detections, NMS_IOU_THRESHOLD);
        detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.bbox.x1.partial_cmp(&b.bbox.x1).unwrap_or(std::cmp::Ordering::Equal))
        });
        detections.truncate(MAX_DETECTIONS);
        Ok(detections)
    }
}

impl PersonBackend for YoloPersonDetector {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;
        let input_size = self.cfg.input_size;

        let resized = if image.width() == input_size && image.height() == input_size {
            image.clone()
        } else {
            DynamicImage::ImageRgb8(image.clone())
                .resize_exact(input_size, input_size, FilterType::Nearest)
                .to_rgb8()
        };

        let array = self.image_to_array(&resized);
        let cow_array = CowArray::from(array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut detections = self.parse_detections(&outputs)?;

        let scale_x = orig_width / input_size as f32;
        let scale_y = orig_height / input_size as f32;
        for det in &mut detections {
            det.bbox.x1 *= scale_x;
            det.bbox.x2 *= scale_x;
            det.bbox.y1 *= scale_y;
            det.bbox.y2 *= scale_y;
        }

        Ok(detections)
    }
}

fn apply_nms(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if boxes.is_empty() {
        return boxes;
    }

    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut indices: Vec<usize> = (0..boxes.len()).collect();

    while !indices.is_empty() {
        let i = indices[0];
        keep.push(boxes[i].clone());

        indices = indices[1..]
            .iter()
            .filter(|&&j| boxes[i].bbox.iou(&boxes[j].bbox) < iou_threshold)
            .copied()
            .collect();
    }

    keep
}
