use crate::common::config::TrackerConfig;
use crate::core::{BBox, Detection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackStatus {
    /// Person detected, face not yet examined or below quality gate.
    Tracking,
    /// Face matched a registered encoding.
    Known,
    /// Face detected but no match in the store.
    Unknown,
}

/// One tracked person. `track_id` is unique for the lifetime of the owning
/// tracker and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub track_id: u64,
    pub bbox: BBox,
    pub detection_confidence: f32,
    pub face_bbox: Option<BBox>,
    pub name: Option<String>,
    pub person_id: Option<String>,
    pub face_confidence: f32,
    pub status: TrackStatus,
    pub frames_tracked: u32,
    pub frames_lost: u32,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub face_last_seen: Option<SystemTime>,
}

impl Track {
    fn new(track_id: u64, detection: &Detection) -> Self {
        let now = SystemTime::now();
        Self {
            track_id,
            bbox: detection.bbox,
            detection_confidence: detection.confidence,
            face_bbox: None,
            name: None,
            person_id: None,
            face_confidence: 0.0,
            status: TrackStatus::Tracking,
            frames_tracked: 1,
            frames_lost: 0,
            first_seen: now,
            last_seen: now,
            face_last_seen: None,
        }
    }

    fn update_detection(&mut self, detection: &Detection) {
        self.bbox = detection.bbox;
        self.detection_confidence = detection.confidence;
        self.last_seen = SystemTime::now();
        self.frames_tracked += 1;
        self.frames_lost = 0;
    }

    /// Rendering advisory for consumers drawing the track.
    pub fn color(&self) -> (u8, u8, u8) {
        match self.status {
            TrackStatus::Known => (0, 255, 0),
            TrackStatus::Unknown => (255, 0, 0),
            TrackStatus::Tracking => (255, 255, 0),
        }
    }
}

/// Face observation reported back by the recognizer for one track.
#[derive(Debug, Clone)]
pub struct FaceUpdate {
    pub face_bbox: BBox,
    /// `(name, person_id)` when the encoding matched a stored face.
    pub matched: Option<(String, String)>,
    pub confidence: f32,
}

/// IoU-based greedy multi-person tracker with short-lived face memory.
/// Not re-entrant; callers hold one lock around each call.
pub struct Tracker {
    iou_threshold: f32,
    max_age: u32,
    face_memory: Duration,
    next_id: u64,
    tracks: HashMap<u64, Track>,
}

impl Tracker {
    pub fn new(cfg: &TrackerConfig) -> Self {
        tracing::debug!(
            max_age = cfg.max_age,
            iou_threshold = cfg.iou_threshold,
            "Tracker initialized"
        );
        Self {
            iou_threshold: cfg.iou_threshold,
            max_age: cfg.max_age,
            face_memory: Duration::from_secs_f64(cfg.face_memory_secs),
            next_id: 1,
            tracks: HashMap::new(),
        }
    }

    /// Fold one frame's detections into the live set and return it.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        for track in self.tracks.values_mut() {
            track.frames_lost += 1;
        }

        // All candidate pairs above the threshold, best overlap first; ties
        // break on track id then detection index so association is
        // deterministic.
        let mut pairs: Vec<(u64, usize, f32)> = Vec::new();
        for track in self.tracks.values() {
            for (det_idx, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((track.track_id, det_idx, iou));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
                .then(a.1.cmp(&b.1))
        });

        let mut matched_tracks = std::collections::HashSet::new();
        let mut matched_dets = std::collections::HashSet::new();
        for (track_id, det_idx, _) in pairs {
            if matched_tracks.contains(&track_id) || matched_dets.contains(&det_idx) {
                continue;
            }
            matched_tracks.insert(track_id);
            matched_dets.insert(det_idx);
            if let Some(track) = self.tracks.get_mut(&track_id) {
                // frames_lost was pre-incremented above; update resets it.
                track.update_detection(&detections[det_idx]);
            }
        }

        for (det_idx, det) in detections.iter().enumerate() {
            if matched_dets.contains(&det_idx) {
                continue;
            }
            let track_id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(track_id, Track::new(track_id, det));
        }

        let max_age = self.max_age;
        self.tracks.retain(|_, track| track.frames_lost <= max_age);
        self.decay_face_memory();

        self.live()
    }

    /// Attach a face observation to a track. Once Known, a track stays Known
    /// until it is removed.
    pub fn apply_face(&mut self, track_id: u64, update: FaceUpdate) {
        let Some(track) = self.tracks.get_mut(&track_id) else {
            return;
        };

        track.face_bbox = Some(update.face_bbox);
        track.face_last_seen = Some(SystemTime::now());

        match update.matched {
            Some((name, person_id)) => {
                track.name = Some(name);
                track.person_id = Some(person_id);
                track.face_confidence = update.confidence;
                track.status = TrackStatus::Known;
            }
            None => {
                if track.status != TrackStatus::Known {
                    track.status = TrackStatus::Unknown;
                    track.face_confidence = update.confidence;
                }
            }
        }
    }

    /// Displayed face data decays after `face_memory`; the track id and a
    /// Known identity survive the decay.
    fn decay_face_memory(&mut self) {
        for track in self.tracks.values_mut() {
            let Some(seen) = track.face_last_seen else {
                continue;
            };
            let expired = seen
                .elapsed()
                .map(|elapsed| elapsed > self.face_memory)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            track.face_bbox = None;
            if track.status == TrackStatus::Unknown {
                track.status = TrackStatus::Tracking;
                track.face_confidence = 0.0;
            }
        }
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    /// Live set ordered by track id.
    pub fn live(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self.tracks.values().cloned().collect();
        tracks.sort_by_key(|t| t.track_id);
        tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop all tracks, e.g. on source change. Ids keep counting up.
    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}
