use crate::common::error::{RecognitionError, Result};
use crate::core::recognizer::{Encoding, ENCODING_LEN};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

const STORE_VERSION: u32 = 1;

/// One registered face exemplar. The same `(name, person_id)` may appear
/// multiple times; extra registrations are additional exemplars.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceEntry {
    pub name: String,
    pub person_id: String,
    pub encoding: Encoding,
    pub image_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<FaceEntry>,
}

/// Append-only face database persisted as a single blob, rewritten
/// atomically (write-to-temp then rename) on every mutation.
pub struct FaceStore {
    store_file: PathBuf,
    faces_dir: PathBuf,
    entries: Mutex<Vec<FaceEntry>>,
}

impl FaceStore {
    pub fn open(store_file: PathBuf, faces_dir: PathBuf) -> Result<Self> {
        if let Some(parent) = store_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&faces_dir)?;

        let entries = Self::load(&store_file)?;
        tracing::info!(count = entries.len(), file = ?store_file, "Face store loaded");

        Ok(Self {
            store_file,
            faces_dir,
            entries: Mutex::new(entries),
        })
    }

    fn load(store_file: &PathBuf) -> Result<Vec<FaceEntry>> {
        if !store_file.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(store_file)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let file: StoreFile = bincode::deserialize(&data)
            .map_err(|e| RecognitionError::Storage(format!("Failed to deserialize face store: {}", e)))?;
        Ok(file.entries)
    }

    /// Append one entry, optionally saving its face crop, and rewrite the
    /// blob.
    pub fn add(
        &self,
        name: &str,
        person_id: &str,
        encoding: Encoding,
        image: Option<&RgbImage>,
    ) -> Result<FaceEntry> {
        if encoding.len() != ENCODING_LEN {
            return Err(RecognitionError::Storage(format!(
                "Encoding length {} does not match store constant {}",
                encoding.len(),
                ENCODING_LEN
            )));
        }

        let image_path = match image {
            Some(img) => Some(self.save_face_image(img, name)?),
            None => None,
        };

        let entry = FaceEntry {
            name: name.to_string(),
            person_id: person_id.to_string(),
            encoding,
            image_path,
            created_at: Utc::now(),
        };

        let mut entries = self.entries.lock().unwrap();
        entries.push(entry.clone());
        self.save(&entries)?;
        Ok(entry)
    }

    pub fn list(&self) -> Vec<FaceEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Remove every entry and its saved image.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            if let Some(path) = &entry.image_path {
                let _ = fs::remove_file(path);
            }
        }
        entries.clear();
        self.save(&entries)?;
        tracing::info!("Face store cleared");
        Ok(())
    }

    fn save(&self, entries: &[FaceEntry]) -> Result<()> {
        let file = StoreFile {
            version: STORE_VERSION,
            entries: entries.to_vec(),
        };
        let encoded = bincode::serialize(&file)
            .map_err(|e| RecognitionError::Storage(format!("Failed to serialize face store: {}", e)))?;

        let tmp = self.store_file.with_extension("bin.tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.store_file)?;
        Ok(())
    }

    fn save_face_image(&self, image: &RgbImage, name: &str) -> Result<String> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let path = self
            .faces_dir
            .join(format!("{}_{}.jpg", slugify(name), timestamp));
        image::DynamicImage::ImageRgb8(image.clone()).save(&path)?;
        Ok(path.to_string_lossy().into_owned())
    }
}

fn slugify(text: &str) -> String {
    let slug: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "face".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoding(value: f32) -> Encoding {
        let mut enc = vec![0.0; ENCODING_LEN];
        enc[0] = value;
        enc
    }

    fn open_in(dir: &std::path::Path) -> FaceStore {
        FaceStore::open(dir.join("faces.bin"), dir.join("faces")).unwrap()
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn empty_file_is_an_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("faces.bin"), b"").unwrap();
        let store = open_in(tmp.path());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn save_then_reload_round_trips_entries_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open_in(tmp.path());
            store.add("Alice", "A1", encoding(0.1), None).unwrap();
            store.add("Bob", "B2", encoding(0.2), None).unwrap();
        }

        let store = open_in(tmp.path());
        let entries = store.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Alice");
        assert_eq!(entries[0].person_id, "A1");
        assert_eq!(entries[0].encoding[0], 0.1);
        assert_eq!(entries[1].name, "Bob");
    }

    #[test]
    fn duplicate_registrations_are_extra_exemplars() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        store.add("Alice", "A1", encoding(0.1), None).unwrap();
        store.add("Alice", "A1", encoding(0.3), None).unwrap();
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn rejects_wrong_encoding_length() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        assert!(store.add("Alice", "A1", vec![0.0; 64], None).is_err());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn clear_truncates_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open_in(tmp.path());
            store.add("Alice", "A1", encoding(0.1), None).unwrap();
            store.clear().unwrap();
            assert_eq!(store.count(), 0);
        }
        let store = open_in(tmp.path());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn saves_the_face_image_beside_the_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let img = RgbImage::from_pixel(32, 32, image::Rgb([120, 90, 60]));
        let entry = store.add("Alice Smith", "A1", encoding(0.1), Some(&img)).unwrap();
        let path = entry.image_path.unwrap();
        assert!(std::path::Path::new(&path).exists());
        assert!(path.contains("alice-smith"));
    }

    #[test]
    fn no_temp_file_is_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        store.add("Alice", "A1", encoding(0.1), None).unwrap();
        assert!(!tmp.path().join("faces.bin.tmp").exists());
        assert!(tmp.path().join("faces.bin").exists());
    }
}
