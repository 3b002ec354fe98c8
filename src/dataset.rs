use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::labels::LABELS_DIR;
use crate::models::ImageSize;

pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

const MODIFIED_RECORDS_FILE: &str = "modified_records.txt";

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)))
}

/// Image files directly inside `folder`, sorted by path.
pub fn scan_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(folder).map_err(|e| Error::io(folder, e))?;
    let mut images: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    debug!("Found {} images in {}", images.len(), folder.display());
    Ok(images)
}

/// Reads only the header, not the pixels.
pub fn probe_size(path: &Path) -> Result<ImageSize> {
    let (width, height) = image::image_dimensions(path).map_err(|source| Error::ImageProbe {
        path: path.to_path_buf(),
        source,
    })?;
    if width == 0 || height == 0 {
        return Err(Error::validation(format!("{} has zero size", path.display())));
    }
    Ok(ImageSize::new(width, height))
}

/// File names of images whose labels have been saved at least once, kept in
/// `labels/modified_records.txt` so progress survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressLog {
    names: BTreeSet<String>,
}

impl ProgressLog {
    pub fn path_for(image_dir: &Path) -> PathBuf {
        image_dir.join(LABELS_DIR).join(MODIFIED_RECORDS_FILE)
    }

    pub fn load(image_dir: &Path) -> Result<Self> {
        let path = Self::path_for(image_dir);
        let mut log = Self::default();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(Error::io(&path, e)),
        };
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::io(&path, e))?;
            let name = line.trim();
            if !name.is_empty() {
                log.names.insert(name.to_string());
            }
        }
        Ok(log)
    }

    pub fn save(&self, image_dir: &Path) -> Result<()> {
        let path = Self::path_for(image_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        for name in &self.names {
            writeln!(file, "{name}").map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }

    pub fn mark(&mut self, image_path: &Path) {
        match image_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => {
                self.names.insert(name.to_string());
            }
            None => warn!("Cannot record non UTF-8 file name {}", image_path.display()),
        }
    }

    pub fn contains(&self, image_path: &Path) -> bool {
        image_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.names.contains(n))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_keeps_images_only_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.tiff"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let names: Vec<String> = scan_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.tiff"]);
    }

    #[test]
    fn scan_of_missing_folder_is_an_io_error() {
        let err = scan_images(Path::new("/definitely/not/here")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn probe_reads_png_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        image::RgbImage::new(64, 48).save(&path).unwrap();
        assert_eq!(probe_size(&path).unwrap(), ImageSize::new(64, 48));
    }

    #[test]
    fn progress_log_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ProgressLog::load(dir.path()).unwrap();
        assert!(log.is_empty());
        log.mark(&dir.path().join("a.jpg"));
        log.save(dir.path()).unwrap();

        let again = ProgressLog::load(dir.path()).unwrap();
        assert!(again.contains(Path::new("/elsewhere/a.jpg")));
        assert_eq!(again.len(), 1);
    }
}
