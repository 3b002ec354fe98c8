use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::classes::ClassTable;
use crate::error::{Error, Result};
use crate::labels::{self, LabelRecord};
use crate::models::{BoundingBox, ImageSize, Point, Statistics};

/// Boxes per image, plus which images were edited since their last load or save.
#[derive(Debug, Clone, Default)]
pub struct AnnotationStore {
    boxes: HashMap<PathBuf, Vec<BoundingBox>>,
    dirty: HashSet<PathBuf>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxes(&self, image: &Path) -> &[BoundingBox] {
        self.boxes.get(image).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add(&mut self, image: &Path, bbox: BoundingBox) {
        self.boxes.entry(image.to_path_buf()).or_default().push(bbox);
        self.dirty.insert(image.to_path_buf());
    }

    /// First box in storage order that contains `point`.
    pub fn select_box(&self, image: &Path, point: Point) -> Option<&BoundingBox> {
        self.boxes(image).iter().find(|b| b.contains(point))
    }

    /// Removes the first box equal to `bbox`. Returns false if it was already gone.
    pub fn delete_box(&mut self, image: &Path, bbox: &BoundingBox) -> bool {
        let Some(list) = self.boxes.get_mut(image) else {
            return false;
        };
        let Some(idx) = list.iter().position(|b| b == bbox) else {
            return false;
        };
        list.remove(idx);
        self.dirty.insert(image.to_path_buf());
        true
    }

    /// Drops the in-memory list for `image` without touching its label file.
    pub fn clear(&mut self, image: &Path) {
        self.boxes.remove(image);
        self.dirty.remove(image);
    }

    pub fn is_dirty(&self, image: &Path) -> bool {
        self.dirty.contains(image)
    }

    pub fn dirty_images(&self) -> impl Iterator<Item = &Path> {
        self.dirty.iter().map(PathBuf::as_path)
    }

    /// Replaces the boxes of `image` with its label file. A missing file means
    /// no boxes. On any error the previous in-memory list is left as it was.
    pub fn load_for_image(
        &mut self,
        image: &Path,
        classes: &ClassTable,
        size: ImageSize,
    ) -> Result<&[BoundingBox]> {
        let label_path = labels::label_path_for(image);
        let loaded = match fs::read_to_string(&label_path) {
            Ok(text) => {
                let mut out = Vec::new();
                for (idx, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record = LabelRecord::parse(line, &label_path, idx + 1)?;
                    if classes.get(record.class_id).is_none() {
                        return Err(Error::UnknownClassId {
                            path: label_path.clone(),
                            line: idx + 1,
                            id: record.class_id,
                        });
                    }
                    out.push(record.to_box(record.class_id, size));
                }
                debug!("Loaded {} boxes from {}", out.len(), label_path.display());
                out
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::io(&label_path, e)),
        };

        self.dirty.remove(image);
        let slot = self.boxes.entry(image.to_path_buf()).or_default();
        *slot = loaded;
        Ok(slot.as_slice())
    }

    /// Label text for `image`, using each class's stable id.
    pub fn save_for_image(
        &self,
        image: &Path,
        classes: &ClassTable,
        size: ImageSize,
    ) -> Result<String> {
        if size.width == 0 || size.height == 0 {
            return Err(Error::validation(format!("{} has zero size", image.display())));
        }
        let records = self
            .boxes(image)
            .iter()
            .map(|b| match classes.get(b.class) {
                Some(entry) => Ok(LabelRecord::from_box(b, entry.id, size)),
                None => Err(Error::MissingClass(b.class)),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(labels::format_label_text(&records))
    }

    /// Writes the label file next to the image. An image with no boxes gets an
    /// empty file so earlier labels do not linger.
    pub fn write_for_image(
        &mut self,
        image: &Path,
        classes: &ClassTable,
        size: ImageSize,
    ) -> Result<PathBuf> {
        let text = self.save_for_image(image, classes, size)?;
        let label_path = labels::label_path_for(image);
        if let Some(parent) = label_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(&label_path, text).map_err(|e| Error::io(&label_path, e))?;
        self.dirty.remove(image);
        info!(
            "Saved {} boxes to {}",
            self.boxes(image).len(),
            label_path.display()
        );
        Ok(label_path)
    }

    /// Counts over `images`; `current` selects the image for the per-image counts.
    pub fn statistics(&self, images: &[PathBuf], current: Option<&Path>) -> Statistics {
        let mut stats = Statistics {
            total_images: images.len(),
            ..Statistics::default()
        };
        for image in images {
            let boxes = self.boxes(image);
            if !boxes.is_empty() {
                stats.annotated_images += 1;
            }
            for b in boxes {
                *stats.total_class_counts.entry(b.class).or_insert(0) += 1;
            }
        }
        if let Some(current) = current {
            for b in self.boxes(current) {
                *stats.current_class_counts.entry(b.class).or_insert(0) += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::DEFAULT_COLOR;

    fn bbox(x1: f64, y1: f64, x2: f64, y2: f64, class: u32) -> BoundingBox {
        BoundingBox::from_corners(Point::new(x1, y1), Point::new(x2, y2), class)
    }

    fn table() -> ClassTable {
        let mut t = ClassTable::empty();
        t.add("cat", DEFAULT_COLOR).unwrap();
        t.add("dog", DEFAULT_COLOR).unwrap();
        t.add("bird", DEFAULT_COLOR).unwrap();
        t
    }

    const SIZE: ImageSize = ImageSize {
        width: 640,
        height: 480,
    };

    #[test]
    fn select_returns_first_match_in_storage_order() {
        let img = Path::new("a.jpg");
        let mut store = AnnotationStore::new();
        store.add(img, bbox(0.0, 0.0, 100.0, 100.0, 0));
        store.add(img, bbox(50.0, 50.0, 150.0, 150.0, 1));
        assert_eq!(store.select_box(img, Point::new(75.0, 75.0)).unwrap().class, 0);
        assert_eq!(store.select_box(img, Point::new(120.0, 120.0)).unwrap().class, 1);
        assert!(store.select_box(img, Point::new(300.0, 300.0)).is_none());
    }

    #[test]
    fn delete_is_by_value_and_idempotent() {
        let img = Path::new("a.jpg");
        let mut store = AnnotationStore::new();
        let a = bbox(0.0, 0.0, 10.0, 10.0, 0);
        let b = bbox(20.0, 20.0, 40.0, 40.0, 1);
        store.add(img, a.clone());
        store.add(img, b.clone());
        assert!(store.delete_box(img, &a));
        assert!(!store.delete_box(img, &a));
        assert_eq!(store.boxes(img), &[b]);
    }

    #[test]
    fn save_and_load_keep_classes_after_unrelated_class_removal() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("pic.jpg");
        let mut classes = table();
        let bird = classes.by_name("bird").unwrap().id;

        let mut store = AnnotationStore::new();
        store.add(&img, bbox(100.0, 100.0, 300.0, 200.0, bird));
        assert!(store.is_dirty(&img));
        store.write_for_image(&img, &classes, SIZE).unwrap();
        assert!(!store.is_dirty(&img));

        classes.remove("cat").unwrap();
        let mut fresh = AnnotationStore::new();
        let loaded = fresh.load_for_image(&img, &classes, SIZE).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].class, bird);
        assert!((loaded[0].x1 - 100.0).abs() < 1e-3);
        assert!((loaded[0].y2 - 200.0).abs() < 1e-3);
    }

    #[test]
    fn saving_a_box_of_a_deleted_class_is_reported() {
        let img = Path::new("a.jpg");
        let mut classes = table();
        let dog = classes.by_name("dog").unwrap().id;
        let mut store = AnnotationStore::new();
        store.add(img, bbox(0.0, 0.0, 50.0, 50.0, dog));
        classes.remove("dog").unwrap();
        assert!(matches!(
            store.save_for_image(img, &classes, SIZE),
            Err(Error::MissingClass(id)) if id == dog
        ));
    }

    #[test]
    fn unknown_class_id_fails_and_keeps_previous_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("pic.jpg");
        let label = labels::label_path_for(&img);
        fs::create_dir_all(label.parent().unwrap()).unwrap();
        fs::write(&label, "0 0.5 0.5 0.1 0.1\n7 0.5 0.5 0.1 0.1\n").unwrap();

        let mut store = AnnotationStore::new();
        store.add(&img, bbox(1.0, 1.0, 20.0, 20.0, 0));
        let err = store.load_for_image(&img, &table(), SIZE).unwrap_err();
        assert!(matches!(err, Error::UnknownClassId { line: 2, id: 7, .. }));
        assert_eq!(store.boxes(&img).len(), 1);
        assert!(store.is_dirty(&img));
    }

    #[test]
    fn missing_label_file_means_no_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("pic.jpg");
        let mut store = AnnotationStore::new();
        store.add(&img, bbox(1.0, 1.0, 20.0, 20.0, 0));
        assert!(store.load_for_image(&img, &table(), SIZE).unwrap().is_empty());
    }

    #[test]
    fn statistics_count_per_class() {
        let a = PathBuf::from("a.jpg");
        let b = PathBuf::from("b.jpg");
        let c = PathBuf::from("c.jpg");
        let mut store = AnnotationStore::new();
        store.add(&a, bbox(0.0, 0.0, 10.0, 10.0, 0));
        store.add(&a, bbox(0.0, 0.0, 10.0, 10.0, 1));
        store.add(&b, bbox(0.0, 0.0, 10.0, 10.0, 1));
        let stats = store.statistics(&[a.clone(), b, c], Some(&a));
        assert_eq!(stats.total_images, 3);
        assert_eq!(stats.annotated_images, 2);
        assert_eq!(stats.total_class_counts.get(&1), Some(&2));
        assert_eq!(stats.current_class_counts.len(), 2);
    }

    #[test]
    fn zero_size_cannot_be_saved() {
        let img = Path::new("a.jpg");
        let mut store = AnnotationStore::new();
        store.add(img, bbox(0.0, 0.0, 50.0, 50.0, 0));
        let err = store.save_for_image(img, &table(), ImageSize::new(640, 0)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
