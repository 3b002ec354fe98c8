//! Dataset export: random train/valid/test split, image copies, per-split
//! label files and the two YAML documents the trainer reads.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::classes::ClassTable;
use crate::dataset;
use crate::error::{Error, Result};
use crate::labels::{self, LabelRecord};
use crate::models::ClassId;
use crate::store::AnnotationStore;
use crate::training::TrainingConfig;

pub const DATA_YAML: &str = "data.yaml";
pub const TRAIN_CONFIG_YAML: &str = "train_config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Train,
    Valid,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Valid, Partition::Test];

    pub fn dir_name(self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Valid => "valid",
            Partition::Test => "test",
        }
    }

    pub fn images_dir(self, root: &Path) -> PathBuf {
        root.join(self.dir_name()).join("images")
    }

    pub fn labels_dir(self, root: &Path) -> PathBuf {
        root.join(self.dir_name()).join(labels::LABELS_DIR)
    }

    /// Path relative to the export root, always with forward slashes.
    pub fn relative_images(self) -> String {
        format!("{}/images", self.dir_name())
    }
}

/// Percentages per partition. Valid only when they add up to exactly 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRatio {
    pub train: u8,
    pub valid: u8,
    pub test: u8,
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self {
            train: 70,
            valid: 20,
            test: 10,
        }
    }
}

impl SplitRatio {
    pub fn new(train: u8, valid: u8, test: u8) -> Self {
        Self { train, valid, test }
    }

    pub fn validate(&self) -> Result<()> {
        let sum = self.train as u32 + self.valid as u32 + self.test as u32;
        if sum != 100 {
            return Err(Error::validation(format!(
                "train, validation and test percentages must sum to 100, got {sum}"
            )));
        }
        Ok(())
    }

    /// `[train, valid, test]` image counts for `n` images. Train and valid are
    /// floored; the test partition takes whatever is left, so the counts always
    /// add up to `n` and rounding loss lands in test. Percentages over 100 are
    /// capped at `n` rather than rejected; `validate` is the place for that.
    pub fn counts(&self, n: usize) -> [usize; 3] {
        let train = (n * self.train as usize / 100).min(n);
        let valid = (n * self.valid as usize / 100).min(n - train);
        [train, valid, n - train - valid]
    }
}

impl fmt::Display for SplitRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.train, self.valid, self.test)
    }
}

impl FromStr for SplitRatio {
    type Err = Error;

    /// Accepts `70/20/10` or `70,20,10`. Does not check the sum.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(['/', ',']).map(str::trim).collect();
        let [train, valid, test] = parts.as_slice() else {
            return Err(Error::validation(format!(
                "split `{s}` must have three parts, e.g. 70/20/10"
            )));
        };
        let pct = |v: &str| {
            v.parse::<u8>()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| Error::validation(format!("`{v}` is not a percentage")))
        };
        Ok(Self::new(pct(*train)?, pct(*valid)?, pct(*test)?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partitions {
    pub train: Vec<PathBuf>,
    pub valid: Vec<PathBuf>,
    pub test: Vec<PathBuf>,
}

impl Partitions {
    pub fn get(&self, p: Partition) -> &[PathBuf] {
        match p {
            Partition::Train => &self.train,
            Partition::Valid => &self.valid,
            Partition::Test => &self.test,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.valid.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shuffles a copy of `images` and cuts it by `split.counts`.
pub fn partition<R: Rng + ?Sized>(images: &[PathBuf], split: SplitRatio, rng: &mut R) -> Partitions {
    let mut shuffled = images.to_vec();
    shuffled.shuffle(rng);
    let [train, valid, _] = split.counts(shuffled.len());
    let test = shuffled.split_off(train + valid);
    let valid = shuffled.split_off(train);
    Partitions {
        train: shuffled,
        valid,
        test,
    }
}

/// `data.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDescriptor {
    pub train: String,
    pub val: String,
    pub test: String,
    pub nc: usize,
    pub names: Vec<String>,
}

impl DataDescriptor {
    pub fn for_classes(classes: &ClassTable) -> Self {
        Self {
            train: Partition::Train.relative_images(),
            val: Partition::Valid.relative_images(),
            test: Partition::Test.relative_images(),
            nc: classes.len(),
            names: classes.names(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub destination: PathBuf,
    pub split: SplitRatio,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub train: usize,
    pub valid: usize,
    pub test: usize,
    pub labels_written: usize,
    pub data_yaml: PathBuf,
    pub train_config: PathBuf,
}

/// Checks everything that can be checked without touching the filesystem.
fn validate(
    images: &[PathBuf],
    store: &AnnotationStore,
    classes: &ClassTable,
    request: &ExportRequest,
) -> Result<()> {
    if request.destination.as_os_str().is_empty() {
        return Err(Error::validation("export directory is not set"));
    }
    if images.is_empty() {
        return Err(Error::validation("no images loaded to export"));
    }
    request.split.validate()?;
    request.training.validate()?;

    let mut names = HashSet::new();
    for image in images {
        let name = image
            .file_name()
            .ok_or_else(|| Error::validation(format!("{} is not a file", image.display())))?;
        if !names.insert(name) {
            return Err(Error::validation(format!(
                "more than one image is named {}",
                name.to_string_lossy()
            )));
        }
        if let Some(b) = store.boxes(image).iter().find(|b| classes.get(b.class).is_none()) {
            return Err(Error::MissingClass(b.class));
        }
    }
    Ok(())
}

fn create_dirs(root: &Path) -> Result<()> {
    for p in Partition::ALL {
        for dir in [p.images_dir(root), p.labels_dir(root)] {
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
    }
    Ok(())
}

/// Label ids inside an exported dataset are dense positions in `classes`, so
/// they index `names` in `data.yaml`.
fn export_label_text(
    image: &Path,
    store: &AnnotationStore,
    classes: &ClassTable,
) -> Result<Option<String>> {
    let boxes = store.boxes(image);
    if boxes.is_empty() {
        return Ok(None);
    }
    let size = dataset::probe_size(image)?;
    let records = boxes
        .iter()
        .map(|b| {
            let pos = classes.position(b.class).ok_or(Error::MissingClass(b.class))?;
            Ok(LabelRecord::from_box(b, pos as ClassId, size))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(labels::format_label_text(&records)))
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value).map_err(|source| Error::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|e| Error::io(path, e))
}

/// Splits, copies and labels `images` into `request.destination`.
///
/// Validation failures return before anything is created. An I/O failure
/// afterwards stops the export; directories and files already written stay.
pub fn export_dataset<R: Rng + ?Sized>(
    images: &[PathBuf],
    store: &AnnotationStore,
    classes: &ClassTable,
    request: &ExportRequest,
    rng: &mut R,
) -> Result<ExportSummary> {
    validate(images, store, classes, request)?;

    let root = request.destination.as_path();
    create_dirs(root)?;

    let parts = partition(images, request.split, rng);
    info!(
        "Train images: {}, Valid images: {}, Test images: {}",
        parts.train.len(),
        parts.valid.len(),
        parts.test.len()
    );

    let mut labels_written = 0;
    for p in Partition::ALL {
        let images_dir = p.images_dir(root);
        let labels_dir = p.labels_dir(root);
        for image in parts.get(p) {
            // validate() guarantees a file name
            let Some(file_name) = image.file_name() else {
                continue;
            };
            let dest = images_dir.join(file_name);
            fs::copy(image, &dest).map_err(|e| Error::io(image, e))?;

            if let Some(text) = export_label_text(image, store, classes)? {
                let label_path = labels_dir.join(labels::label_file_name(image));
                fs::write(&label_path, text).map_err(|e| Error::io(&label_path, e))?;
                labels_written += 1;
            }
            debug!("Exported {} to {}", image.display(), p.dir_name());
        }
    }

    let data_yaml = root.join(DATA_YAML);
    write_yaml(&data_yaml, &DataDescriptor::for_classes(classes))?;

    let train_config = root.join(TRAIN_CONFIG_YAML);
    write_yaml(&train_config, &request.training)?;

    info!("Exported dataset to {}", root.display());
    Ok(ExportSummary {
        train: parts.train.len(),
        valid: parts.valid.len(),
        test: parts.test.len(),
        labels_written,
        data_yaml,
        train_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("img{i}.jpg"))).collect()
    }

    #[test]
    fn counts_floor_and_give_remainder_to_test() {
        assert_eq!(SplitRatio::new(70, 20, 10).counts(10), [7, 2, 1]);
        assert_eq!(SplitRatio::new(70, 20, 10).counts(3), [2, 0, 1]);
        assert_eq!(SplitRatio::new(33, 33, 34).counts(7), [2, 2, 3]);
        assert_eq!(SplitRatio::new(100, 0, 0).counts(5), [5, 0, 0]);
        assert_eq!(SplitRatio::new(70, 20, 10).counts(0), [0, 0, 0]);
    }

    #[test]
    fn unchecked_splits_still_cover_every_image() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(SplitRatio::new(150, 0, 0).counts(10), [10, 0, 0]);
        assert_eq!(SplitRatio::new(90, 90, 0).counts(10), [9, 1, 0]);
        let parts = partition(&paths(10), SplitRatio::new(150, 0, 0), &mut rng);
        assert_eq!(parts.train.len(), 10);
        assert!(parts.valid.is_empty() && parts.test.is_empty());
    }

    #[test]
    fn every_image_lands_in_exactly_one_partition() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in [1, 2, 9, 10, 37, 101] {
            for split in [
                SplitRatio::new(70, 20, 10),
                SplitRatio::new(0, 0, 100),
                SplitRatio::new(50, 50, 0),
                SplitRatio::new(1, 1, 98),
            ] {
                let images = paths(n);
                let parts = partition(&images, split, &mut rng);
                assert_eq!(parts.len(), n);
                let mut all: Vec<PathBuf> = Partition::ALL
                    .iter()
                    .flat_map(|p| parts.get(*p).to_vec())
                    .collect();
                all.sort();
                let mut expected = images.clone();
                expected.sort();
                assert_eq!(all, expected);
            }
        }
    }

    #[test]
    fn split_parsing_and_validation() {
        assert_eq!("70/20/10".parse::<SplitRatio>().unwrap(), SplitRatio::default());
        assert_eq!("80, 10, 10".parse::<SplitRatio>().unwrap(), SplitRatio::new(80, 10, 10));
        assert!("70/30".parse::<SplitRatio>().is_err());
        assert!("70/20/300".parse::<SplitRatio>().is_err());
        assert!(SplitRatio::new(70, 20, 20).validate().is_err());
        assert!(SplitRatio::new(0, 0, 100).validate().is_ok());
    }

    #[test]
    fn descriptor_lists_classes_in_table_order() {
        let mut classes = ClassTable::empty();
        classes.add("b", [0, 0, 0]).unwrap();
        classes.add("a", [0, 0, 0]).unwrap();
        let d = DataDescriptor::for_classes(&classes);
        assert_eq!(d.train, "train/images");
        assert_eq!(d.val, "valid/images");
        assert_eq!(d.nc, 2);
        assert_eq!(d.names, vec!["b", "a"]);
    }
}
