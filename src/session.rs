//! Interactive editing state, independent of any UI toolkit.
//!
//! A UI forwards pointer events (`press`, `drag`, `release`) in image pixel
//! coordinates; tests call the same operations directly. Per image there is
//! at most one open draft: the session is either `Idle` or `Drawing`.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::Rng;
use rand::seq::IndexedRandom;

use crate::classes::ClassTable;
use crate::dataset::{self, ProgressLog};
use crate::error::{Error, Result};
use crate::export::{self, ExportRequest, ExportSummary};
use crate::models::{BoundingBox, ClassId, ImageSize, Point, Statistics};
use crate::store::AnnotationStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub start: Point,
    pub current: Point,
    pub class: ClassId,
}

impl Draft {
    pub fn rect(&self) -> BoundingBox {
        BoundingBox::from_corners(self.start, self.current, self.class)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum DrawState {
    #[default]
    Idle,
    Drawing(Draft),
}

/// What a primary-button press does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditMode {
    #[default]
    Draw,
    Select,
}

#[derive(Debug)]
struct ActiveImage {
    index: usize,
    size: ImageSize,
}

#[derive(Debug)]
pub struct AnnotationSession {
    classes: ClassTable,
    store: AnnotationStore,
    images: Vec<PathBuf>,
    active: Option<ActiveImage>,
    selected_class: Option<ClassId>,
    selected_box: Option<BoundingBox>,
    state: DrawState,
    mode: EditMode,
    history: Vec<usize>,
    progress: ProgressLog,
    image_dir: Option<PathBuf>,
    autosave: bool,
}

impl AnnotationSession {
    /// The first class, if any, starts out selected.
    pub fn new(classes: ClassTable, autosave: bool) -> Self {
        let selected_class = classes.iter().next().map(|c| c.id);
        Self {
            classes,
            store: AnnotationStore::new(),
            images: Vec::new(),
            active: None,
            selected_class,
            selected_box: None,
            state: DrawState::Idle,
            mode: EditMode::Draw,
            history: Vec::new(),
            progress: ProgressLog::default(),
            image_dir: None,
            autosave,
        }
    }

    /// Scans `folder` and opens its first image. An empty folder is not an error;
    /// the session simply has nothing open.
    pub fn open_folder(&mut self, folder: &Path) -> Result<usize> {
        let images = dataset::scan_images(folder)?;
        self.progress = ProgressLog::load(folder)?;
        self.image_dir = Some(folder.to_path_buf());
        self.set_images(images);
        if !self.images.is_empty() {
            self.open_image(0)?;
        }
        info!("Opened {} with {} images", folder.display(), self.images.len());
        Ok(self.images.len())
    }

    /// Replaces the image list. Any open image is closed and its draft discarded.
    pub fn set_images(&mut self, images: Vec<PathBuf>) {
        self.cancel_box();
        self.active = None;
        self.selected_box = None;
        self.history.clear();
        self.images = images;
    }

    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// A selected class that gets removed here reads as no selection.
    pub fn classes_mut(&mut self) -> &mut ClassTable {
        &mut self.classes
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn state(&self) -> &DrawState {
        &self.state
    }

    pub fn mode(&self) -> EditMode {
        self.mode
    }

    pub fn progress(&self) -> &ProgressLog {
        &self.progress
    }

    pub fn current_index(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.index)
    }

    pub fn current_image(&self) -> Option<&Path> {
        self.active
            .as_ref()
            .map(|a| self.images[a.index].as_path())
    }

    pub fn current_size(&self) -> Option<ImageSize> {
        self.active.as_ref().map(|a| a.size)
    }

    pub fn current_boxes(&self) -> &[BoundingBox] {
        match self.current_image() {
            Some(img) => self.store.boxes(img),
            None => &[],
        }
    }

    pub fn selected_box(&self) -> Option<&BoundingBox> {
        self.selected_box.as_ref()
    }

    pub fn selected_class(&self) -> Option<ClassId> {
        self.selected_class
            .filter(|id| self.classes.get(*id).is_some())
    }

    pub fn select_class(&mut self, name: &str) -> Result<ClassId> {
        let id = self
            .classes
            .by_name(name)
            .map(|c| c.id)
            .ok_or_else(|| Error::validation(format!("no class named `{name}`")))?;
        self.selected_class = Some(id);
        Ok(id)
    }

    pub fn clear_class(&mut self) {
        self.selected_class = None;
    }

    pub fn set_mode(&mut self, mode: EditMode) {
        if mode != self.mode {
            self.cancel_box();
            self.selected_box = None;
            self.mode = mode;
        }
    }

    pub fn toggle_mode(&mut self) -> EditMode {
        let next = match self.mode {
            EditMode::Draw => EditMode::Select,
            EditMode::Select => EditMode::Draw,
        };
        self.set_mode(next);
        next
    }

    // ---- drawing ----

    /// `Idle -> Drawing`. Requires an open image and a selected class.
    pub fn begin_box(&mut self, start: Point) -> Result<Draft> {
        if self.active.is_none() {
            return Err(Error::NoActiveImage);
        }
        if matches!(self.state, DrawState::Drawing(_)) {
            return Err(Error::AlreadyDrawing);
        }
        let class = self.selected_class().ok_or(Error::NoClassSelected)?;
        let draft = Draft {
            start,
            current: start,
            class,
        };
        self.state = DrawState::Drawing(draft.clone());
        Ok(draft)
    }

    /// Moves the free corner of the draft. Ignored while idle.
    pub fn update_box(&mut self, current: Point) -> Option<BoundingBox> {
        match &mut self.state {
            DrawState::Drawing(d) => {
                d.current = current;
                Some(d.rect())
            }
            DrawState::Idle => None,
        }
    }

    /// `Drawing -> Idle`. Returns the stored box, or `None` if it was too small
    /// or nothing was being drawn.
    pub fn commit_box(&mut self, end: Point) -> Option<BoundingBox> {
        let DrawState::Drawing(mut draft) = std::mem::take(&mut self.state) else {
            return None;
        };
        draft.current = end;
        let rect = draft.rect();
        if rect.is_too_small() {
            debug!("Discarded {:.1}x{:.1} box", rect.width(), rect.height());
            return None;
        }
        let image = self.current_image()?.to_path_buf();
        self.store.add(&image, rect.clone());
        Some(rect)
    }

    /// `Drawing -> Idle` without keeping the draft.
    pub fn cancel_box(&mut self) {
        self.state = DrawState::Idle;
    }

    // ---- selection ----

    pub fn select_box(&mut self, point: Point) -> Option<&BoundingBox> {
        let image = self.current_image()?.to_path_buf();
        self.selected_box = self.store.select_box(&image, point).cloned();
        self.selected_box.as_ref()
    }

    pub fn delete_box(&mut self, bbox: &BoundingBox) -> bool {
        let Some(image) = self.current_image().map(Path::to_path_buf) else {
            return false;
        };
        let removed = self.store.delete_box(&image, bbox);
        if removed && self.selected_box.as_ref() == Some(bbox) {
            self.selected_box = None;
        }
        removed
    }

    pub fn delete_selected(&mut self) -> bool {
        match self.selected_box.take() {
            Some(b) => self.delete_box(&b),
            None => false,
        }
    }

    // ---- pointer events ----

    pub fn press(&mut self, point: Point) -> Result<()> {
        match self.mode {
            EditMode::Draw => self.begin_box(point).map(|_| ()),
            EditMode::Select => {
                self.select_box(point);
                Ok(())
            }
        }
    }

    pub fn drag(&mut self, point: Point) {
        if self.mode == EditMode::Draw {
            self.update_box(point);
        }
    }

    pub fn release(&mut self, point: Point) -> Option<BoundingBox> {
        match self.mode {
            EditMode::Draw => self.commit_box(point),
            EditMode::Select => None,
        }
    }

    // ---- navigation ----

    /// Opens image `index`, reading its size from the file header.
    pub fn open_image(&mut self, index: usize) -> Result<()> {
        let path = self
            .images
            .get(index)
            .ok_or_else(|| Error::validation(format!("image index {index} out of range")))?;
        let size = dataset::probe_size(path)?;
        self.open_image_with_size(index, size)
    }

    /// Switching images ends any draft on the previous image without keeping it.
    /// On failure the previous image stays open; if the autosave of the
    /// previous image fails, its draft and selection are kept too.
    pub fn open_image_with_size(&mut self, index: usize, size: ImageSize) -> Result<()> {
        let path = self
            .images
            .get(index)
            .cloned()
            .ok_or_else(|| Error::validation(format!("image index {index} out of range")))?;
        if size.width == 0 || size.height == 0 {
            return Err(Error::validation(format!("{} has zero size", path.display())));
        }

        let previous = self.active.as_ref().map(|a| (a.index, a.size));
        if let Some((prev_index, prev_size)) = previous {
            let prev_path = self.images[prev_index].clone();
            if self.store.is_dirty(&prev_path) {
                if self.autosave {
                    self.write_labels(&prev_path, prev_size)?;
                } else {
                    warn!("Unsaved edits kept in memory for {}", prev_path.display());
                }
            }
        }

        self.cancel_box();
        self.selected_box = None;

        // Unsaved edits win over the file on disk.
        if !self.store.is_dirty(&path) {
            self.store.load_for_image(&path, &self.classes, size)?;
        }

        if let Some((prev_index, _)) = previous {
            if prev_index != index {
                self.history.push(prev_index);
            }
        }
        self.active = Some(ActiveImage { index, size });
        debug!("Opened image {} ({}/{})", path.display(), index + 1, self.images.len());
        Ok(())
    }

    /// Stays on the last image at the end of the list.
    pub fn next_image(&mut self) -> Result<bool> {
        match self.current_index() {
            Some(i) if i + 1 < self.images.len() => self.open_image(i + 1).map(|_| true),
            Some(_) => Ok(false),
            None if !self.images.is_empty() => self.open_image(0).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn prev_image(&mut self) -> Result<bool> {
        match self.current_index() {
            Some(i) if i > 0 => self.open_image(i - 1).map(|_| true),
            _ => Ok(false),
        }
    }

    /// Returns to the previously viewed image.
    pub fn go_back(&mut self) -> Result<bool> {
        let Some(index) = self.history.pop() else {
            return Ok(false);
        };
        self.open_image(index)?;
        // Opening pushed the image we just left; going back should not.
        self.history.pop();
        Ok(true)
    }

    /// Next image after the current one that has no saved labels yet, wrapping once.
    pub fn next_unmodified(&mut self) -> Result<bool> {
        let n = self.images.len();
        let start = self.current_index().map(|i| i + 1).unwrap_or(0);
        let found = (0..n)
            .map(|k| (start + k) % n)
            .find(|&i| Some(i) != self.current_index() && !self.progress.contains(&self.images[i]));
        match found {
            Some(i) => self.open_image(i).map(|_| true),
            None => {
                info!("Every image already has saved labels");
                Ok(false)
            }
        }
    }

    pub fn random_unmodified<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool> {
        let candidates: Vec<usize> = (0..self.images.len())
            .filter(|&i| !self.progress.contains(&self.images[i]))
            .collect();
        match candidates.choose(rng) {
            Some(&i) => self.open_image(i).map(|_| true),
            None => Ok(false),
        }
    }

    // ---- persistence ----

    fn write_labels(&mut self, image: &Path, size: ImageSize) -> Result<()> {
        self.store.write_for_image(image, &self.classes, size)?;
        self.progress.mark(image);
        if let Some(dir) = &self.image_dir {
            self.progress.save(dir)?;
        }
        Ok(())
    }

    pub fn save_current(&mut self) -> Result<PathBuf> {
        let active = self.active.as_ref().ok_or(Error::NoActiveImage)?;
        let (index, size) = (active.index, active.size);
        let image = self.images[index].clone();
        self.write_labels(&image, size)?;
        Ok(crate::labels::label_path_for(&image))
    }

    /// Writes every image edited in memory. Stops at the first failure.
    pub fn save_all(&mut self) -> Result<usize> {
        let current = self.current_image().map(Path::to_path_buf);
        let dirty: Vec<PathBuf> = self.store.dirty_images().map(Path::to_path_buf).collect();
        let mut saved = 0;
        for image in dirty {
            let size = match (&current, &self.active) {
                (Some(c), Some(a)) if *c == image => a.size,
                _ => dataset::probe_size(&image)?,
            };
            self.write_labels(&image, size)?;
            saved += 1;
        }
        Ok(saved)
    }

    /// Reads the label file of every image without unsaved edits. Failures are
    /// returned per image; those images keep whatever was in memory.
    pub fn load_all(&mut self) -> Vec<(PathBuf, Error)> {
        let mut failures = Vec::new();
        for image in &self.images {
            if self.store.is_dirty(image) {
                continue;
            }
            let loaded = dataset::probe_size(image)
                .and_then(|size| self.store.load_for_image(image, &self.classes, size).map(|_| ()));
            if let Err(e) = loaded {
                failures.push((image.clone(), e));
            }
        }
        failures
    }

    pub fn statistics(&self) -> Statistics {
        self.store.statistics(&self.images, self.current_image())
    }

    /// Exports every image in the session; unsaved edits are included.
    pub fn export<R: Rng + ?Sized>(
        &self,
        request: &ExportRequest,
        rng: &mut R,
    ) -> Result<ExportSummary> {
        export::export_dataset(&self.images, &self.store, &self.classes, request, rng)
    }
}
