use std::collections::BTreeMap;

/// Stable class identifier. Assigned once when a class is created.
pub type ClassId = u32;

pub type Color = [u8; 3];

/// Drags smaller than this many pixels on either axis are treated as stray clicks.
pub const MIN_BOX_SIZE: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned box in original image pixels. Always `x1 <= x2` and `y1 <= y2`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub class: ClassId,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    /// Builds the box spanned by two drag endpoints, in either direction.
    pub fn from_corners(a: Point, b: Point, class: ClassId) -> Self {
        Self {
            class,
            x1: a.x.min(b.x),
            y1: a.y.min(b.y),
            x2: a.x.max(b.x),
            y2: a.y.max(b.y),
        }
    }

    /// Top-left corner plus size, as stored in label files after denormalizing.
    pub fn from_origin_size(x: f64, y: f64, width: f64, height: f64, class: ClassId) -> Self {
        Self::from_corners(Point::new(x, y), Point::new(x + width, y + height), class)
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x1 && p.x <= self.x2 && p.y >= self.y1 && p.y <= self.y2
    }

    pub fn is_too_small(&self) -> bool {
        self.width() < MIN_BOX_SIZE || self.height() < MIN_BOX_SIZE
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub total_images: usize,
    pub annotated_images: usize,
    pub total_class_counts: BTreeMap<ClassId, usize>, // all images
    pub current_class_counts: BTreeMap<ClassId, usize>, // the image passed as `current`
}

impl Statistics {
    pub fn progress_percent(&self) -> f64 {
        if self.total_images == 0 {
            return 0.0;
        }
        self.annotated_images as f64 / self.total_images as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_are_normalized_regardless_of_drag_direction() {
        let b = BoundingBox::from_corners(Point::new(300.0, 200.0), Point::new(100.0, 100.0), 0);
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (100.0, 100.0, 300.0, 200.0));
        assert_eq!(b.width(), 200.0);
        assert_eq!(b.height(), 100.0);
    }

    #[test]
    fn small_boxes_are_flagged() {
        let thin = BoundingBox::from_corners(Point::new(0.0, 0.0), Point::new(4.9, 50.0), 0);
        let ok = BoundingBox::from_corners(Point::new(0.0, 0.0), Point::new(5.0, 5.0), 0);
        assert!(thin.is_too_small());
        assert!(!ok.is_too_small());
    }

    #[test]
    fn contains_includes_edges() {
        let b = BoundingBox::from_corners(Point::new(10.0, 10.0), Point::new(20.0, 20.0), 0);
        assert!(b.contains(Point::new(10.0, 20.0)));
        assert!(!b.contains(Point::new(20.1, 15.0)));
    }

    #[test]
    fn progress_handles_empty_folder() {
        assert_eq!(Statistics::default().progress_percent(), 0.0);
    }
}
