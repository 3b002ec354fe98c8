//! Normalized label records: `class_id x_center y_center width height`, one
//! line per box, fractions of the image size with 6 decimals.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::{BoundingBox, ClassId, ImageSize};

pub const LABELS_DIR: &str = "labels";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelRecord {
    pub class_id: ClassId,
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

impl LabelRecord {
    /// `class_id` is whatever id the target file uses; the box's own class is not consulted.
    pub fn from_box(bbox: &BoundingBox, class_id: ClassId, size: ImageSize) -> Self {
        let w = size.width as f64;
        let h = size.height as f64;
        let center = bbox.center();
        Self {
            class_id,
            x_center: center.x / w,
            y_center: center.y / h,
            width: bbox.width() / w,
            height: bbox.height() / h,
        }
    }

    pub fn to_box(&self, class: ClassId, size: ImageSize) -> BoundingBox {
        let w = size.width as f64;
        let h = size.height as f64;
        BoundingBox::from_origin_size(
            (self.x_center - self.width / 2.0) * w,
            (self.y_center - self.height / 2.0) * h,
            self.width * w,
            self.height * h,
            class,
        )
    }

    /// Parses one non-empty line. `line` is 1-based and only used for error messages.
    pub fn parse(text: &str, path: &Path, line: usize) -> Result<Self> {
        let err = |message: String| Error::LabelParse {
            path: path.to_path_buf(),
            line,
            message,
        };

        let tokens: Vec<&str> = text.split_whitespace().take(6).collect();
        if tokens.len() != 5 {
            return Err(err(format!("expected 5 fields, found {}", tokens.len())));
        }

        let class_id = tokens[0]
            .parse::<ClassId>()
            .or_else(|_| integral_float(tokens[0]))
            .map_err(|_| err(format!("invalid class id `{}`", tokens[0])))?;

        let mut values = [0.0f64; 4];
        for (slot, (token, field)) in values
            .iter_mut()
            .zip(tokens[1..].iter().zip(["x_center", "y_center", "width", "height"]))
        {
            let v = token
                .parse::<f64>()
                .map_err(|_| err(format!("invalid {field} `{token}`")))?;
            if !v.is_finite() {
                return Err(err(format!("{field} is not finite")));
            }
            *slot = v;
        }

        Ok(Self {
            class_id,
            x_center: values[0],
            y_center: values[1],
            width: values[2],
            height: values[3],
        })
    }
}

// Some tools write class ids as `0.0`.
fn integral_float(token: &str) -> std::result::Result<ClassId, ()> {
    let v: f64 = token.parse().map_err(|_| ())?;
    if v >= 0.0 && v.fract() == 0.0 && v <= ClassId::MAX as f64 {
        Ok(v as ClassId)
    } else {
        Err(())
    }
}

impl fmt::Display for LabelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.6} {:.6} {:.6} {:.6}",
            self.class_id, self.x_center, self.y_center, self.width, self.height
        )
    }
}

/// Parses a whole label file, skipping blank lines.
pub fn parse_label_text(text: &str, path: &Path) -> Result<Vec<LabelRecord>> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(idx, l)| LabelRecord::parse(l, path, idx + 1))
        .collect()
}

pub fn format_label_text(records: &[LabelRecord]) -> String {
    let mut out = String::new();
    for r in records {
        out.push_str(&r.to_string());
        out.push('\n');
    }
    out
}

/// `<image_stem>.txt`
pub fn label_file_name(image_path: &Path) -> OsString {
    let mut name = image_path
        .file_stem()
        .unwrap_or(image_path.as_os_str())
        .to_os_string();
    name.push(".txt");
    name
}

/// `<image_dir>/labels/<image_stem>.txt`
pub fn label_path_for(image_path: &Path) -> PathBuf {
    let dir = image_path.parent().unwrap_or(Path::new("."));
    dir.join(LABELS_DIR).join(label_file_name(image_path))
}
