//! Bounding-box annotation for object-detection datasets: a toolkit-neutral
//! editing model, normalized label files, dataset export and an external
//! trainer launcher.

pub mod classes;
pub mod dataset;
pub mod error;
pub mod export;
pub mod labels;
pub mod logging;
pub mod models;
pub mod session;
pub mod settings;
pub mod store;
pub mod training;

pub use error::{Error, ErrorKind, Result};
