//! Training configuration and the external trainer process.
//!
//! The trainer is any program that accepts `--config <train_config.yaml>`.
//! It runs with the export directory as its working directory and writes its
//! runs under `runs/detect/<run_name>`.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::export::TRAIN_CONFIG_YAML;

pub const KNOWN_MODELS: [&str; 5] = [
    "yolov8n.pt",
    "yolov8s.pt",
    "yolov8m.pt",
    "yolov8l.pt",
    "yolov8x.pt",
];

pub const BEST_WEIGHTS: &str = "best.pt";

/// `train_config.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub model_weights: String,
    pub data_yaml: String,
    pub epochs: u32,
    pub imgsz: u32,
    pub batch_size: u32,
    pub lr0: f64,
    pub run_name: String,
    pub save_best: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_weights: KNOWN_MODELS[0].to_string(),
            data_yaml: "./data.yaml".to_string(),
            epochs: 150,
            imgsz: 640,
            batch_size: 16,
            lr0: 0.01,
            run_name: "train_run1".to_string(),
            save_best: true,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        fn in_range<T: PartialOrd + fmt::Display>(name: &str, v: T, lo: T, hi: T) -> Result<()> {
            if v < lo || v > hi {
                return Err(Error::validation(format!(
                    "{name} must be between {lo} and {hi}, got {v}"
                )));
            }
            Ok(())
        }

        if self.model_weights.trim().is_empty() {
            return Err(Error::validation("model weights are not set"));
        }
        if self.run_name.trim().is_empty() {
            return Err(Error::validation("run name is empty"));
        }
        if self.run_name.contains(['/', '\\']) {
            return Err(Error::validation(format!(
                "run name `{}` must not contain path separators",
                self.run_name
            )));
        }
        in_range("epochs", self.epochs, 1, 1000)?;
        in_range("imgsz", self.imgsz, 256, 2048)?;
        in_range("batch_size", self.batch_size, 1, 128)?;
        if !self.lr0.is_finite() {
            return Err(Error::validation("lr0 is not a number"));
        }
        in_range("lr0", self.lr0, 0.00001, 0.1)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_yaml::from_str(&text).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(|e| Error::io(path, e))
    }
}

pub fn runs_dir(export_dir: &Path) -> PathBuf {
    export_dir.join("runs").join("detect")
}

/// `base`, then `base1`, `base2`, ... until one does not exist under `runs_dir`.
pub fn next_free_run_name(runs_dir: &Path, base: &str) -> String {
    if !runs_dir.join(base).exists() {
        return base.to_string();
    }
    (1u32..)
        .map(|n| format!("{base}{n}"))
        .find(|name| !runs_dir.join(name).exists())
        .unwrap_or_else(|| base.to_string())
}

/// Loads the exported config, moves its run name to the first free one and
/// writes it back.
pub fn prepare_run(export_dir: &Path) -> Result<TrainingConfig> {
    let config_path = export_dir.join(TRAIN_CONFIG_YAML);
    let mut config = TrainingConfig::load(&config_path)?;
    config.validate()?;

    let free = next_free_run_name(&runs_dir(export_dir), &config.run_name);
    if free != config.run_name {
        info!("Run {} exists, using {}", config.run_name, free);
        config.run_name = free;
    }
    config.save(&config_path)?;
    Ok(config)
}

/// Program and leading arguments; `--config <path>` is appended at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TrainerCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-u".to_string(), "train_script.py".to_string()],
        }
    }
}

impl FromStr for TrainerCommand {
    type Err = Error;

    /// Whitespace separated; no quoting.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::validation("trainer command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for TrainerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerEvent {
    Output { stream: OutputStream, line: String },
    /// Always the last event. `exit_code` is `None` when the process was
    /// killed by a signal or could not be waited on.
    Finished { exit_code: Option<i32>, success: bool },
}

/// A launched trainer. Output arrives in order per stream; `Finished` comes
/// after both streams are drained.
#[derive(Debug)]
pub struct TrainingRun {
    pub config: TrainingConfig,
    pub export_dir: PathBuf,
    events: mpsc::UnboundedReceiver<TrainerEvent>,
}

impl TrainingRun {
    /// `None` once `Finished` has been delivered.
    pub async fn next_event(&mut self) -> Option<TrainerEvent> {
        self.events.recv().await
    }
}

/// Prepares the run and starts the trainer. Must be called inside a Tokio
/// runtime; the reader and waiter tasks are spawned onto it.
pub async fn launch(command: &TrainerCommand, export_dir: &Path) -> Result<TrainingRun> {
    // The child runs inside export_dir, so the config path must not be relative to ours.
    let export_dir = fs::canonicalize(export_dir).map_err(|e| Error::io(export_dir, e))?;
    let export_dir = export_dir.as_path();
    let config = prepare_run(export_dir)?;
    let config_path = export_dir.join(TRAIN_CONFIG_YAML);

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .arg("--config")
        .arg(&config_path)
        .current_dir(export_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| Error::TrainerLaunch {
        program: command.program.clone(),
        source,
    })?;
    info!(
        "Started `{command}` for run {} in {}",
        config.run_name,
        export_dir.display()
    );

    let (tx, rx) = mpsc::unbounded_channel();

    let stdout_task = tokio::spawn(forward_lines(
        child.stdout.take(),
        OutputStream::Stdout,
        tx.clone(),
    ));
    let stderr_task = tokio::spawn(forward_lines(
        child.stderr.take(),
        OutputStream::Stderr,
        tx.clone(),
    ));

    tokio::spawn(async move {
        let event = match child.wait().await {
            Ok(status) => TrainerEvent::Finished {
                exit_code: status.code(),
                success: status.success(),
            },
            Err(e) => {
                error!("Waiting for trainer failed: {e}");
                TrainerEvent::Finished {
                    exit_code: None,
                    success: false,
                }
            }
        };
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        debug!("Trainer finished: {event:?}");
        let _ = tx.send(event);
    });

    Ok(TrainingRun {
        config,
        export_dir: export_dir.to_path_buf(),
        events: rx,
    })
}

async fn forward_lines<R: AsyncRead + Unpin>(
    handle: Option<R>,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<TrainerEvent>,
) {
    let Some(handle) = handle else {
        return;
    };
    let mut reader = BufReader::new(handle);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            // Keep draining after the receiver is gone so the child never blocks on a full pipe.
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                let _ = tx.send(TrainerEvent::Output { stream, line });
            }
            Err(e) => {
                warn!("Reading trainer {stream:?} failed: {e}");
                break;
            }
        }
    }
}

pub const MAX_LOG_LINES: usize = 1000;

/// Last `capacity` lines of trainer output, oldest first.
#[derive(Debug, Clone)]
pub struct TrainingLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for TrainingLog {
    fn default() -> Self {
        Self::with_capacity(MAX_LOG_LINES)
    }
}

impl TrainingLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn push_event(&mut self, event: &TrainerEvent) {
        match event {
            TrainerEvent::Output { line, .. } => self.push_line(line.clone()),
            TrainerEvent::Finished {
                exit_code: Some(code),
                ..
            } => self.push_line(format!("Training process finished with exit code {code}")),
            TrainerEvent::Finished { exit_code: None, .. } => {
                self.push_line("Training process terminated without an exit code")
            }
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Copies `runs/detect/<run>/weights/best.pt` to `<export_dir>/best.pt`.
/// A missing artifact is logged and returns `Ok(None)`.
pub fn collect_best_weights(export_dir: &Path, run_name: &str) -> Result<Option<PathBuf>> {
    let src = runs_dir(export_dir)
        .join(run_name)
        .join("weights")
        .join(BEST_WEIGHTS);
    if !src.is_file() {
        warn!("{} not found, training may not have completed", src.display());
        return Ok(None);
    }
    let dest = export_dir.join(BEST_WEIGHTS);
    fs::copy(&src, &dest).map_err(|e| Error::io(&src, e))?;
    info!("Copied {} to {}", src.display(), dest.display());
    Ok(Some(dest))
}
