use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use annotrain::classes::{self, ClassTable};
use annotrain::dataset::{self, ProgressLog};
use annotrain::export::{ExportRequest, SplitRatio};
use annotrain::logging;
use annotrain::session::AnnotationSession;
use annotrain::settings::{self, Settings};
use annotrain::training::{self, TrainerEvent, TrainingConfig, TrainingLog};

#[derive(Debug, Parser)]
#[command(name = "annotrain", version, about = "Box annotations, dataset export and training launcher")]
struct Cli {
    /// Settings file
    #[arg(long, default_value = settings::SETTINGS_FILE)]
    settings: PathBuf,

    /// Class file; overrides `classes_file` from the settings
    #[arg(long)]
    classes: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the class table
    #[command(subcommand)]
    Classes(ClassCommands),
    /// Annotation progress and per-class box counts for an image folder
    Stats { folder: PathBuf },
    /// Parse every label file in an image folder and report problems
    Check { folder: PathBuf },
    /// Split an annotated folder into train/valid/test
    Export(ExportArgs),
    /// Run the trainer on an exported dataset
    Train { dir: PathBuf },
    /// Show or change settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Debug, Subcommand)]
enum ClassCommands {
    List,
    Add {
        name: String,
        /// r,g,b
        #[arg(long, value_parser = parse_color)]
        color: Option<[u8; 3]>,
    },
    Rename { old: String, new: String },
    Recolor {
        name: String,
        #[arg(value_parser = parse_color)]
        color: [u8; 3],
    },
    Remove { name: String },
}

#[derive(Debug, Subcommand)]
enum SettingsCommands {
    Show,
    Set { key: String, value: String },
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Folder with the images and their `labels/`
    folder: PathBuf,
    /// Destination; defaults to `default_save_dir`
    #[arg(long, short)]
    out: Option<PathBuf>,
    /// Train/valid/test percentages
    #[arg(long, default_value = "70/20/10")]
    split: SplitRatio,
    #[arg(long, default_value = training::KNOWN_MODELS[0])]
    model: String,
    #[arg(long, default_value_t = 150)]
    epochs: u32,
    #[arg(long, default_value_t = 640)]
    imgsz: u32,
    #[arg(long, default_value_t = 16)]
    batch_size: u32,
    #[arg(long, default_value_t = 0.01)]
    lr0: f64,
    #[arg(long, default_value = "train_run1")]
    run_name: String,
    /// Do not copy best.pt next to the config after training
    #[arg(long)]
    no_save_best: bool,
    /// Seed for a reproducible split
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_color(s: &str) -> Result<[u8; 3], String> {
    classes::parse_color(s).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    logging::setup_logger();
    let cli = Cli::parse();
    let mut settings = Settings::load_or_default(&cli.settings);
    let classes_path = cli.classes.clone().unwrap_or_else(|| settings.classes_file.clone());

    match cli.command {
        Commands::Classes(cmd) => run_classes(cmd, &classes_path),
        Commands::Stats { folder } => run_stats(&folder, &classes_path),
        Commands::Check { folder } => run_check(&folder, &classes_path),
        Commands::Export(args) => run_export(args, &classes_path, &settings),
        Commands::Train { dir } => run_train(&dir, &settings),
        Commands::Settings(SettingsCommands::Show) => {
            for key in settings::KEYS {
                println!("{key}={}", settings.get(key).unwrap_or_default());
            }
            Ok(())
        }
        Commands::Settings(SettingsCommands::Set { key, value }) => {
            settings.set(&key, &value)?;
            settings.save(&cli.settings)?;
            info!("Set {key} in {}", cli.settings.display());
            Ok(())
        }
    }
}

fn run_classes(cmd: ClassCommands, path: &Path) -> anyhow::Result<()> {
    let mut table = ClassTable::load_or_default(path)
        .with_context(|| format!("loading classes from {}", path.display()))?;

    match cmd {
        ClassCommands::List => {
            for (pos, c) in table.iter().enumerate() {
                let [r, g, b] = c.color;
                println!("{pos}\t{}\tid={}\trgb({r},{g},{b})", c.name, c.id);
            }
            return Ok(());
        }
        ClassCommands::Add { name, color } => {
            let id = table.add(&name, color.unwrap_or(classes::DEFAULT_COLOR))?;
            info!("Added class {name} with id {id}");
        }
        ClassCommands::Rename { old, new } => table.rename(&old, &new)?,
        ClassCommands::Recolor { name, color } => table.set_color(&name, color)?,
        ClassCommands::Remove { name } => {
            let removed = table.remove(&name)?;
            warn!(
                "Removed class {}; boxes with id {} will fail to load until the labels are fixed",
                removed.name, removed.id
            );
        }
    }
    table.save(path)?;
    Ok(())
}

/// Session over every image in `folder` with all label files read.
fn load_folder(
    folder: &Path,
    classes_path: &Path,
) -> anyhow::Result<(AnnotationSession, Vec<(PathBuf, annotrain::Error)>)> {
    let table = ClassTable::load_or_default(classes_path)
        .with_context(|| format!("loading classes from {}", classes_path.display()))?;
    let images = dataset::scan_images(folder)?;
    let mut session = AnnotationSession::new(table, false);
    session.set_images(images);
    let failures = session.load_all();
    Ok((session, failures))
}

fn run_stats(folder: &Path, classes_path: &Path) -> anyhow::Result<()> {
    let (session, failures) = load_folder(folder, classes_path)?;
    for (image, e) in &failures {
        warn!("Skipping {}: {e}", image.display());
    }
    let stats = session.statistics();
    let progress = ProgressLog::load(folder)?;

    println!("Images:     {}", stats.total_images);
    println!(
        "Annotated:  {} ({:.1}%)",
        stats.annotated_images,
        stats.progress_percent()
    );
    println!("Saved:      {}", progress.len());
    for c in session.classes().iter() {
        let n = stats.total_class_counts.get(&c.id).copied().unwrap_or(0);
        println!("  {:<20} {n}", c.name);
    }
    Ok(())
}

fn run_check(folder: &Path, classes_path: &Path) -> anyhow::Result<()> {
    let (session, failures) = load_folder(folder, classes_path)?;
    for (image, e) in &failures {
        error!("{}: {e}", image.display());
    }
    if !failures.is_empty() {
        bail!(
            "{} of {} images have unreadable labels",
            failures.len(),
            session.images().len()
        );
    }
    info!("All {} images have valid labels", session.images().len());
    Ok(())
}

fn run_export(args: ExportArgs, classes_path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let destination = args
        .out
        .or_else(|| settings.default_save_dir.clone())
        .context("no destination: pass --out or set default_save_dir")?;

    let (session, failures) = load_folder(&args.folder, classes_path)?;
    if let Some((image, e)) = failures.into_iter().next() {
        return Err(e).with_context(|| format!("reading labels of {}", image.display()));
    }

    let request = ExportRequest {
        destination,
        split: args.split,
        training: TrainingConfig {
            model_weights: args.model,
            epochs: args.epochs,
            imgsz: args.imgsz,
            batch_size: args.batch_size,
            lr0: args.lr0,
            run_name: args.run_name,
            save_best: !args.no_save_best,
            ..TrainingConfig::default()
        },
    };

    let mut rng: Box<dyn RngCore> = match args.seed {
        Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
        None => Box::new(rand::rng()),
    };
    let summary = session.export(&request, rng.as_mut())?;
    println!(
        "Exported {} images (train {}, valid {}, test {}), {} label files",
        summary.train + summary.valid + summary.test,
        summary.train,
        summary.valid,
        summary.test,
        summary.labels_written
    );
    println!("{}", summary.data_yaml.display());
    println!("{}", summary.train_config.display());
    Ok(())
}

/// The first interrupt is left to the trainer; the second one ends annotrain.
fn should_exit_on_interrupt(count: &AtomicUsize) -> bool {
    count.fetch_add(1, Ordering::SeqCst) >= 1
}

fn run_train(dir: &Path, settings: &Settings) -> anyhow::Result<()> {
    let interrupts = Arc::new(AtomicUsize::new(0));
    let handler_interrupts = Arc::clone(&interrupts);
    ctrlc::set_handler(move || {
        if should_exit_on_interrupt(&handler_interrupts) {
            error!("Interrupted twice, exiting without waiting for the trainer");
            std::process::exit(130);
        }
        warn!("Interrupted; the trainer received the same signal. Press Ctrl-C again to exit");
    })
    .context("setting Ctrl-C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    runtime.block_on(async {
        let mut run = training::launch(&settings.trainer, dir).await?;
        let mut log = TrainingLog::with_capacity(20);
        let mut success = false;

        while let Some(event) = run.next_event().await {
            log.push_event(&event);
            match event {
                TrainerEvent::Output { line, .. } => println!("{line}"),
                TrainerEvent::Finished { success: ok, .. } => success = ok,
            }
        }

        if !success {
            for line in log.lines() {
                eprintln!("{line}");
            }
            bail!("training run {} failed", run.config.run_name);
        }
        info!("Training run {} finished", run.config.run_name);

        if run.config.save_best {
            training::collect_best_weights(&run.export_dir, &run.config.run_name)?;
        }
        Ok::<_, anyhow::Error>(())
    })
}
