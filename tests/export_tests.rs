use std::fs;
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;

use annotrain::ErrorKind;
use annotrain::classes::ClassTable;
use annotrain::export::{
    DATA_YAML, DataDescriptor, ExportRequest, Partition, SplitRatio, TRAIN_CONFIG_YAML,
    export_dataset,
};
use annotrain::labels;
use annotrain::models::Point;
use annotrain::session::AnnotationSession;
use annotrain::store::AnnotationStore;
use annotrain::training::TrainingConfig;

fn write_pngs(dir: &Path, n: usize) {
    for i in 0..n {
        image::RgbImage::new(640, 480)
            .save(dir.join(format!("img{i:02}.png")))
            .unwrap();
    }
}

fn classes() -> ClassTable {
    let mut t = ClassTable::empty();
    t.add("cat", [255, 0, 0]).unwrap();
    t.add("dog", [0, 255, 0]).unwrap();
    t.add("bird", [0, 0, 255]).unwrap();
    t
}

fn request(dest: PathBuf, split: SplitRatio) -> ExportRequest {
    ExportRequest {
        destination: dest,
        split,
        training: TrainingConfig::default(),
    }
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn ten_images_split_seven_two_one() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_pngs(src.path(), 10);

    let mut session = AnnotationSession::new(classes(), true);
    session.open_folder(src.path()).unwrap();
    session.select_class("bird").unwrap();
    session.begin_box(Point::new(100.0, 100.0)).unwrap();
    session.commit_box(Point::new(300.0, 200.0)).unwrap();
    session.next_image().unwrap();
    session.select_class("cat").unwrap();
    session.begin_box(Point::new(10.0, 10.0)).unwrap();
    session.commit_box(Point::new(50.0, 50.0)).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let summary = session
        .export(&request(out.path().to_path_buf(), SplitRatio::default()), &mut rng)
        .unwrap();

    assert_eq!((summary.train, summary.valid, summary.test), (7, 2, 1));
    assert_eq!(summary.labels_written, 2);

    let mut images = 0;
    let mut label_lines = Vec::new();
    for p in Partition::ALL {
        images += count_files(&p.images_dir(out.path()));
        for entry in fs::read_dir(p.labels_dir(out.path())).unwrap() {
            let text = fs::read_to_string(entry.unwrap().path()).unwrap();
            label_lines.extend(text.lines().map(str::to_string));
        }
    }
    assert_eq!(images, 10);
    label_lines.sort();
    // dense positions: cat = 0, bird = 2
    assert_eq!(label_lines.len(), 2);
    assert!(label_lines[0].starts_with("0 "));
    assert_eq!(label_lines[1], "2 0.312500 0.312500 0.312500 0.208333");
}

#[test]
fn yaml_documents_parse_back() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_pngs(src.path(), 3);

    let mut session = AnnotationSession::new(classes(), true);
    session.open_folder(src.path()).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let summary = session
        .export(&request(out.path().to_path_buf(), SplitRatio::new(80, 10, 10)), &mut rng)
        .unwrap();

    let data: DataDescriptor =
        serde_yaml::from_str(&fs::read_to_string(out.path().join(DATA_YAML)).unwrap()).unwrap();
    assert_eq!(data.train, "train/images");
    assert_eq!(data.val, "valid/images");
    assert_eq!(data.test, "test/images");
    assert_eq!(data.nc, 3);
    assert_eq!(data.names, vec!["cat", "dog", "bird"]);

    let config = TrainingConfig::load(&out.path().join(TRAIN_CONFIG_YAML)).unwrap();
    assert_eq!(config, TrainingConfig::default());
    assert_eq!(summary.train_config, out.path().join(TRAIN_CONFIG_YAML));
}

#[test]
fn bad_split_leaves_no_trace() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_pngs(src.path(), 4);
    let dest = out.path().join("dataset");

    let mut session = AnnotationSession::new(classes(), true);
    session.open_folder(src.path()).unwrap();
    let err = session
        .export(&request(dest.clone(), SplitRatio::new(70, 20, 20)), &mut rand::rng())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!dest.exists());
}

#[test]
fn box_of_removed_class_blocks_export() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_pngs(src.path(), 2);

    let mut session = AnnotationSession::new(classes(), false);
    session.open_folder(src.path()).unwrap();
    session.select_class("dog").unwrap();
    session.begin_box(Point::new(0.0, 0.0)).unwrap();
    session.commit_box(Point::new(40.0, 40.0)).unwrap();
    session.classes_mut().remove("dog").unwrap();

    let dest = out.path().join("dataset");
    let err = session
        .export(&request(dest.clone(), SplitRatio::default()), &mut rand::rng())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataConsistency);
    assert!(!dest.exists());
}

#[test]
fn saved_labels_survive_a_new_session() {
    let src = tempfile::tempdir().unwrap();
    write_pngs(src.path(), 2);

    let mut first = AnnotationSession::new(classes(), true);
    first.open_folder(src.path()).unwrap();
    first.select_class("dog").unwrap();
    first.begin_box(Point::new(20.0, 30.0)).unwrap();
    first.commit_box(Point::new(220.0, 130.0)).unwrap();
    first.save_current().unwrap();

    let image = src.path().join("img00.png");
    assert!(labels::label_path_for(&image).is_file());

    let mut second = AnnotationSession::new(first.classes().clone(), true);
    second.open_folder(src.path()).unwrap();
    let boxes = second.current_boxes();
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].class, second.classes().by_name("dog").unwrap().id);
    assert!((boxes[0].x1 - 20.0).abs() < 1e-3);
    assert!(second.progress().contains(&image));

    assert!(second.next_unmodified().unwrap());
    assert_eq!(second.current_index(), Some(1));
}

#[test]
fn empty_destination_is_rejected() {
    let src = tempfile::tempdir().unwrap();
    write_pngs(src.path(), 2);

    let mut session = AnnotationSession::new(classes(), true);
    session.open_folder(src.path()).unwrap();
    let err = session
        .export(&request(PathBuf::new(), SplitRatio::default()), &mut rand::rng())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    for p in Partition::ALL {
        assert!(!Path::new(p.dir_name()).exists());
    }
}

#[test]
fn no_images_is_rejected() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("dataset");

    let mut session = AnnotationSession::new(classes(), true);
    assert_eq!(session.open_folder(src.path()).unwrap(), 0);
    let err = session
        .export(&request(dest.clone(), SplitRatio::default()), &mut rand::rng())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!dest.exists());
}

#[test]
fn images_sharing_a_file_name_are_rejected() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    for sub in ["a", "b"] {
        fs::create_dir(src.path().join(sub)).unwrap();
        write_pngs(&src.path().join(sub), 1);
    }
    let images = vec![
        src.path().join("a").join("img00.png"),
        src.path().join("b").join("img00.png"),
    ];
    let dest = out.path().join("dataset");

    let err = export_dataset(
        &images,
        &AnnotationStore::new(),
        &classes(),
        &request(dest.clone(), SplitRatio::default()),
        &mut StdRng::seed_from_u64(5),
    )
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!dest.exists());
}
