//! Deletion semantics: exactly the named entries disappear

use lfstool::ImageEngine;
use std::path::{Path, PathBuf};

const NAMES: [&str; 5] = ["t1.bin", "t2.bin", "t3.bin", "t4.bin", "t5.bin"];

fn seed_image(tmp: &Path, image: &Path) -> Vec<(PathBuf, String)> {
    let sources: Vec<(PathBuf, String)> = NAMES
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let path = tmp.join(n);
            std::fs::write(&path, vec![i as u8; 2000]).unwrap();
            (path, n.to_string())
        })
        .collect();
    let mut engine = ImageEngine::create(image, 1024 * 1024, 512, 0).unwrap();
    engine.insert(&sources, false).unwrap();
    sources
}

#[test]
fn test_delete_shows_exactly_the_survivors() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("lfs.img");
    seed_image(tmp.path(), &image);

    let mut engine = ImageEngine::open(&image, None, None).unwrap();
    let report = engine
        .delete(&["t1.bin".to_string(), "t2.bin".to_string()])
        .unwrap();
    assert!(report.ok());
    assert_eq!(report.affected, vec!["t1.bin", "t2.bin"]);
    drop(engine);

    let mut engine = ImageEngine::open(&image, None, None).unwrap();
    let paths: Vec<String> = engine.list().unwrap().into_iter().map(|e| e.path).collect();
    assert_eq!(paths, vec!["t3.bin", "t4.bin", "t5.bin"]);
}

#[test]
fn test_delete_missing_name_reported_others_proceed() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("lfs.img");
    seed_image(tmp.path(), &image);

    let mut engine = ImageEngine::open(&image, None, None).unwrap();
    let report = engine
        .delete(&["ghost.bin".to_string(), "t3.bin".to_string()])
        .unwrap();
    assert_eq!(report.affected, vec!["t3.bin"]);
    assert_eq!(report.missing, vec!["ghost.bin"]);
    assert!(!report.ok());

    let paths: Vec<String> = engine.list().unwrap().into_iter().map(|e| e.path).collect();
    assert_eq!(paths, vec!["t1.bin", "t2.bin", "t4.bin", "t5.bin"]);
}

#[test]
fn test_delete_directory_drops_subtree() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("lfs.img");

    std::fs::create_dir_all(tmp.path().join("keep")).unwrap();
    std::fs::create_dir_all(tmp.path().join("gone/nested")).unwrap();
    for rel in ["keep/a.bin", "gone/b.bin", "gone/nested/c.bin"] {
        std::fs::write(tmp.path().join(rel), vec![7u8; 1500]).unwrap();
    }
    let sources: Vec<(PathBuf, String)> = ["keep/a.bin", "gone/b.bin", "gone/nested/c.bin"]
        .iter()
        .map(|n| (tmp.path().join(n), n.to_string()))
        .collect();

    let mut engine = ImageEngine::create(&image, 1024 * 1024, 512, 0).unwrap();
    engine.insert(&sources, false).unwrap();
    engine.delete(&["gone".to_string()]).unwrap();

    let paths: Vec<String> = engine.list().unwrap().into_iter().map(|e| e.path).collect();
    assert_eq!(paths, vec!["keep", "keep/a.bin"]);
}

#[test]
fn test_deleted_blocks_are_reused_by_later_inserts() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("lfs.img");

    // Image with room for roughly one large file's chain at a time.
    let big = tmp.path().join("big.bin");
    std::fs::write(&big, vec![0xABu8; 180 * 1024]).unwrap();

    let mut engine = ImageEngine::create(&image, 256 * 1024, 512, 0).unwrap();
    engine
        .insert(&[(big.clone(), "big1.bin".to_string())], false)
        .unwrap();
    drop(engine);

    // A second copy cannot fit alongside the first, but fits once the
    // first is deleted and its blocks fall out of the in-use set.
    let mut engine = ImageEngine::open(&image, None, None).unwrap();
    assert!(engine
        .insert(&[(big.clone(), "big2.bin".to_string())], false)
        .is_err());
    engine.delete(&["big1.bin".to_string()]).unwrap();
    drop(engine);

    let mut engine = ImageEngine::open(&image, None, None).unwrap();
    engine
        .insert(&[(big.clone(), "big2.bin".to_string())], false)
        .unwrap();

    let out = tmp.path().join("out");
    engine.extract(&[], &out, false).unwrap();
    assert_eq!(
        std::fs::read(out.join("big2.bin")).unwrap(),
        std::fs::read(&big).unwrap()
    );
}
