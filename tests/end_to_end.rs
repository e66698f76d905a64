//! End-to-end runs of every mode against in-memory registries.
//!
//! ```bash
//! cargo test --test end_to_end
//! ```

mod common;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hangar::{effective_jobs, Engine, ImageList, Mode};
use hangar_archive::parts::part_path;
use hangar_oci::{digest::sha256_digest, ImageRef, MemoryRegistry, Platform, PlatformFilter, Registry};

use common::*;

#[tokio::test]
async fn five_image_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = registry();
    let list = seed(&src, 5, 4096);

    let saved = save_config(tmp.path(), "bundle", "gzip", 5);
    let summary = Engine::new(saved.clone(), src.clone(), src.clone())
        .save(&list)
        .await
        .unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.succeeded, 5);
    assert_eq!(
        files_with_prefix(tmp.path(), "bundle"),
        vec![tmp.path().join("bundle.tar.gz")]
    );
    assert!(!saved.report_path.exists());

    let dest = registry();
    let load = load_config(tmp.path(), Mode::Load, &saved.archive);
    let summary = Engine::new(load.clone(), src.clone(), dest.clone())
        .load(None)
        .await
        .unwrap();
    assert!(summary.is_success(), "{:?}", summary);
    assert!(!load.report_path.exists());

    for n in 0..5 {
        let from = ImageRef::parse(&format!("{}/library/app{}:v1", SOURCE, n)).unwrap();
        let to = ImageRef::parse(&format!("{}/library/app{}:v1", DEST, n)).unwrap();
        assert_eq!(
            dest.pull_manifest(&to).await.unwrap().digest,
            src.pull_manifest(&from).await.unwrap().digest
        );
    }

    let check = load_config(tmp.path(), Mode::LoadValidate, &saved.archive);
    let run = Engine::new(check.clone(), src.clone(), dest.clone())
        .load_validate()
        .await
        .unwrap();
    assert_eq!(run.violations(), 0);
    assert_eq!(run.results.len(), 5);
    assert!(!check.report_path.exists());
}

#[tokio::test]
async fn segmented_stream_concatenates_to_the_unsegmented_one() {
    let tmp = tempfile::tempdir().unwrap();
    let src = registry();
    let list = seed(&src, 5, 64 * 1024);

    let whole = save_config(tmp.path(), "whole", "gzip", 1);
    Engine::new(whole.clone(), src.clone(), src.clone())
        .save(&list)
        .await
        .unwrap();

    let mut split = save_config(tmp.path(), "split", "gzip", 1);
    split.part_size = Some(100 * 1024);
    let summary = Engine::new(split.clone(), src.clone(), src.clone())
        .save(&list)
        .await
        .unwrap();
    assert!(summary.is_success());
    assert!(!split.archive.exists());

    let mut joined = Vec::new();
    let mut parts = 0;
    while part_path(&split.archive, parts).exists() {
        joined.extend(fs::read(part_path(&split.archive, parts)).unwrap());
        parts += 1;
    }
    assert!(parts >= 2, "expected several parts, got {}", parts);
    assert_eq!(joined, fs::read(&whole.archive).unwrap());

    let dest = registry();
    let load = load_config(tmp.path(), Mode::Load, &part_path(&split.archive, 0));
    let summary = Engine::new(load, src.clone(), dest.clone())
        .load(None)
        .await
        .unwrap();
    assert!(summary.is_success(), "{:?}", summary);
    assert_eq!(summary.succeeded, 5);
    for n in 0..5 {
        let to = ImageRef::parse(&format!("{}/library/app{}:v1", DEST, n)).unwrap();
        assert!(dest.manifest(&to).is_some());
    }
}

#[tokio::test]
async fn concurrency_does_not_change_what_is_written() {
    let tmp = tempfile::tempdir().unwrap();
    let src = registry();
    let list = seed(&src, 12, 2048);

    let mut digest_sets = Vec::new();
    for requested in [-3i64, 0, 1, 20, 100] {
        let config = save_config(
            tmp.path(),
            &format!("jobs{}", requested),
            "dir",
            effective_jobs(requested),
        );
        let summary = Engine::new(config.clone(), src.clone(), src.clone())
            .save(&list)
            .await
            .unwrap();
        assert!(summary.is_success(), "jobs={}: {:?}", requested, summary);
        assert_eq!(summary.succeeded, 12);
        digest_sets.push(directory_digests(&config.archive));
    }
    assert!(digest_sets.windows(2).all(|w| w[0] == w[1]));
    // 12 own layers, 12 configs, 12 manifests and one shared base.
    assert_eq!(digest_sets[0].len(), 37);
}

#[tokio::test]
async fn mirror_pulls_a_shared_layer_once() {
    let tmp = tempfile::tempdir().unwrap();
    let src = Arc::new(MemoryRegistry::new().with_latency(Duration::from_millis(5)));
    let list = seed(&src, 20, 256);
    let dest = registry();

    let summary = Engine::new(mirror_config(tmp.path(), Mode::Mirror, 20), src.clone(), dest.clone())
        .mirror(&list)
        .await
        .unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.succeeded, 20);
    assert_eq!(src.blob_pulls(&sha256_digest(&[0x42u8; 512])), 1);
    assert_eq!(dest.counters().manifest_pushes.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn one_failure_leaves_the_rest_of_the_batch_intact() {
    let tmp = tempfile::tempdir().unwrap();
    let src = registry();
    let list = seed(&src, 6, 512);
    src.fail_image(&ImageRef::parse(&format!("{}/library/app3:v1", SOURCE)).unwrap());
    let dest = registry();

    let config = mirror_config(tmp.path(), Mode::Mirror, 3);
    let summary = Engine::new(config.clone(), src, dest.clone())
        .mirror(&list)
        .await
        .unwrap();
    assert_eq!(summary.total, 6);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 1);

    let report = fs::read_to_string(&config.report_path).unwrap();
    let failed: Vec<String> = ImageList::from_text(report)
        .iter()
        .map(|entry| entry.unwrap().text)
        .collect();
    assert_eq!(failed, vec![format!("{}/library/app3:v1", SOURCE)]);

    for n in [0, 1, 2, 4, 5] {
        let to = ImageRef::parse(&format!("{}/library/app{}:v1", DEST, n)).unwrap();
        assert!(dest.manifest(&to).is_some(), "app{} missing", n);
    }
}

#[tokio::test]
async fn load_validate_is_repeatable_and_read_only() {
    let tmp = tempfile::tempdir().unwrap();
    let src = registry();
    let list = seed(&src, 3, 1024);

    let saved = save_config(tmp.path(), "checked", "zstd", 2);
    Engine::new(saved.clone(), src.clone(), src.clone())
        .save(&list)
        .await
        .unwrap();
    let before = snapshot(&saved.archive);

    let mut config = load_config(tmp.path(), Mode::LoadValidate, &saved.archive);
    config.dest = Default::default();
    let engine = Engine::new(config, src.clone(), src.clone());
    let first = engine.load_validate().await.unwrap();
    let second = engine.load_validate().await.unwrap();

    assert_eq!(first.results, second.results);
    assert_eq!(first.violations(), 0);
    assert_eq!(snapshot(&saved.archive), before);
}

#[tokio::test]
async fn mirror_validate_is_repeatable_and_read_only() {
    let tmp = tempfile::tempdir().unwrap();
    let src = registry();
    let list = seed(&src, 4, 1024);
    let dest = registry();

    Engine::new(mirror_config(tmp.path(), Mode::Mirror, 4), src.clone(), dest.clone())
        .mirror(&list)
        .await
        .unwrap();
    dest.remove_blob(
        &ImageRef::parse(&format!("{}/library/app2:v1", DEST)).unwrap(),
        &sha256_digest(&noise(3, 1024)),
    );
    let pushes = dest.counters().blob_pushes.load(Ordering::SeqCst);

    let config = mirror_config(tmp.path(), Mode::MirrorValidate, 4);
    let engine = Engine::new(config.clone(), src.clone(), dest.clone());
    let first = engine.mirror_validate(&list).await.unwrap();
    let second = engine.mirror_validate(&list).await.unwrap();

    assert_eq!(first.results, second.results);
    assert_eq!(first.violations(), 1);
    assert_eq!(first.summary.failed, 1);
    assert_eq!(dest.counters().blob_pushes.load(Ordering::SeqCst), pushes);
    assert_eq!(dest.counters().manifest_pushes.load(Ordering::SeqCst), 4);

    let report = fs::read_to_string(&config.report_path).unwrap();
    assert!(report.starts_with(&format!("{}/library/app2:v1 # [validate]", SOURCE)));
}

#[tokio::test]
async fn saved_archive_keeps_only_the_requested_platforms() {
    let tmp = tempfile::tempdir().unwrap();
    let src = registry();
    let image = ImageRef::parse(&format!("{}/library/multi:v1", SOURCE)).unwrap();
    let platform = |arch: &str| Platform {
        architecture: arch.into(),
        os: "linux".into(),
        variant: None,
    };
    let index = src.insert_index(
        &image,
        &[
            (platform("amd64"), vec![noise(7, 2048).as_slice()]),
            (platform("arm64"), vec![noise(8, 2048).as_slice()]),
        ],
    );
    let list = ImageList::from_text(image.to_string());

    let mut saved = save_config(tmp.path(), "arm", "gzip", 2);
    saved.platforms = PlatformFilter::new(["aarch64"], Vec::<String>::new());
    let summary = Engine::new(saved.clone(), src.clone(), src.clone())
        .save(&list)
        .await
        .unwrap();
    assert!(summary.is_success());

    let dest = registry();
    let load = load_config(tmp.path(), Mode::Load, &saved.archive);
    let summary = Engine::new(load, src.clone(), dest.clone())
        .load(None)
        .await
        .unwrap();
    assert!(summary.is_success(), "{:?}", summary);

    let to = ImageRef::parse(&format!("{}/library/multi:v1", DEST)).unwrap();
    let loaded = dest.manifest(&to).unwrap();
    assert_eq!(loaded.children(), &index.children()[1..]);
    assert!(dest.has_blob(&to, &sha256_digest(&noise(8, 2048))));
    assert!(!dest.has_blob(&to, &sha256_digest(&noise(7, 2048))));
}
