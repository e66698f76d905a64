//! Helpers shared by the end-to-end tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hangar::{ImageList, Mode, RegistryConfig, RunConfig};
use hangar_oci::{ImageRef, MemoryRegistry};

pub const SOURCE: &str = "src.local";
pub const DEST: &str = "dest.local";

/// Seed `count` images under `src.local/library/app<n>:v1`.  Every image
/// shares one base layer and carries a layer of its own of `layer_size`
/// bytes.
pub fn seed(registry: &MemoryRegistry, count: usize, layer_size: usize) -> ImageList {
    let base = vec![0x42u8; 512];
    let mut lines = Vec::with_capacity(count);
    for n in 0..count {
        let name = format!("{}/library/app{}:v1", SOURCE, n);
        let own = noise(n as u64 + 1, layer_size);
        registry.insert_image(&ImageRef::parse(&name).unwrap(), &[base.as_slice(), own.as_slice()]);
        lines.push(name);
    }
    ImageList::from_text(lines.join("\n"))
}

/// Incompressible bytes, stable for a given seed.
pub fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

pub fn registry() -> Arc<MemoryRegistry> {
    Arc::new(MemoryRegistry::new())
}

pub fn save_config(dir: &Path, name: &str, format: &str, jobs: usize) -> RunConfig {
    let mut config = RunConfig::new(Mode::Save);
    config.format = format.parse().unwrap();
    config.archive = config.format.output_path(dir.join(name).to_str().unwrap());
    config.cache_dir = dir.join(format!("{}-cache", name));
    config.report_path = dir.join(format!("{}-save-failed.txt", name));
    config.jobs = jobs;
    config
}

pub fn load_config(dir: &Path, mode: Mode, archive: &Path) -> RunConfig {
    let mut config = RunConfig::new(mode);
    config.archive = archive.to_path_buf();
    config.cache_dir = dir.join(format!("{}-cache", mode));
    config.report_path = dir.join(mode.report_name());
    config.dest = RegistryConfig::new(DEST);
    config.jobs = 4;
    config
}

pub fn mirror_config(dir: &Path, mode: Mode, jobs: usize) -> RunConfig {
    let mut config = RunConfig::new(mode);
    config.dest = RegistryConfig::new(DEST);
    config.report_path = dir.join(mode.report_name());
    config.jobs = jobs;
    config
}

/// Content digests stored in a directory archive.
pub fn directory_digests(root: &Path) -> BTreeSet<String> {
    fs::read_dir(root.join(hangar_archive::BLOBS_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.ends_with(".partial"))
        .collect()
}

/// Files in `dir` whose names start with `prefix`, sorted.
pub fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(prefix))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// Bytes of every file under `root`, keyed by relative path.
pub fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if dir.is_file() {
            out.push((dir.strip_prefix(root).unwrap_or(&dir).to_path_buf(), fs::read(&dir).unwrap()));
            continue;
        }
        for entry in fs::read_dir(&dir).unwrap() {
            stack.push(entry.unwrap().path());
        }
    }
    out.sort();
    out
}
