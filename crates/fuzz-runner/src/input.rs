use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{FuzzConfig, MapFileType};

/// Exit, quit, start, wait, up, left, down, right.
pub const ACTION_ALPHABET: [char; 8] = ['E', 'Q', 'S', 'W', 'U', 'L', 'D', 'R'];

pub fn is_valid_action_sequence(seq: &str) -> bool {
    seq.chars().all(|c| ACTION_ALPHABET.contains(&c))
}

/// Map artifact kind, derived from the file suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Text,
    Binary,
    Other(String),
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("txt") => ArtifactKind::Text,
            Some(ext) if ext.eq_ignore_ascii_case("bin") => ArtifactKind::Binary,
            Some(ext) => ArtifactKind::Other(ext.to_ascii_uppercase()),
            None => ArtifactKind::Other("NONE".to_string()),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Text => f.write_str("TXT"),
            ArtifactKind::Binary => f.write_str("BIN"),
            ArtifactKind::Other(ext) => f.write_str(ext),
        }
    }
}

/// Inputs for one iteration. `map_path` lives in the staging directory until
/// the archiver routes it.
#[derive(Debug, Clone)]
pub struct FuzzInput {
    pub map_path: PathBuf,
    pub action_sequence: String,
    pub custom_attribute: Option<String>,
}

pub trait InputSource {
    fn next_input(&mut self, staging_dir: &Path, iteration: usize) -> Result<FuzzInput>;
}

/// Draws every map and action sequence independently from a fixed
/// distribution. Custom maps and sequences, when configured, are consumed
/// first and the generator takes over once they run out.
pub struct RandomInputSource {
    rng: StdRng,
    file_type: MapFileType,
    max_text_height: usize,
    max_text_width: usize,
    text_alphabet: Vec<char>,
    max_binary_size: usize,
    max_action_length: usize,
    custom_maps: VecDeque<PathBuf>,
    custom_sequences: VecDeque<String>,
}

impl RandomInputSource {
    pub fn new(config: &FuzzConfig) -> Result<Self> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let custom_maps = match config.custom.maps_dir.as_deref() {
            Some(dir) => list_custom_maps(dir)?,
            None => VecDeque::new(),
        };
        Ok(Self {
            rng,
            file_type: config.maps.file_type,
            max_text_height: config.maps.max_text_height,
            max_text_width: config.maps.max_text_width,
            text_alphabet: config.maps.text_alphabet.chars().collect(),
            max_binary_size: config.maps.max_binary_size,
            max_action_length: config.actions.max_length,
            custom_maps,
            custom_sequences: config.custom.sequences.iter().cloned().collect(),
        })
    }

    pub fn random_text_map(&mut self) -> String {
        let height = self.rng.gen_range(0..self.max_text_height.max(1));
        let width = self.rng.gen_range(0..self.max_text_width.max(1));
        let mut out = String::with_capacity(height * (width + 1));
        for _ in 0..height {
            for _ in 0..width {
                let idx = self.rng.gen_range(0..self.text_alphabet.len());
                out.push(self.text_alphabet[idx]);
            }
            out.push('\n');
        }
        out
    }

    pub fn random_binary_map(&mut self) -> Vec<u8> {
        let size = self.rng.gen_range(0..self.max_binary_size.max(1));
        let mut bytes = vec![0u8; size];
        self.rng.fill_bytes(&mut bytes);
        bytes
    }

    pub fn random_action_sequence(&mut self) -> String {
        let len = self.rng.gen_range(1..=self.max_action_length.max(1));
        (0..len)
            .map(|_| ACTION_ALPHABET[self.rng.gen_range(0..ACTION_ALPHABET.len())])
            .collect()
    }

    fn write_random_map(&mut self, staging_dir: &Path, iteration: usize) -> Result<PathBuf> {
        let text = match self.file_type {
            MapFileType::Text => true,
            MapFileType::Binary => false,
            MapFileType::All => self.rng.gen_bool(0.5),
        };
        let (path, bytes) = if text {
            (
                staging_dir.join(format!("map_{}.txt", iteration)),
                self.random_text_map().into_bytes(),
            )
        } else {
            (
                staging_dir.join(format!("map_{}.bin", iteration)),
                self.random_binary_map(),
            )
        };
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write map {}", path.display()))?;
        Ok(path)
    }
}

impl InputSource for RandomInputSource {
    fn next_input(&mut self, staging_dir: &Path, iteration: usize) -> Result<FuzzInput> {
        let (map_path, custom_attribute) = match self.custom_maps.pop_front() {
            Some(source) => {
                let name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "custom".to_string());
                // Iteration prefix keeps staged names unique.
                let staged = staging_dir.join(format!("map_{}_{}", iteration, name));
                fs::copy(&source, &staged).with_context(|| {
                    format!("failed to stage custom map {}", source.display())
                })?;
                (staged, Some(name))
            }
            None => (self.write_random_map(staging_dir, iteration)?, None),
        };
        let action_sequence = match self.custom_sequences.pop_front() {
            Some(seq) => seq,
            None => self.random_action_sequence(),
        };
        Ok(FuzzInput {
            map_path,
            action_sequence,
            custom_attribute,
        })
    }
}

fn list_custom_maps(dir: &Path) -> Result<VecDeque<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to read custom maps dir {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mapfuzz_input_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn seeded(seed: u64) -> FuzzConfig {
        let mut config = FuzzConfig::default();
        config.seed = Some(seed);
        config
    }

    #[test]
    fn action_sequences_stay_in_alphabet_and_bounds() {
        let mut source = RandomInputSource::new(&seeded(1)).expect("source");
        for _ in 0..200 {
            let seq = source.random_action_sequence();
            assert!(!seq.is_empty() && seq.len() <= 5, "bad length: {}", seq);
            assert!(is_valid_action_sequence(&seq), "bad chars: {}", seq);
        }
    }

    #[test]
    fn text_maps_are_newline_terminated_rows_of_alphabet_chars() {
        let mut config = seeded(2);
        config.maps.text_alphabet = "MWP0F".to_string();
        let mut source = RandomInputSource::new(&config).expect("source");
        for _ in 0..50 {
            let map = source.random_text_map();
            assert!(map.is_empty() || map.ends_with('\n'));
            let rows: Vec<&str> = map.lines().collect();
            assert!(rows.len() < 20);
            for row in rows {
                assert!(row.len() < 20);
                assert!(row.chars().all(|c| "MWP0F".contains(c)), "row: {}", row);
            }
        }
    }

    #[test]
    fn binary_maps_respect_max_size() {
        let mut config = seeded(3);
        config.maps.max_binary_size = 16;
        let mut source = RandomInputSource::new(&config).expect("source");
        for _ in 0..50 {
            assert!(source.random_binary_map().len() < 16);
        }
    }

    #[test]
    fn same_seed_gives_same_stream() {
        let mut a = RandomInputSource::new(&seeded(42)).expect("a");
        let mut b = RandomInputSource::new(&seeded(42)).expect("b");
        for _ in 0..10 {
            assert_eq!(a.random_action_sequence(), b.random_action_sequence());
            assert_eq!(a.random_text_map(), b.random_text_map());
        }
    }

    #[test]
    fn artifact_kind_follows_suffix() {
        assert_eq!(ArtifactKind::from_path(Path::new("m/map_1.txt")), ArtifactKind::Text);
        assert_eq!(ArtifactKind::from_path(Path::new("map_2.BIN")), ArtifactKind::Binary);
        assert_eq!(ArtifactKind::from_path(Path::new("x.png")).to_string(), "PNG");
        assert_eq!(ArtifactKind::from_path(Path::new("noext")).to_string(), "NONE");
    }

    #[test]
    fn custom_inputs_are_used_first_then_random() {
        let seeds = temp_dir("seeds");
        let staging = temp_dir("staging");
        fs::write(seeds.join("b.png"), b"img").expect("write b");
        fs::write(seeds.join("a.txt"), b"PMW\n").expect("write a");

        let mut config = seeded(5);
        config.custom.maps_dir = Some(seeds.clone());
        config.custom.sequences = vec!["SWE".to_string()];
        let mut source = RandomInputSource::new(&config).expect("source");

        let first = source.next_input(&staging, 1).expect("first");
        assert_eq!(first.custom_attribute.as_deref(), Some("a.txt"));
        assert_eq!(first.action_sequence, "SWE");
        assert_eq!(fs::read(&first.map_path).expect("read"), b"PMW\n");

        let second = source.next_input(&staging, 2).expect("second");
        assert_eq!(second.custom_attribute.as_deref(), Some("b.png"));
        assert!(is_valid_action_sequence(&second.action_sequence));

        let third = source.next_input(&staging, 3).expect("third");
        assert!(third.custom_attribute.is_none());
        assert!(third.map_path.starts_with(&staging));
        assert!(seeds.join("a.txt").exists(), "originals must stay in place");

        let _ = fs::remove_dir_all(seeds);
        let _ = fs::remove_dir_all(staging);
    }
}
