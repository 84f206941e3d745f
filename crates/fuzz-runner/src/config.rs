use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::input::is_valid_action_sequence;

pub const DEFAULT_CONFIG_FILE: &str = "fuzz.yaml";

/// Which kind of map the random generator writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapFileType {
    Text,
    Binary,
    All,
}

/// Resolved fuzzer configuration. Built once at start-up and handed by
/// reference to every component that needs it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FuzzConfig {
    pub target: TargetConfig,
    pub budget: BudgetConfig,
    pub maps: MapConfig,
    pub actions: ActionConfig,
    pub custom: CustomConfig,
    pub results: ResultsConfig,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    /// Argument vector prefix. The map path and the action sequence are
    /// appended as the final two arguments.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "java".to_string(),
                "-jar".to_string(),
                "jpacman-3.0.1.jar".to_string(),
            ],
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    pub max_iterations: usize,
    pub max_time_ms: u64,
    pub iteration_timeout_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_time_ms: 900_000,
            iteration_timeout_ms: 10_000,
        }
    }
}

impl BudgetConfig {
    pub fn run_budget(&self) -> Duration {
        Duration::from_millis(self.max_time_ms)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_millis(self.iteration_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapConfig {
    pub file_type: MapFileType,
    pub max_text_height: usize,
    pub max_text_width: usize,
    pub text_alphabet: String,
    pub max_binary_size: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            file_type: MapFileType::All,
            max_text_height: 20,
            max_text_width: 20,
            text_alphabet: "abcdefghijklmnopqrstuvwxyz".to_string(),
            max_binary_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionConfig {
    pub max_length: usize,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self { max_length: 5 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CustomConfig {
    pub maps_dir: Option<PathBuf>,
    pub sequences: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResultsConfig {
    pub root: PathBuf,
    pub clean_previous: bool,
    pub log_history: bool,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("fuzz_results"),
            clean_previous: false,
            log_history: true,
        }
    }
}

/// Reads `path`, resolves relative paths against its directory and validates.
pub fn load_config(path: &Path) -> Result<FuzzConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut config = parse_config(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    config.resolve_paths(base_dir);
    config.validate()?;
    Ok(config)
}

pub fn parse_config(raw: &str) -> Result<FuzzConfig> {
    if raw.trim().is_empty() {
        return Ok(FuzzConfig::default());
    }
    Ok(serde_yaml::from_str(raw)?)
}

impl FuzzConfig {
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if self.results.root.is_relative() {
            self.results.root = base_dir.join(&self.results.root);
        }
        if let Some(dir) = self.custom.maps_dir.as_mut() {
            if dir.is_relative() {
                *dir = base_dir.join(&*dir);
            }
        }
        if let Some(dir) = self.target.working_dir.as_mut() {
            if dir.is_relative() {
                *dir = base_dir.join(&*dir);
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Collects every problem before failing so the user can fix the file
    /// in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.target.command.is_empty() || self.target.command[0].trim().is_empty() {
            problems.push("target.command must name an executable".to_string());
        }
        if self.budget.max_iterations == 0 {
            problems.push("budget.max_iterations must be > 0".to_string());
        }
        if self.budget.iteration_timeout_ms == 0 {
            problems.push("budget.iteration_timeout_ms must be > 0".to_string());
        }
        if self.maps.text_alphabet.is_empty() {
            problems.push("maps.text_alphabet must not be empty".to_string());
        }
        if self.maps.max_text_height == 0 || self.maps.max_text_width == 0 {
            problems.push("maps.max_text_height and maps.max_text_width must be >= 1".to_string());
        }
        if self.maps.max_binary_size == 0 {
            problems.push("maps.max_binary_size must be >= 1".to_string());
        }
        if self.actions.max_length == 0 {
            problems.push("actions.max_length must be >= 1".to_string());
        }
        for seq in &self.custom.sequences {
            if !is_valid_action_sequence(seq) {
                problems.push(format!(
                    "custom.sequences entry '{}' uses characters outside EQSWULDR",
                    seq
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "invalid fuzz configuration:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }
}

pub const CONFIG_TEMPLATE: &str = r#"# mapfuzz configuration. Every key is optional.
target:
  # The map path and the action sequence are appended to this command.
  command: ["java", "-jar", "jpacman-3.0.1.jar"]
budget:
  max_iterations: 100
  max_time_ms: 900000
  iteration_timeout_ms: 10000
maps:
  file_type: all # text | binary | all
  max_text_height: 20
  max_text_width: 20
  text_alphabet: "abcdefghijklmnopqrstuvwxyz"
  max_binary_size: 1000
actions:
  max_length: 5
custom:
  # maps_dir: custom_maps
  sequences: []
results:
  root: fuzz_results
  clean_previous: false
  log_history: true
# seed: 1337
"#;
