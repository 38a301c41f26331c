use crate::coverage::DEFAULT_TRACE_MAP_SIZE;
use crate::executor::{CommandExecutorConfig, InputDelivery};
use crate::guidance::ExecutionIndexingSettings;
use crate::indexing::{DEFAULT_COUNTER_SIZE, DEFAULT_MAX_DEPTH, IndexingMode};
use crate::mutator::{DEFAULT_MEAN_MUTATION_COUNT, DEFAULT_MEAN_MUTATION_SIZE};
use crate::scheduler::DEFAULT_CHILDREN_PER_PARENT;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandExecutorSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_max_input_len() -> usize {
    1 << 20
}

impl CommandExecutorSettings {
    pub fn to_executor_config(&self) -> Result<CommandExecutorConfig, anyhow::Error> {
        if self.command.is_empty() {
            anyhow::bail!("Command executor settings must name a command");
        }
        Ok(CommandExecutorConfig {
            command: self.command.clone(),
            input_delivery: match &self.input_delivery {
                ConfigInputDelivery::StdIn => InputDelivery::StdIn,
                ConfigInputDelivery::File { template } => InputDelivery::File(template.clone()),
            },
            timeout: Duration::from_millis(self.timeout_ms),
            working_dir: self.working_dir.clone(),
            max_input_len: self.max_input_len,
        })
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorType {
    #[default]
    InProcess,
    Command,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InProcessExecutorSettings {
    /// Registered harness, as `class::method`.
    #[serde(default)]
    pub harness_key: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub executor_type: ExecutorType,
    #[serde(default)]
    pub command_settings: Option<CommandExecutorSettings>,
    #[serde(default)]
    pub in_process_settings: Option<InProcessExecutorSettings>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GuidanceKind {
    #[default]
    Random,
    ExecutionIndexing,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default)]
    pub guidance: GuidanceKind,
    #[serde(default = "default_max_trials")]
    pub max_trials: u64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_keep_going_on_failure")]
    pub keep_going_on_failure: bool,
}

pub fn default_max_trials() -> u64 {
    1_000_000
}

fn default_keep_going_on_failure() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            guidance: GuidanceKind::default(),
            max_trials: default_max_trials(),
            seed: 0,
            keep_going_on_failure: default_keep_going_on_failure(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct IndexingSettings {
    #[serde(default)]
    pub mode: IndexingMode,
    #[serde(default = "default_counter_table_size")]
    pub counter_table_size: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_children_per_parent")]
    pub children_per_parent: usize,
    #[serde(default = "default_mean_mutation_count")]
    pub mean_mutation_count: f64,
    #[serde(default = "default_mean_mutation_size")]
    pub mean_mutation_size: f64,
}

fn default_counter_table_size() -> usize {
    DEFAULT_COUNTER_SIZE
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_children_per_parent() -> usize {
    DEFAULT_CHILDREN_PER_PARENT
}

fn default_mean_mutation_count() -> f64 {
    DEFAULT_MEAN_MUTATION_COUNT
}

fn default_mean_mutation_size() -> f64 {
    DEFAULT_MEAN_MUTATION_SIZE
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            mode: IndexingMode::default(),
            counter_table_size: default_counter_table_size(),
            max_depth: default_max_depth(),
            children_per_parent: default_children_per_parent(),
            mean_mutation_count: default_mean_mutation_count(),
            mean_mutation_size: default_mean_mutation_size(),
        }
    }
}

impl IndexingSettings {
    pub fn to_guidance_settings(&self, max_trials: u64) -> ExecutionIndexingSettings {
        ExecutionIndexingSettings {
            max_trials,
            mode: self.mode,
            counter_size: self.counter_table_size,
            max_depth: self.max_depth,
            children_per_parent: self.children_per_parent,
            mean_mutation_count: self.mean_mutation_count,
            mean_mutation_size: self.mean_mutation_size,
            ..ExecutionIndexingSettings::default()
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AflSettings {
    pub input_file: PathBuf,
    pub in_pipe: PathBuf,
    pub out_pipe: PathBuf,
    pub coverage_log: Option<PathBuf>,
    #[serde(default = "default_map_size")]
    pub map_size: usize,
    pub run_timeout_ms: Option<u64>,
}

fn default_map_size() -> usize {
    DEFAULT_TRACE_MAP_SIZE
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    /// Where saved inputs are written. Kept in memory only when absent.
    pub output_directory: Option<PathBuf>,
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TraceFuzzConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub indexing: IndexingSettings,
    #[serde(default)]
    pub afl: Option<AflSettings>,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl TraceFuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: TraceFuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
