mod harnesses;

use tracefuzz_core::config::{ExecutorConfig, ExecutorType, GuidanceKind, TraceFuzzConfig};
use tracefuzz_core::corpus::{Corpus, InMemoryCorpus, OnDiskCorpus, resolve_input_files};
use tracefuzz_core::executor::{CommandExecutor, Executor, InProcessExecutor};
use tracefuzz_core::guidance::{
    AflGuidance, DiffNoGuidance, DiffReproGuidance, ExecutionIndexingGuidance, Guidance,
    NoGuidance, ReproGuidance, ReproServerGuidance,
};
use tracefuzz_core::oracle::{Bytewise, Comparison, Decoded, Finding};
use tracefuzz_core::session::{FuzzSession, SessionSummary};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "tracefuzz.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file. Defaults to `tracefuzz.toml` when present.
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzzes a target with random or execution-indexing guidance.
    Fuzz(FuzzArgs),
    /// Serves trials to an AFL coprocess over named pipes.
    Afl(AflArgs),
    /// Replays input files and reports each result.
    Repro(ReproArgs),
    /// Replays inputs named on a command pipe and writes their coverage.
    ReproServer(ReproServerArgs),
    /// Replays inputs through two variants and reports divergent outcomes.
    Diff(DiffArgs),
    /// Lists the built-in harnesses.
    List,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum GuidanceArg {
    Random,
    Ei,
}

impl From<GuidanceArg> for GuidanceKind {
    fn from(arg: GuidanceArg) -> Self {
        match arg {
            GuidanceArg::Random => GuidanceKind::Random,
            GuidanceArg::Ei => GuidanceKind::ExecutionIndexing,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
enum ComparisonArg {
    #[default]
    Bytewise,
    I32,
    Bytes,
}

impl ComparisonArg {
    fn build(self) -> Box<dyn Comparison> {
        match self {
            ComparisonArg::Bytewise => Box::new(Bytewise),
            ComparisonArg::I32 => Box::new(Decoded::<i32>::new("i32")),
            ComparisonArg::Bytes => Box::new(Decoded::<Vec<u8>>::new("bytes")),
        }
    }
}

#[derive(Args, Debug)]
struct FuzzArgs {
    /// Built-in harness as `class::method`. Falls back to the configured executor.
    #[clap(long)]
    harness: Option<String>,
    #[clap(long, value_enum)]
    guidance: Option<GuidanceArg>,
    #[clap(short, long)]
    trials: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    /// Directory for saved inputs (execution-indexing only).
    #[clap(short, long)]
    out: Option<PathBuf>,
    /// Harness whose outcomes every trial is checked against.
    #[clap(long)]
    reference: Option<String>,
    #[clap(long, value_enum, default_value_t)]
    comparison: ComparisonArg,
    /// Seed files or directories, replayed before mutation starts.
    seeds: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct AflArgs {
    #[clap(long)]
    harness: Option<String>,
    #[clap(long)]
    input_file: Option<PathBuf>,
    #[clap(long)]
    in_pipe: Option<PathBuf>,
    #[clap(long)]
    out_pipe: Option<PathBuf>,
    #[clap(long)]
    coverage_log: Option<PathBuf>,
    #[clap(long)]
    map_size: Option<usize>,
    #[clap(long)]
    run_timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct ReproArgs {
    test_class: String,
    test_method: String,
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
    /// Writes the event trace of every replayed input here.
    #[clap(long)]
    trace_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ReproServerArgs {
    #[clap(long)]
    harness: String,
    #[clap(long)]
    commands: PathBuf,
    #[clap(long)]
    coverage_file: PathBuf,
}

#[derive(Args, Debug)]
struct DiffArgs {
    #[clap(long)]
    harness: String,
    #[clap(long)]
    reference: String,
    #[clap(long, value_enum, default_value_t)]
    comparison: ComparisonArg,
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
}

fn load_config(path: Option<PathBuf>) -> Result<TraceFuzzConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            TraceFuzzConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("Loading default configuration from {default_config_path:?}");
                TraceFuzzConfig::load_from_file(&default_config_path)
            } else {
                info!("No configuration file found, using built-in defaults");
                Ok(TraceFuzzConfig::default())
            }
        }
    }
}

fn in_process(key: &str) -> Result<Box<dyn Executor + Send>, anyhow::Error> {
    let harness = harnesses::lookup(key).ok_or_else(|| {
        let known: Vec<&str> = harnesses::names().collect();
        anyhow::anyhow!("Unknown harness '{key}' (known: {})", known.join(", "))
    })?;
    Ok(Box::new(InProcessExecutor::new(key, harness)))
}

/// The named harness if one is given, otherwise whatever the configuration
/// selects.
fn build_executor(
    harness: Option<&str>,
    config: &ExecutorConfig,
) -> Result<Box<dyn Executor + Send>, anyhow::Error> {
    if let Some(key) = harness {
        return in_process(key);
    }
    match config.executor_type {
        ExecutorType::InProcess => {
            let key = config
                .in_process_settings
                .as_ref()
                .map(|s| s.harness_key.as_str())
                .filter(|key| !key.is_empty())
                .context("No harness given (use --harness or executor.in-process-settings)")?;
            in_process(key)
        }
        ExecutorType::Command => {
            let settings = config
                .command_settings
                .as_ref()
                .context("Command settings missing for command executor in config")?;
            Ok(Box::new(CommandExecutor::new(settings.to_executor_config()?)))
        }
    }
}

fn resolve_all<'p>(paths: impl IntoIterator<Item = &'p PathBuf>) -> Result<Vec<PathBuf>, anyhow::Error> {
    let mut files = Vec::new();
    for path in paths {
        files.extend(resolve_input_files(path)?);
    }
    Ok(files)
}

fn run_session<G: Guidance>(
    guidance: G,
    executor: Box<dyn Executor + Send>,
) -> Result<(G, SessionSummary), anyhow::Error> {
    let mut session = FuzzSession::builder()
        .bind_guidance(guidance)?
        .executor(executor)
        .build()?;
    session.run()?;
    let (guidance, _executor, summary) = session.into_parts();
    Ok((guidance, summary))
}

fn print_summary(summary: &SessionSummary) {
    println!(
        "Trials: {}, Successes: {}, Invalid: {}, Failures: {}, Timeouts: {}, Execs/sec: {:.2}",
        summary.trials,
        summary.successes,
        summary.invalid,
        summary.failures,
        summary.timeouts,
        summary.execs_per_sec()
    );
    for message in &summary.failure_messages {
        println!("  {message}");
    }
}

fn print_findings(findings: &[Finding]) {
    for finding in findings {
        println!(
            "Divergence at trial {} (input {}): {}",
            finding.trial, finding.input_hash, finding.error
        );
    }
}

fn exit_status(clean: bool) -> ExitCode {
    if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn run_fuzz(args: FuzzArgs, config: TraceFuzzConfig) -> Result<ExitCode, anyhow::Error> {
    let executor = build_executor(args.harness.as_deref(), &config.executor)?;
    let max_trials = args.trials.unwrap_or(config.session.max_trials);
    let seed = args.seed.unwrap_or(config.session.seed);
    let kind = args
        .guidance
        .map_or(config.session.guidance, GuidanceKind::from);
    let random = || -> Result<NoGuidance, anyhow::Error> {
        Ok(NoGuidance::new(max_trials, seed)?
            .with_keep_going_on_failure(config.session.keep_going_on_failure))
    };

    if let Some(reference) = &args.reference {
        anyhow::ensure!(
            kind == GuidanceKind::Random,
            "--reference is only supported with random guidance"
        );
        let guidance = DiffNoGuidance::new(random()?, in_process(reference)?)
            .with_comparison(args.comparison.build());
        let (guidance, summary) = run_session(guidance, executor)?;
        print_summary(&summary);
        print_findings(guidance.findings());
        return Ok(exit_status(guidance.findings().is_empty()));
    }

    let summary = match kind {
        GuidanceKind::Random => run_session(random()?, executor)?.1,
        GuidanceKind::ExecutionIndexing => {
            let corpus: Box<dyn Corpus> = match args.out.or(config.corpus.output_directory) {
                Some(directory) => {
                    info!("Saving inputs to {directory:?}");
                    Box::new(OnDiskCorpus::new(directory)?)
                }
                None => Box::new(InMemoryCorpus::new()),
            };
            let seeds = resolve_all(args.seeds.iter().chain(&config.corpus.seed_paths))?;
            let settings = config.indexing.to_guidance_settings(max_trials);
            let guidance =
                ExecutionIndexingGuidance::new(settings, seed, corpus)?.with_seeds(seeds);
            let (guidance, summary) = run_session(guidance, executor)?;
            println!(
                "Corpus: {} inputs, coverage: {} edges",
                guidance.corpus().len(),
                guidance.total_coverage().non_zero_count()
            );
            summary
        }
    };
    print_summary(&summary);
    Ok(exit_status(summary.failures == 0))
}

fn run_afl(args: AflArgs, config: TraceFuzzConfig) -> Result<ExitCode, anyhow::Error> {
    let executor = build_executor(args.harness.as_deref(), &config.executor)?;
    let base = config.afl;
    let input_file = args
        .input_file
        .or_else(|| base.as_ref().map(|afl| afl.input_file.clone()))
        .context("AFL input file not set (use --input-file or [afl] input-file)")?;
    let in_pipe = args
        .in_pipe
        .or_else(|| base.as_ref().map(|afl| afl.in_pipe.clone()))
        .context("AFL input pipe not set (use --in-pipe or [afl] in-pipe)")?;
    let out_pipe = args
        .out_pipe
        .or_else(|| base.as_ref().map(|afl| afl.out_pipe.clone()))
        .context("AFL output pipe not set (use --out-pipe or [afl] out-pipe)")?;
    let coverage_log = args
        .coverage_log
        .or_else(|| base.as_ref().and_then(|afl| afl.coverage_log.clone()));
    let run_timeout_ms = args
        .run_timeout_ms
        .or_else(|| base.as_ref().and_then(|afl| afl.run_timeout_ms));

    let mut guidance = AflGuidance::open(input_file, &in_pipe, &out_pipe)?;
    if let Some(map_size) = args.map_size.or_else(|| base.as_ref().map(|afl| afl.map_size)) {
        guidance = guidance.with_map_size(map_size)?;
    }
    if let Some(path) = coverage_log {
        let file = File::create(&path)
            .with_context(|| format!("Failed to create coverage log {path:?}"))?;
        guidance = guidance.with_coverage_log(Box::new(BufWriter::new(file)));
    }
    if let Some(ms) = run_timeout_ms {
        guidance = guidance.with_run_timeout(Duration::from_millis(ms));
    }

    let (_guidance, summary) = run_session(guidance, executor)?;
    print_summary(&summary);
    Ok(ExitCode::SUCCESS)
}

fn run_repro(args: ReproArgs) -> Result<ExitCode, anyhow::Error> {
    let Some(harness) = harnesses::lookup_method(&args.test_class, &args.test_method) else {
        error!(
            "No harness registered for {}::{}",
            args.test_class, args.test_method
        );
        return Ok(ExitCode::from(2));
    };
    let key = format!("{}::{}", args.test_class, args.test_method);
    let executor: Box<dyn Executor + Send> = Box::new(InProcessExecutor::new(key, harness));

    let mut guidance = ReproGuidance::new(resolve_all(&args.inputs)?);
    if let Some(directory) = args.trace_dir {
        guidance = guidance.with_trace_dir(directory)?;
    }
    let (guidance, _summary) = run_session(guidance, executor)?;
    for record in guidance.records() {
        match &record.error {
            Some(error) => println!("{}: {} ({error})", record.path.display(), record.result),
            None => println!("{}: {}", record.path.display(), record.result),
        }
    }
    Ok(exit_status(guidance.all_succeeded()))
}

fn run_repro_server(args: ReproServerArgs) -> Result<ExitCode, anyhow::Error> {
    let executor = in_process(&args.harness)?;
    let guidance = ReproServerGuidance::open(&args.commands, args.coverage_file)?;
    let (guidance, _summary) = run_session(guidance, executor)?;
    info!("Repro server closed after {} inputs", guidance.trials());
    Ok(ExitCode::SUCCESS)
}

/// Runs `inputs` through `reference` to collect expected outcomes, then
/// through `harness` checking each against them.
fn diff_inputs(
    harness: &str,
    reference: &str,
    comparison: ComparisonArg,
    inputs: &[PathBuf],
) -> Result<Vec<Finding>, anyhow::Error> {
    let files = resolve_all(inputs)?;
    let (expected, _summary) = run_session(
        DiffReproGuidance::new(ReproGuidance::new(files.clone())),
        in_process(reference)?,
    )?;
    let guidance = DiffReproGuidance::new(ReproGuidance::new(files))
        .with_comparison(comparison.build())
        .with_reference_outcomes(expected.into_outcomes());
    let (guidance, summary) = run_session(guidance, in_process(harness)?)?;
    print_summary(&summary);
    Ok(guidance.findings().to_vec())
}

fn run_diff(args: DiffArgs) -> Result<ExitCode, anyhow::Error> {
    let findings = diff_inputs(&args.harness, &args.reference, args.comparison, &args.inputs)?;
    if findings.is_empty() {
        println!("No divergence found");
    } else {
        warn!("{} divergent inputs", findings.len());
        print_findings(&findings);
    }
    Ok(exit_status(findings.is_empty()))
}

fn main() -> Result<ExitCode, anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Fuzz(args) => run_fuzz(args, load_config(cli.config_file)?),
        Command::Afl(args) => run_afl(args, load_config(cli.config_file)?),
        Command::Repro(args) => run_repro(args),
        Command::ReproServer(args) => run_repro_server(args),
        Command::Diff(args) => run_diff(args),
        Command::List => {
            for name in harnesses::names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_inputs(dir: &Path, inputs: &[&[u8]]) -> Vec<PathBuf> {
        inputs
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                let path = dir.join(format!("input-{i}"));
                fs::write(&path, bytes).expect("write input");
                path
            })
            .collect()
    }

    #[test]
    fn parses_fuzz_subcommand() {
        let cli = Cli::parse_from([
            "tracefuzz", "fuzz", "--harness", "demo.Sort::quick", "--guidance", "ei", "-t", "50",
            "seeds",
        ]);
        let Command::Fuzz(args) = cli.command else {
            panic!("expected fuzz subcommand");
        };
        assert_eq!(args.harness.as_deref(), Some("demo.Sort::quick"));
        assert!(matches!(args.guidance, Some(GuidanceArg::Ei)));
        assert_eq!(args.trials, Some(50));
        assert_eq!(args.seeds, vec![PathBuf::from("seeds")]);
    }

    #[test]
    fn unknown_harness_is_an_error() {
        assert!(in_process("demo.Nope::run").is_err());
        assert!(build_executor(None, &ExecutorConfig::default()).is_err());
    }

    #[test]
    fn diff_finds_duplicate_handling_divergence() -> Result<(), anyhow::Error> {
        let dir = tempdir()?;
        write_inputs(dir.path(), &[&[3, 1, 2, 3], &[2, 9, 9], &[0]]);
        let findings = diff_inputs(
            "demo.Sort::quick",
            "demo.Sort::insertion",
            ComparisonArg::Bytes,
            &[dir.path().to_path_buf()],
        )?;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].trial, 1);
        Ok(())
    }

    #[test]
    fn random_fuzzing_runs_requested_trials() -> Result<(), anyhow::Error> {
        let executor = in_process("demo.Calculator::evaluate")?;
        let (guidance, summary) = run_session(NoGuidance::new(200, 3)?, executor)?;
        assert_eq!(summary.trials, 200);
        assert_eq!(guidance.trials(), 200);
        assert!(summary.successes > 0);
        Ok(())
    }

    #[test]
    fn repro_with_unknown_harness_exits_with_two() -> Result<(), anyhow::Error> {
        let code = run_repro(ReproArgs {
            test_class: "demo.Nope".to_string(),
            test_method: "run".to_string(),
            inputs: vec![PathBuf::from("unused")],
            trace_dir: None,
        })?;
        assert_eq!(format!("{code:?}"), format!("{:?}", ExitCode::from(2)));
        Ok(())
    }
}
