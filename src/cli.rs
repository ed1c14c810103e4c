//! Command line for a test binary built on the harness.
//!
//! A test binary supplies a function that builds its [`Suite`] and hands it
//! to [`main`]. The same binary serves as coordinator (`run`) and as worker
//! (the hidden `worker` subcommand) for parallel runs.

use crate::config::{self, HarnessConfig};
use crate::context::{self, Console, HarnessContext, HarnessOptions};
use crate::loader;
use crate::outcome::{Status, SuiteReport, TestOutcome};
use crate::suite::{Suite, WorkerAssignment, WorkerLaunch};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "enginetest")]
#[command(about = "Run storage-engine tests in isolated fixture directories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the test suite
    Run(RunArgs),
    /// Run tests assigned by a coordinator process (reads JSON on stdin)
    #[command(hide = true)]
    Worker,
    /// Output the configuration file schema
    Schema,
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Number of worker processes
    #[arg(short = 'j', long)]
    pub parallel: Option<usize>,
    /// Keep fixture directories of passing tests
    #[arg(short, long)]
    pub preserve: bool,
    /// Console verbosity (0-3)
    #[arg(short, long)]
    pub verbose: Option<u8>,
    /// Suite root directory (purged before the run)
    #[arg(short = 'D', long)]
    pub dir: Option<PathBuf>,
    /// Append a timestamp to the suite root
    #[arg(short, long)]
    pub timestamp: bool,
    /// Include long-running tests
    #[arg(short, long)]
    pub long: bool,
    /// Filter tests by name (substring match)
    #[arg(short, long)]
    pub filter: Option<String>,
    /// Output format
    #[arg(short, long, default_value = "human")]
    pub output: OutputFormat,
    /// Kill workers still running after this many seconds
    #[arg(long)]
    pub worker_timeout: Option<u64>,
    /// Configuration file (default: enginetest.yaml or .toml in the current directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Everything a run needs after merging the config file with the flags.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub options: HarnessOptions,
    pub parallel: usize,
    pub worker_timeout: Option<Duration>,
    pub output: OutputFormat,
}

impl RunSettings {
    /// Flags win over the file; the file wins over built-in defaults.
    pub fn merge(file: HarnessConfig, args: &RunArgs) -> Self {
        let defaults = HarnessOptions::default();
        let options = HarnessOptions {
            root: args.dir.clone().or(file.dir).unwrap_or(defaults.root.clone()),
            timestamp: args.timestamp || file.timestamp,
            preserve: args.preserve || file.preserve,
            verbose: args.verbose.or(file.verbose).unwrap_or(defaults.verbose),
            long: args.long || file.long,
            conn_config: file.conn_config.unwrap_or_default(),
            console: match args.output {
                OutputFormat::Human => Console::Stdout,
                OutputFormat::Json | OutputFormat::Junit => Console::Stderr,
            },
            ..defaults
        };
        let parallel = args.parallel.or(file.parallel).unwrap_or(1).max(1);
        Self {
            options: HarnessOptions {
                concurrent: parallel > 1,
                ..options
            },
            parallel,
            worker_timeout: args
                .worker_timeout
                .or(file.worker_timeout)
                .map(Duration::from_secs),
            output: args.output,
        }
    }
}

/// Send diagnostics to a copy of stderr taken now, before any test redirects
/// descriptor 2.
fn init_tracing(verbose: u8) {
    let default = if verbose >= 2 { "enginetest=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let Ok(stderr) = context::dup_descriptor(libc::STDERR_FILENO) else {
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(Arc::new(stderr)).with_ansi(false))
        .with(filter)
        .try_init();
}

/// Parse the command line and run `build`'s suite. Never returns.
pub fn main(build: impl Fn() -> Suite) -> ! {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => run(&args, &build),
        Command::Worker => worker(&build),
        Command::Schema => {
            let schema = config::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => {
                    println!("{json}");
                    0
                }
                Err(e) => {
                    eprintln!("Error serializing schema: {e}");
                    1
                }
            }
        }
    };
    std::process::exit(code)
}

fn run(args: &RunArgs, build: &dyn Fn() -> Suite) -> i32 {
    let file_config = match &args.config {
        Some(path) => loader::load_config(path).map(Some),
        None => loader::find_config(Path::new(".")),
    };
    let file_config = match file_config {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error loading config: {e}");
            return 1;
        }
    };
    let settings = RunSettings::merge(file_config, args);
    init_tracing(settings.options.verbose);

    let mut suite = build();
    if let Some(f) = &args.filter {
        if settings.options.verbose > 1 {
            eprintln!("Filtering tests by: {f:?}");
        }
        suite.filter(f);
    }
    if let Err(e) = suite.validate() {
        eprintln!("Invalid suite: {e}");
        return 1;
    }
    if suite.is_empty() {
        eprintln!("No tests to run");
        return 1;
    }

    let ctx = match HarnessContext::global_setup(settings.options.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Global setup failed: {e}");
            return 1;
        }
    };

    let report = if settings.parallel > 1 {
        let program = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => {
                eprintln!("Cannot locate own executable for workers: {e}");
                return 1;
            }
        };
        let launch = WorkerLaunch {
            workers: settings.parallel,
            program,
            args: vec!["worker".to_string()],
            timeout: settings.worker_timeout,
        };
        match suite.run_parallel(&ctx, &launch) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("Parallel run failed: {e}");
                return 1;
            }
        }
    } else {
        suite.run_sequential(&ctx)
    };

    match settings.output {
        OutputFormat::Human => print_human(&report, settings.options.verbose),
        OutputFormat::Json => {
            let output = serde_json::json!({
                "passed": report.passed(),
                "failed": report.failed(),
                "skipped": report.skipped(),
                "elapsed": report.elapsed.as_secs_f64(),
                "root": ctx.root(),
                "results": report.outcomes,
            });
            match serde_json::to_string_pretty(&output) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing results: {e}");
                    return 1;
                }
            }
        }
        OutputFormat::Junit => print!("{}", format_junit_xml(&report)),
    }

    if report.is_success() { 0 } else { 1 }
}

fn worker(build: &dyn Fn() -> Suite) -> i32 {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("worker: cannot read assignment: {e}");
        return 2;
    }
    let assignment: WorkerAssignment = match serde_json::from_str(&input) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("worker: invalid assignment: {e}");
            return 2;
        }
    };
    init_tracing(assignment.options.verbose);
    let worker = assignment.worker;
    match build().run_worker(assignment) {
        Ok(report) if report.is_success() => 0,
        Ok(_) => 1,
        Err(e) => {
            tracing::error!(worker, error = %e, "worker failed");
            2
        }
    }
}

fn print_human(report: &SuiteReport, verbose: u8) {
    println!();
    for outcome in &report.outcomes {
        match outcome.status {
            Status::Passed => {
                if verbose > 1 {
                    println!("  ✓ {} ({:.2?})", outcome.id, outcome.duration);
                }
            }
            Status::Skipped => {
                let reason = outcome.skip_reason.as_deref().unwrap_or("skipped");
                println!("  - {} skipped: {reason}", outcome.id);
            }
            Status::Failed => {
                println!("  ✗ {} ({:.2?})", outcome.id, outcome.duration);
                if let Some(failure) = &outcome.failure {
                    println!("    {} failure: {}", failure.kind, failure.message);
                    if verbose > 1 {
                        for line in &failure.trace {
                            println!("      {line}");
                        }
                    }
                }
                if let Some(dir) = &outcome.preserved_dir {
                    println!("    preserved: {}", dir.display());
                }
            }
        }
    }
    println!(
        "\n{} passed, {} failed, {} skipped ({:.2?})",
        report.passed(),
        report.failed(),
        report.skipped(),
        report.elapsed
    );
}

/// Format a report as JUnit XML, one `<testsuite>` per test class.
pub fn format_junit_xml(report: &SuiteReport) -> String {
    let mut by_class: BTreeMap<&str, Vec<&TestOutcome>> = BTreeMap::new();
    for outcome in &report.outcomes {
        by_class.entry(&outcome.id.class).or_default().push(outcome);
    }

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        xml,
        "<testsuites tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">",
        report.outcomes.len(),
        report.failed(),
        report.skipped(),
        report.elapsed.as_secs_f64()
    );

    for (class, outcomes) in by_class {
        let failures = outcomes.iter().filter(|o| o.failed()).count();
        let skipped = outcomes
            .iter()
            .filter(|o| o.status == Status::Skipped)
            .count();
        let time: Duration = outcomes.iter().map(|o| o.duration).sum();
        let _ = writeln!(
            xml,
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{failures}\" skipped=\"{skipped}\" time=\"{:.3}\">",
            escape_xml(class),
            outcomes.len(),
            time.as_secs_f64()
        );

        for outcome in outcomes {
            let name = match &outcome.id.scenario {
                Some(s) => format!("{}(scenario {}: {})", outcome.id.method, s.number, s.name),
                None => outcome.id.method.clone(),
            };
            let _ = writeln!(
                xml,
                "    <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\">",
                escape_xml(class),
                escape_xml(&name),
                outcome.duration.as_secs_f64()
            );

            match outcome.status {
                Status::Passed => {}
                Status::Skipped => {
                    let reason = outcome.skip_reason.as_deref().unwrap_or("skipped");
                    let _ = writeln!(xml, "      <skipped message=\"{}\"/>", escape_xml(reason));
                }
                Status::Failed => {
                    let (kind, message, trace) = match &outcome.failure {
                        Some(f) => (f.kind.to_string(), f.message.as_str(), f.trace.as_slice()),
                        None => ("unknown".to_string(), "Test failed", &[][..]),
                    };
                    let _ = writeln!(
                        xml,
                        "      <failure type=\"{}\" message=\"{}\">",
                        escape_xml(&kind),
                        escape_xml(message)
                    );
                    let _ = writeln!(xml, "{}", escape_xml(message));
                    for line in trace {
                        let _ = writeln!(xml, "{}", escape_xml(line));
                    }
                    xml.push_str("      </failure>\n");
                }
            }

            if let Some(dir) = &outcome.preserved_dir {
                let _ = writeln!(
                    xml,
                    "      <system-out>preserved: {}</system-out>",
                    escape_xml(&dir.display().to_string())
                );
            }

            xml.push_str("    </testcase>\n");
        }

        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{FailureInfo, FailureKind, TestId};

    fn report() -> SuiteReport {
        let mut failed = TestOutcome::harness_failure(TestId::new("Txn", "commit"), "a < b", None);
        failed.failure = Some(FailureInfo {
            kind: FailureKind::Assertion,
            message: "expected \"1\"".into(),
            trace: vec!["caused by: x & y".into()],
        });
        failed.preserved_dir = Some(PathBuf::from("/tmp/ENGINE_TEST/Txn.0"));
        SuiteReport {
            outcomes: vec![
                TestOutcome::skipped(TestId::new("Backup", "long"), "slow (enable with --long)", None),
                failed,
            ],
            elapsed: Duration::from_millis(250),
        }
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "enginetest", "run", "-j", "3", "--preserve", "--output", "json", "--dir", "/tmp/x",
            "--worker-timeout", "60",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.parallel, Some(3));
        assert!(args.preserve);
        assert_eq!(args.output, OutputFormat::Json);
        assert_eq!(args.worker_timeout, Some(60));
    }

    #[test]
    fn worker_subcommand_parses() {
        let cli = Cli::try_parse_from(["enginetest", "worker"]).unwrap();
        assert!(matches!(cli.command, Command::Worker));
    }

    #[test]
    fn flags_override_file() {
        let file = HarnessConfig {
            dir: Some(PathBuf::from("/from/file")),
            verbose: Some(2),
            parallel: Some(4),
            conn_config: Some("log=(enabled=false)".into()),
            worker_timeout: Some(10),
            ..HarnessConfig::default()
        };
        let args = RunArgs {
            dir: Some(PathBuf::from("/from/flag")),
            parallel: Some(1),
            output: OutputFormat::Junit,
            ..RunArgs::default()
        };
        let settings = RunSettings::merge(file, &args);
        assert_eq!(settings.options.root, PathBuf::from("/from/flag"));
        assert_eq!(settings.options.verbose, 2);
        assert_eq!(settings.parallel, 1);
        assert!(!settings.options.concurrent);
        assert_eq!(settings.options.conn_config, "log=(enabled=false)");
        assert_eq!(settings.options.console, Console::Stderr);
        assert_eq!(settings.worker_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn parallel_marks_options_concurrent() {
        let args = RunArgs {
            parallel: Some(3),
            ..RunArgs::default()
        };
        let settings = RunSettings::merge(HarnessConfig::default(), &args);
        assert!(settings.options.concurrent);
        assert_eq!(settings.options.console, Console::Stdout);
    }

    #[test]
    fn junit_groups_by_class_and_escapes() {
        let xml = format_junit_xml(&report());
        assert!(xml.contains("<testsuites tests=\"2\" failures=\"1\" skipped=\"1\""));
        assert!(xml.contains("<testsuite name=\"Backup\""));
        assert!(xml.contains("<skipped message=\"slow (enable with --long)\"/>"));
        assert!(xml.contains("<failure type=\"assertion\" message=\"expected &quot;1&quot;\">"));
        assert!(xml.contains("caused by: x &amp; y"));
        assert!(xml.contains("<system-out>preserved: /tmp/ENGINE_TEST/Txn.0</system-out>"));
    }

    #[test]
    fn escape_xml_handles_all_specials() {
        assert_eq!(escape_xml("<a href=\"x\">'&'</a>"), "&lt;a href=&quot;x&quot;&gt;&apos;&amp;&apos;&lt;/a&gt;");
    }
}
