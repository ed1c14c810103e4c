//! Running many tests, in this process or across worker processes.
//!
//! Parallel runs re-execute the harness binary once per worker. Each worker
//! receives a [`WorkerAssignment`] as JSON on stdin, runs its share of the
//! suite, and appends one JSON outcome per line to its own outcomes file. The
//! coordinator merges those back in suite order. A test whose worker died or
//! was killed before reporting is recorded as a harness failure.

use crate::case::{TestBody, TestCase};
use crate::context::{Console, HarnessContext, HarnessOptions};
use crate::engine::Engine;
use crate::error::{HarnessError, Result};
use crate::lifecycle::FixtureConfig;
use crate::outcome::{SuiteReport, TestId, TestOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

/// One registered test.
pub struct Registration {
    id: TestId,
    body: TestBody,
    long: Option<String>,
    fixture: FixtureConfig,
}

impl Registration {
    /// Only run with long tests enabled; `description` explains the skip.
    pub fn long(&mut self, description: impl Into<String>) -> &mut Self {
        self.long = Some(description.into());
        self
    }

    pub fn fixture(&mut self, fixture: FixtureConfig) -> &mut Self {
        self.fixture = fixture;
        self
    }

    pub fn id(&self) -> &TestId {
        &self.id
    }

    pub fn is_long(&self) -> bool {
        self.long.is_some()
    }
}

/// An ordered collection of tests against one engine.
pub struct Suite {
    engine: Rc<dyn Engine>,
    tests: Vec<Registration>,
}

impl Suite {
    pub fn new(engine: Rc<dyn Engine>) -> Self {
        Self {
            engine,
            tests: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        id: TestId,
        body: impl Fn(&mut TestCase<'_>) -> Result<()> + 'static,
    ) -> &mut Registration {
        self.tests.push(Registration {
            id,
            body: Rc::new(body),
            long: None,
            fixture: FixtureConfig::default(),
        });
        let last = self.tests.len() - 1;
        &mut self.tests[last]
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TestId> {
        self.tests.iter().map(|r| &r.id)
    }

    /// Test ids must be unique: they name fixture directories and route
    /// outcomes back from workers.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for reg in &self.tests {
            let shortid = reg.id.shortid();
            if !seen.insert(shortid.clone()) {
                return Err(HarnessError::Config(format!("duplicate test id {shortid}")));
            }
        }
        Ok(())
    }

    /// Keep only tests whose name contains `pattern`.
    pub fn filter(&mut self, pattern: &str) {
        self.tests
            .retain(|r| r.id.to_string().contains(pattern) || r.id.shortid().contains(pattern));
    }

    fn run_one(&self, ctx: &HarnessContext, reg: &Registration) -> TestOutcome {
        if let Some(description) = &reg.long
            && !ctx.options().long
        {
            return TestOutcome::skipped(
                reg.id.clone(),
                format!("{description} (enable with --long)"),
                ctx.options().worker,
            );
        }
        let case = TestCase::new(ctx, Rc::clone(&self.engine), reg.id.clone(), reg.fixture.clone());
        case.run(reg.body.as_ref())
    }

    /// Run every test in order in this process.
    pub fn run_sequential(&self, ctx: &HarnessContext) -> SuiteReport {
        let start = Instant::now();
        let outcomes = self.tests.iter().map(|reg| self.run_one(ctx, reg)).collect();
        SuiteReport {
            outcomes,
            elapsed: start.elapsed(),
        }
    }

    /// Run the named tests, handing each outcome to `sink` as it completes.
    pub fn run_assigned(
        &self,
        ctx: &HarnessContext,
        shortids: &[String],
        mut sink: impl FnMut(&TestOutcome) -> Result<()>,
    ) -> Result<Vec<TestOutcome>> {
        let by_id: HashMap<String, &Registration> =
            self.tests.iter().map(|r| (r.id.shortid(), r)).collect();
        let mut outcomes = Vec::with_capacity(shortids.len());
        for shortid in shortids {
            let outcome = match by_id.get(shortid) {
                Some(reg) => self.run_one(ctx, reg),
                None => TestOutcome::harness_failure(
                    TestId::new("unknown", shortid.as_str()),
                    format!("no test named {shortid} in this suite"),
                    ctx.options().worker,
                ),
            };
            sink(&outcome)?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Entry point of a worker process.
    pub fn run_worker(&self, assignment: WorkerAssignment) -> Result<SuiteReport> {
        let start = Instant::now();
        let ctx = HarnessContext::global_setup(assignment.options)?;
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&assignment.outcomes)?;
        tracing::debug!(worker = assignment.worker, tests = assignment.tests.len(), "worker started");
        let outcomes = self.run_assigned(&ctx, &assignment.tests, |outcome| {
            let line = serde_json::to_string(outcome)
                .map_err(|e| HarnessError::harness(format!("cannot encode outcome: {e}")))?;
            writeln!(out, "{line}")?;
            out.flush()?;
            Ok(())
        })?;
        Ok(SuiteReport {
            outcomes,
            elapsed: start.elapsed(),
        })
    }

    /// Split the suite round-robin across worker processes and merge their
    /// outcomes in suite order.
    pub fn run_parallel(&self, ctx: &HarnessContext, launch: &WorkerLaunch) -> Result<SuiteReport> {
        let start = Instant::now();
        let workers = launch.workers.clamp(1, self.tests.len().max(1));
        let mut running = Vec::with_capacity(workers);
        for k in 0..workers {
            let tests: Vec<String> = self
                .tests
                .iter()
                .skip(k)
                .step_by(workers)
                .map(|r| r.id.shortid())
                .collect();
            let assignment = WorkerAssignment::new(ctx, k, tests);
            match RunningWorker::spawn(launch, assignment) {
                Ok(worker) => running.push(worker),
                Err(e) => {
                    abort_all(&mut running);
                    return Err(e);
                }
            }
        }
        ctx.log(&format!(
            "dispatched {} test(s) to {workers} worker(s)",
            self.tests.len()
        ));

        wait_all(&mut running, launch.timeout);

        let mut reported: HashMap<String, TestOutcome> = HashMap::new();
        for worker in &running {
            let exit = worker.exit.as_ref().map_or("unknown".to_string(), |e| e.to_string());
            ctx.log(&format!("worker {}: {exit}", worker.assignment.worker));
            for outcome in read_outcomes(&worker.assignment.outcomes)? {
                reported.insert(outcome.id.shortid(), outcome);
            }
        }

        let mut outcomes = Vec::with_capacity(self.tests.len());
        for (i, reg) in self.tests.iter().enumerate() {
            let shortid = reg.id.shortid();
            let outcome = reported.remove(&shortid).unwrap_or_else(|| {
                let worker = &running[i % workers];
                let exit = worker.exit.as_ref().map_or("unknown".to_string(), |e| e.to_string());
                TestOutcome::harness_failure(
                    reg.id.clone(),
                    format!(
                        "worker {} did not report this test ({exit})",
                        worker.assignment.worker
                    ),
                    Some(worker.assignment.worker),
                )
            });
            outcomes.push(outcome);
        }
        Ok(SuiteReport {
            outcomes,
            elapsed: start.elapsed(),
        })
    }
}

/// Work sent to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker: usize,
    pub options: HarnessOptions,
    /// Short ids of the tests to run, in order.
    pub tests: Vec<String>,
    /// File the worker appends outcome lines to.
    pub outcomes: PathBuf,
}

impl WorkerAssignment {
    fn new(ctx: &HarnessContext, worker: usize, tests: Vec<String>) -> Self {
        let options = HarnessOptions {
            root: ctx.root().to_path_buf(),
            timestamp: false,
            concurrent: true,
            worker: Some(worker),
            purge_root: false,
            stdout_fd: libc::STDOUT_FILENO,
            stderr_fd: libc::STDERR_FILENO,
            ..ctx.options().clone()
        };
        Self {
            worker,
            options,
            tests,
            outcomes: ctx.root().join(format!("outcomes.w{worker}.jsonl")),
        }
    }
}

/// How to start worker processes.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub workers: usize,
    pub program: PathBuf,
    /// Arguments selecting worker mode.
    pub args: Vec<String>,
    /// Kill workers still running after this long.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
enum WorkerExit {
    Exited(ExitStatus),
    TimedOut(Duration),
    Aborted,
    WaitFailed(String),
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Exited(status) => write!(f, "{status}"),
            WorkerExit::TimedOut(after) => write!(f, "killed after {}s", after.as_secs()),
            WorkerExit::Aborted => write!(f, "killed after a failed launch"),
            WorkerExit::WaitFailed(e) => write!(f, "failed to wait: {e}"),
        }
    }
}

struct RunningWorker {
    assignment: WorkerAssignment,
    child: Child,
    exit: Option<WorkerExit>,
}

impl RunningWorker {
    fn spawn(launch: &WorkerLaunch, assignment: WorkerAssignment) -> Result<Self> {
        if assignment.outcomes.exists() {
            fs::remove_file(&assignment.outcomes)?;
        }
        let stdout = match assignment.options.console {
            Console::Stdout => Stdio::inherit(),
            Console::Stderr | Console::Fd(_) => Stdio::null(),
        };
        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                HarnessError::harness(format!(
                    "cannot start worker {}: {e}",
                    assignment.worker
                ))
            })?;
        if let Err(e) = hand_off(&mut child, &assignment) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        tracing::info!(worker = assignment.worker, tests = assignment.tests.len(), pid = child.id(), "worker started");
        Ok(Self {
            assignment,
            child,
            exit: None,
        })
    }
}

/// Send the assignment and close the worker's stdin.
fn hand_off(child: &mut Child, assignment: &WorkerAssignment) -> Result<()> {
    let payload = serde_json::to_vec(assignment)
        .map_err(|e| HarnessError::harness(format!("cannot encode assignment: {e}")))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| HarnessError::harness("worker stdin is not a pipe"))?;
    stdin.write_all(&payload).map_err(|e| {
        HarnessError::harness(format!(
            "cannot send assignment to worker {}: {e}",
            assignment.worker
        ))
    })
}

/// Kill and reap every worker still running.
fn abort_all(running: &mut [RunningWorker]) {
    for worker in running.iter_mut().filter(|w| w.exit.is_none()) {
        let _ = worker.child.kill();
        let _ = worker.child.wait();
        tracing::warn!(worker = worker.assignment.worker, "worker aborted");
        worker.exit = Some(WorkerExit::Aborted);
    }
}

fn wait_all(running: &mut [RunningWorker], timeout: Option<Duration>) {
    let start = Instant::now();
    loop {
        let mut pending = false;
        for worker in running.iter_mut().filter(|w| w.exit.is_none()) {
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(worker = worker.assignment.worker, %status, "worker exited");
                    worker.exit = Some(WorkerExit::Exited(status));
                }
                Ok(None) => match timeout {
                    Some(limit) if start.elapsed() > limit => {
                        let _ = worker.child.kill();
                        let _ = worker.child.wait();
                        tracing::warn!(worker = worker.assignment.worker, "worker timed out, killed");
                        worker.exit = Some(WorkerExit::TimedOut(limit));
                    }
                    _ => pending = true,
                },
                Err(e) => worker.exit = Some(WorkerExit::WaitFailed(e.to_string())),
            }
        }
        if !pending {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Outcome lines a worker managed to write. A torn final line from a killed
/// worker is ignored.
fn read_outcomes(path: &Path) -> Result<Vec<TestOutcome>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut outcomes = Vec::new();
    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable outcome line"),
        }
    }
    Ok(outcomes)
}
