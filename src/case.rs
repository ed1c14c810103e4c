//! The per-test controller.
//!
//! A [`TestCase`] walks one test through
//! `NotStarted → SettingUp → Running → TearingDown → Finished`. Setup
//! failures skip straight to teardown, and teardown always runs. It closes
//! the engine, releases the captured descriptors, checks for stray output
//! (passing tests only), returns to the original directory and applies the
//! retention policy.

use crate::backup::{self, BackupPair, CopyMode};
use crate::capture::CapturedChannel;
use crate::context::{self, HarnessContext};
use crate::engine::{Connection, Engine, Session};
use crate::error::{HarnessError, Result};
use crate::fixture::FixtureDir;
use crate::lifecycle::{EngineHandle, FixtureConfig};
use crate::outcome::{FailureInfo, FailureKind, Status, TestId, TestOutcome};
use regex::Regex;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Once;
use std::time::Instant;

/// A test body. It receives the controller for engine access and helpers.
pub type TestBody = Rc<dyn Fn(&mut TestCase<'_>) -> Result<()>>;

/// Lines of backtrace kept in a panic trace.
const MAX_BACKTRACE_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    NotStarted,
    SettingUp,
    Running,
    TearingDown,
    Finished(Status),
}

/// How the body (or setup) ended, before teardown has its say.
#[derive(Debug)]
enum Verdict {
    Pass,
    Skip(String),
    Fail(FailureInfo),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Expect<'a> {
    Exact(&'a str),
    Pattern(&'a str),
}

struct PanicReport {
    location: Option<String>,
    backtrace: String,
}

thread_local! {
    static PANIC_REPORT: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
    static CATCHING: Cell<bool> = const { Cell::new(false) };
}

static PANIC_HOOK: Once = Once::new();

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Install, once per process, a hook that records panics on threads inside
/// [`catch_panic`] and hands every other panic to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !CATCHING.with(Cell::get) {
                previous(info);
                return;
            }
            let report = PanicReport {
                location: info.location().map(|l| l.to_string()),
                backtrace: Backtrace::force_capture().to_string(),
            };
            PANIC_REPORT.with(|slot| *slot.borrow_mut() = Some(report));
        }));
    });
}

/// Run `f`, turning a panic into a failure that records where it happened.
fn catch_panic<R>(f: impl FnOnce() -> R) -> std::result::Result<R, FailureInfo> {
    install_panic_hook();
    let outer = CATCHING.with(|c| c.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CATCHING.with(|c| c.set(outer));

    result.map_err(|payload| {
        let mut info = FailureInfo::new(
            FailureKind::Panic,
            format!("panicked: {}", panic_message(payload.as_ref())),
        );
        if let Some(report) = PANIC_REPORT.with(|slot| slot.borrow_mut().take()) {
            if let Some(location) = report.location {
                info.trace.push(format!("at {location}"));
            }
            info.trace.extend(
                report
                    .backtrace
                    .lines()
                    .take(MAX_BACKTRACE_LINES)
                    .map(String::from),
            );
        }
        info
    })
}

/// `/pat/` names a pattern; anything else is matched verbatim.
fn slash_pattern(message: &str) -> Option<&str> {
    message
        .strip_prefix('/')
        .and_then(|m| m.strip_suffix('/'))
        .filter(|_| message.len() > 2)
}

fn message_matches(text: &str, message: &str) -> Result<bool> {
    match slash_pattern(message) {
        Some(pattern) => {
            let re = Regex::new(pattern).map_err(|source| HarnessError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
            Ok(re.is_match(text))
        }
        None => Ok(text == message),
    }
}

/// Controller and test-author handle for one test.
pub struct TestCase<'h> {
    ctx: &'h HarnessContext,
    id: TestId,
    shortid: String,
    state: CaseState,
    testdir: PathBuf,
    fixture: Option<FixtureDir>,
    stdout: Option<CapturedChannel>,
    stderr: Option<CapturedChannel>,
    engine: EngineHandle,
}

impl<'h> TestCase<'h> {
    pub fn new(
        ctx: &'h HarnessContext,
        engine: Rc<dyn Engine>,
        id: TestId,
        mut fixture: FixtureConfig,
    ) -> Self {
        let shortid = id.shortid();
        let global = &ctx.options().conn_config;
        if !global.is_empty() {
            fixture.conn_config = if fixture.conn_config.is_empty() {
                global.clone()
            } else {
                format!("{global},{}", fixture.conn_config)
            };
        }
        Self {
            ctx,
            engine: EngineHandle::new(engine, shortid.clone(), fixture),
            id,
            shortid,
            state: CaseState::NotStarted,
            testdir: PathBuf::new(),
            fixture: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Set up, run `body`, tear down, and report.
    pub fn run(mut self, body: &dyn Fn(&mut TestCase<'_>) -> Result<()>) -> TestOutcome {
        let start = Instant::now();
        let verdict = match self.set_up() {
            Err((kind, e)) => {
                self.pr(&format!("setup failed ({kind}): {e}"));
                Verdict::Fail(FailureInfo::from_error(kind, &e))
            }
            Ok(()) => {
                self.state = CaseState::Running;
                match catch_panic(|| body(&mut self)) {
                    Ok(Ok(())) => Verdict::Pass,
                    Ok(Err(HarnessError::Skip(reason))) => Verdict::Skip(reason),
                    Ok(Err(e)) => Verdict::Fail(FailureInfo::from_error(FailureKind::of(&e), &e)),
                    Err(info) => Verdict::Fail(info),
                }
            }
        };
        self.tear_down(verdict, start)
    }

    /// Allocate the fixture directory, capture output and open the engine.
    /// Failures in the first two steps are the harness's own and are
    /// classified apart from an engine that would not open.
    fn set_up(&mut self) -> std::result::Result<(), (FailureKind, HarnessError)> {
        self.state = CaseState::SettingUp;
        let subdir = self.ctx.next_test_subdir(&self.id.class, &self.shortid);
        self.testdir = self.ctx.root().join(subdir);
        if self.ctx.verbosity() > 2 {
            self.prhead(&format!("started in {}", self.testdir.display()), true);
        }
        tracing::debug!(test = %self.id, dir = %self.testdir.display(), "setting up");

        let harness = |e| (FailureKind::Harness, e);
        self.set_up_fixture().map_err(harness)?;
        self.set_up_capture().map_err(harness)?;
        self.set_up_engine().map_err(|e| {
            let kind = match &e {
                HarnessError::Engine { .. } | HarnessError::Io(_) => FailureKind::Setup,
                other => FailureKind::of(other),
            };
            (kind, e)
        })
    }

    fn set_up_fixture(&mut self) -> Result<()> {
        let fixture = self.fixture.insert(FixtureDir::create(self.testdir.clone())?);
        fixture.enter()
    }

    fn set_up_capture(&mut self) -> Result<()> {
        let options = self.ctx.options();
        let stdout = self.stdout.insert(CapturedChannel::new(
            options.stdout_fd,
            self.testdir.join("stdout.txt"),
            "standard output",
        ));
        stdout.capture()?;
        let stderr = self.stderr.insert(CapturedChannel::new(
            options.stderr_fd,
            self.testdir.join("stderr.txt"),
            "error output",
        ));
        stderr.capture()
    }

    fn set_up_engine(&mut self) -> Result<()> {
        self.engine.open(Path::new("."))?;
        let conn = format!("{:?}", self.engine.conn()?);
        self.pr(&conn);
        Ok(())
    }

    fn tear_down(mut self, mut verdict: Verdict, start: Instant) -> TestOutcome {
        self.state = CaseState::TearingDown;
        self.pr("finishing");

        if let Err(e) = self.engine.close() {
            tracing::warn!(test = %self.id, error = %e, "closing connection during teardown");
            self.pr(&format!("error closing connection: {e}"));
        }

        for channel in [self.stdout.as_mut(), self.stderr.as_mut()].into_iter().flatten() {
            if let Err(e) = channel.release() {
                Self::secondary(&mut verdict, FailureKind::Harness, &e);
            }
        }
        if matches!(verdict, Verdict::Pass) {
            let checked = self
                .stdout
                .iter_mut()
                .chain(self.stderr.iter_mut())
                .try_for_each(|channel| channel.check_quiescent(self.ctx));
            if let Err(e) = checked {
                verdict = Verdict::Fail(FailureInfo::from_error(FailureKind::Assertion, &e));
            }
        }

        if let Some(fixture) = self.fixture.as_mut()
            && let Err(e) = fixture.restore()
        {
            Self::secondary(&mut verdict, FailureKind::Harness, &e);
        }

        let failed = matches!(verdict, Verdict::Fail(_));
        let mut preserved_dir = None;
        if failed || self.ctx.options().preserve {
            if self.fixture.is_some() {
                self.pr(&format!("preserving directory {}", self.testdir.display()));
                preserved_dir = Some(self.testdir.clone());
            }
        } else if let Some(fixture) = self.fixture.take()
            && let Err(e) = fixture.remove()
        {
            tracing::warn!(test = %self.id, error = %e, "removing fixture directory");
        }

        let elapsed = start.elapsed();
        let (status, failure, skip_reason) = match verdict {
            Verdict::Pass => (Status::Passed, None, None),
            Verdict::Skip(reason) => (Status::Skipped, None, Some(reason)),
            Verdict::Fail(info) => (Status::Failed, Some(info), None),
        };

        if let Some(info) = &failure {
            self.ctx.prout(&format!("ERROR in {}", self.id));
            if let Some(dir) = &preserved_dir {
                self.ctx
                    .prout(&format!("    preserving directory {}", dir.display()));
            }
            self.pr("FAIL");
            self.ctx.log("");
            self.ctx.log(&format!("{} failure: {}", info.kind, info.message));
            for line in &info.trace {
                self.ctx.log(&format!("    {line}"));
            }
            self.ctx.log("");
        }
        self.pr(&format!("{status:?} in {:.3}s", elapsed.as_secs_f64()).to_lowercase());
        tracing::info!(test = %self.id, ?status, elapsed_ms = elapsed.as_millis() as u64, "test finished");
        if self.ctx.verbosity() > 2 {
            self.prhead("TEST COMPLETED", false);
        }
        self.state = CaseState::Finished(status);

        TestOutcome {
            id: self.id.clone(),
            status,
            failure,
            skip_reason,
            preserved_dir,
            duration: elapsed,
            worker: self.ctx.options().worker,
        }
    }

    /// A teardown error replaces a pass but never a recorded failure.
    fn secondary(verdict: &mut Verdict, kind: FailureKind, err: &HarnessError) {
        match verdict {
            Verdict::Fail(_) => tracing::warn!(error = %err, "teardown error after failure"),
            _ => *verdict = Verdict::Fail(FailureInfo::from_error(kind, err)),
        }
    }

    pub fn id(&self) -> &TestId {
        &self.id
    }

    pub fn shortid(&self) -> &str {
        &self.shortid
    }

    pub fn state(&self) -> CaseState {
        self.state
    }

    pub fn ctx(&self) -> &'h HarnessContext {
        self.ctx
    }

    /// Absolute path of this test's fixture directory.
    pub fn testdir(&self) -> &Path {
        &self.testdir
    }

    pub fn conn(&self) -> Result<&dyn Connection> {
        self.engine.conn()
    }

    pub fn session(&mut self) -> Result<&mut dyn Session> {
        self.engine.session()
    }

    // ==================== Connection lifecycle ====================

    /// Open the connection on the fixture directory if it is closed.
    pub fn open_conn(&mut self) -> Result<()> {
        self.engine.open(Path::new("."))
    }

    pub fn close_conn(&mut self) -> Result<()> {
        self.engine.close()
    }

    pub fn reopen_conn(&mut self) -> Result<()> {
        self.engine.reopen()
    }

    /// Open an extra connection on `dir` the way setup opens the main one.
    pub fn setup_connection_open(&self, dir: &Path) -> Result<Box<dyn Connection>> {
        let conn = self.engine.open_connection(dir)?;
        self.pr(&format!("{conn:?}"));
        Ok(conn)
    }

    pub fn setup_session_open(&self, conn: &dyn Connection) -> Result<Box<dyn Session>> {
        self.engine.open_session_on(conn)
    }

    // ==================== Output expectations ====================

    fn channel(&mut self, stream: Stream) -> Result<&mut CapturedChannel> {
        let channel = match stream {
            Stream::Stdout => self.stdout.as_mut(),
            Stream::Stderr => self.stderr.as_mut(),
        };
        channel.ok_or_else(|| HarnessError::harness("output is not being captured"))
    }

    fn expect_output<T>(
        &mut self,
        stream: Stream,
        expect: Expect<'_>,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let ctx = self.ctx;
        self.channel(stream)?.check_quiescent(ctx)?;
        let value = body(self)?;
        let channel = self.channel(stream)?;
        match expect {
            Expect::Exact(text) => channel.check_additional(text)?,
            Expect::Pattern(pattern) => channel.check_additional_pattern(pattern)?,
        }
        Ok(value)
    }

    /// Run `body`, then require exactly `expect` on standard output.
    pub fn expected_stdout<T>(
        &mut self,
        expect: &str,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.expect_output(Stream::Stdout, Expect::Exact(expect), body)
    }

    pub fn expected_stderr<T>(
        &mut self,
        expect: &str,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.expect_output(Stream::Stderr, Expect::Exact(expect), body)
    }

    pub fn expected_stdout_pattern<T>(
        &mut self,
        pattern: &str,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.expect_output(Stream::Stdout, Expect::Pattern(pattern), body)
    }

    pub fn expected_stderr_pattern<T>(
        &mut self,
        pattern: &str,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.expect_output(Stream::Stderr, Expect::Pattern(pattern), body)
    }

    /// Require `op` to fail with an engine error that prints `message` on
    /// error output. `/pat/` means the pattern must appear somewhere in the
    /// output; anything else must match verbatim. Returns the error.
    pub fn assert_raises_with_message<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T>,
        message: &str,
    ) -> Result<HarnessError> {
        let raised = |t: &mut Self| match op(t) {
            Ok(_) => Err(HarnessError::assertion(
                "expected an engine error, but the operation succeeded",
            )),
            Err(e @ HarnessError::Engine { .. }) => Ok(e),
            Err(other) => Err(other),
        };
        match slash_pattern(message) {
            Some(pattern) => self.expected_stderr_pattern(pattern, raised),
            None => self.expected_stderr(message, raised),
        }
    }

    /// Require `op` to fail with an engine error whose own message matches
    /// `message` (`/pat/` for a pattern). Error output is not consulted.
    pub fn assert_raises_having_message<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T>,
        message: &str,
    ) -> Result<HarnessError> {
        let err = match op(self) {
            Ok(_) => {
                return Err(HarnessError::assertion(
                    "expected an engine error, but the operation succeeded",
                ));
            }
            Err(e) => e,
        };
        let text = match &err {
            HarnessError::Engine { error, .. } => Some(error.to_string()),
            _ => None,
        };
        let Some(text) = text else {
            return Err(err);
        };
        if !message_matches(&text, message)? {
            return Err(HarnessError::assertion(format!(
                "expected engine error \"{message}\", but got \"{text}\""
            )));
        }
        Ok(err)
    }

    /// Run `op`, writing the message of any engine error it raises to error
    /// output instead of failing. Returns `None` when it raised.
    pub fn error_to_stderr<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Option<T>> {
        match op(self) {
            Ok(value) => Ok(Some(value)),
            Err(HarnessError::Engine { error, .. }) => {
                let mut stderr = context::dup_descriptor(self.ctx.options().stderr_fd)?;
                writeln!(stderr, "{error}")?;
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    // ==================== Backups ====================

    /// Copy the home through a backup cursor on the default session.
    pub fn backup(&mut self, dest: &Path) -> Result<Vec<String>> {
        let home = self.engine.home().to_path_buf();
        let session = self.engine.session()?;
        backup::backup(session, &home, dest)
    }

    /// Like [`backup`](Self::backup), on a session of the caller's choosing.
    pub fn backup_from(&self, session: &mut dyn Session, dest: &Path) -> Result<Vec<String>> {
        backup::backup(session, self.engine.home(), dest)
    }

    /// Checkpoint, copy `olddir` to `newdir` under a backup cursor, and open
    /// the copy. The caller owns the returned connection and session.
    pub fn manual_backup(
        &mut self,
        olddir: &Path,
        newdir: &Path,
        mode: CopyMode,
    ) -> Result<(Box<dyn Connection>, Box<dyn Session>)> {
        let session = self.engine.session()?;
        session.checkpoint()?;
        let mut pair = BackupPair::begin(session, olddir, newdir)?;
        pair.copy_all(mode)?;
        let copied = pair.release()?;
        self.pr(&format!(
            "backed up {} file(s) to {} ({mode:?})",
            copied.len(),
            newdir.display()
        ));

        let mut conn = self.setup_connection_open(newdir)?;
        match self.setup_session_open(conn.as_ref()) {
            Ok(session) => Ok((conn, session)),
            Err(e) => {
                let _ = conn.close();
                Err(e)
            }
        }
    }

    /// Simulate a crash with a live backup and check `uri` survives recovery.
    pub fn check_manual_backup(
        &mut self,
        olddir: &Path,
        newdir: &Path,
        uri: &str,
        mode: CopyMode,
    ) -> Result<()> {
        let (mut conn, mut session) = self.manual_backup(olddir, newdir, mode)?;
        let verified = session.verify(uri);
        drop(session);
        conn.close()?;
        verified?;
        Ok(())
    }

    /// Copy a home wholesale without a backup cursor, alternating copy modes
    /// across the process.
    pub fn copy_home(&self, src: &Path, dest: &Path) -> Result<Vec<String>> {
        let mode = self.ctx.next_copy_mode();
        backup::copy_home(src, dest, mode)
    }

    // ==================== Notices and logging ====================

    /// Skip this test, noting the known failure once per process.
    pub fn known_failure(&self, name: &str) -> Result<()> {
        self.ctx.print_once(&format!(
            "**** {} HAS A KNOWN FAILURE: {name} ****",
            self.id.simple_name()
        ));
        Err(HarnessError::Skip(format!("KNOWN FAILURE: {name}")))
    }

    /// Note a known limitation once per process and carry on.
    pub fn known_limitation(&self, name: &str) {
        self.ctx.print_once(&format!(
            "**** {} HAS A KNOWN LIMITATION: {name} ****",
            self.id.simple_name()
        ));
    }

    /// Progress line in the results log.
    pub fn pr(&self, msg: &str) {
        self.ctx.log(&format!("    {}: {msg}", self.shortid));
    }

    /// Header line on the console.
    pub fn prhead(&self, msg: &str, blank_before: bool) {
        let lead = if blank_before { "\n" } else { "" };
        self.ctx.prout(&format!("{lead}  {}: {msg}", self.shortid));
    }

    pub fn prout(&self, msg: &str) {
        self.ctx.prout(msg);
    }

    pub fn tty(&self, msg: &str) {
        self.ctx.tty(msg);
    }

    /// [`tty`](Self::tty), only at verbosity `level` or above.
    pub fn tty_verbose(&self, level: u8, msg: &str) {
        if level <= self.ctx.verbosity() {
            self.ctx.tty(msg);
        }
    }

    pub fn verbose(&self, level: u8, msg: &str) {
        self.ctx.print_verbose(level, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::private_options;
    use crate::context::HarnessOptions;
    use crate::engine::Item;
    use crate::sqlite::SqliteEngine;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use std::os::fd::RawFd;
    use tempfile::TempDir;

    fn write_fd(fd: RawFd, bytes: &[u8]) {
        // SAFETY: the descriptor is open for the test's lifetime.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn setup(options: impl FnOnce(&mut HarnessOptions)) -> (TempDir, HarnessContext) {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = private_options(&dir);
        options(&mut opts);
        let ctx = HarnessContext::global_setup(opts).unwrap();
        (dir, ctx)
    }

    fn run(
        ctx: &HarnessContext,
        method: &str,
        fixture: FixtureConfig,
        body: impl Fn(&mut TestCase<'_>) -> Result<()>,
    ) -> TestOutcome {
        let case = TestCase::new(
            ctx,
            Rc::new(SqliteEngine::new()),
            TestId::new("Case", method),
            fixture,
        );
        case.run(&body)
    }

    fn stdout_fd(t: &TestCase<'_>) -> RawFd {
        t.ctx().options().stdout_fd
    }

    // ==================== Lifecycle ====================

    #[test]
    #[serial]
    fn passing_test_cleans_up() {
        let (_dir, ctx) = setup(|_| {});
        let before = env::current_dir().unwrap();
        let outcome = run(&ctx, "pass", FixtureConfig::new(), |t| {
            assert_eq!(t.state(), CaseState::Running);
            assert!(t.conn().is_ok());
            t.session()?.create("table:t", "")?;
            Ok(())
        });
        assert!(outcome.passed(), "{outcome:?}");
        assert!(outcome.preserved_dir.is_none());
        assert_eq!(env::current_dir().unwrap(), before);
        assert!(!ctx.root().join("Case.0").exists());

        let log = fs::read_to_string(ctx.results_path()).unwrap();
        assert!(log.contains("    Case.pass: finishing"));
        assert!(log.contains("    Case.pass: passed in "));
    }

    #[test]
    #[serial]
    fn stray_output_fails_a_passing_test() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "noisy", FixtureConfig::new(), |t| {
            write_fd(stdout_fd(t), b"stray\n");
            Ok(())
        });
        assert!(outcome.failed());
        let failure = outcome.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Assertion);
        assert!(failure.message.contains("unexpected standard output"));

        let dir = outcome.preserved_dir.as_ref().unwrap();
        assert_eq!(fs::read_to_string(dir.join("stdout.txt")).unwrap(), "stray\n");
    }

    #[test]
    #[serial]
    fn expected_stdout_accounts_for_output() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "hello", FixtureConfig::new(), |t| {
            t.expected_stdout("hello", |t| {
                write_fd(stdout_fd(t), b"hello");
                Ok(())
            })?;
            t.expected_stdout_pattern("^wor", |t| {
                write_fd(stdout_fd(t), b"world\n");
                Ok(())
            })
        });
        assert!(outcome.passed(), "{outcome:?}");
    }

    #[test]
    #[serial]
    fn second_check_without_output_fails() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "twice", FixtureConfig::new(), |t| {
            write_fd(stdout_fd(t), b"hello");
            let channel = t.channel(Stream::Stdout)?;
            channel.check_additional("hello")?;
            channel.check_additional("hello")
        });
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Assertion);
        assert_eq!(
            failure.message,
            "in standard output, expected \"hello\", but got \"\""
        );
    }

    #[test]
    #[serial]
    fn engine_error_is_classified() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "engine", FixtureConfig::new(), |t| {
            t.session()?.open_cursor("table:missing")?;
            Ok(())
        });
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::Engine);
    }

    #[test]
    #[serial]
    fn panic_is_caught_with_location() {
        let (_dir, ctx) = setup(|_| {});
        let before = env::current_dir().unwrap();
        let outcome = run(&ctx, "panics", FixtureConfig::new(), |_| {
            panic!("boom {}", 42);
        });
        assert_eq!(env::current_dir().unwrap(), before);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Panic);
        assert_eq!(failure.message, "panicked: boom 42");
        assert!(failure.trace[0].starts_with("at "));
        assert!(failure.trace[0].contains("case.rs"));
    }

    #[test]
    #[serial]
    fn known_failure_skips_and_cleans_up() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "known", FixtureConfig::new(), |t| {
            t.known_limitation("slow checkpoints");
            t.known_failure("issue 14")
        });
        assert_eq!(outcome.status, Status::Skipped);
        assert_eq!(outcome.skip_reason.as_deref(), Some("KNOWN FAILURE: issue 14"));
        assert!(outcome.preserved_dir.is_none());
    }

    #[test]
    #[serial]
    fn preserve_keeps_passing_directories() {
        let (_dir, ctx) = setup(|o| o.preserve = true);
        let outcome = run(&ctx, "kept", FixtureConfig::new(), |_| Ok(()));
        assert!(outcome.passed());
        assert!(outcome.preserved_dir.unwrap().join("stdout.txt").exists());
    }

    #[test]
    #[serial]
    fn setup_failure_still_tears_down() {
        let (_dir, ctx) = setup(|_| {});
        let before = env::current_dir().unwrap();
        let fixture = FixtureConfig::new().connection_open(|req| req.open_with("create,bogus"));
        let outcome = run(&ctx, "badopen", fixture, |_| {
            panic!("body must not run");
        });
        assert_eq!(env::current_dir().unwrap(), before);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Setup);
        assert!(failure.message.contains("bogus"));
    }

    #[test]
    #[serial]
    fn fixture_collision_is_a_harness_defect() {
        let (_dir, ctx) = setup(|_| {});
        fs::write(ctx.root().join("Case.0"), "squatter").unwrap();
        let before = env::current_dir().unwrap();
        let outcome = run(&ctx, "squatted", FixtureConfig::new(), |_| {
            panic!("body must not run");
        });
        assert_eq!(env::current_dir().unwrap(), before);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Harness);
        assert!(failure.message.contains("cannot remove directory"));
        assert!(outcome.preserved_dir.is_none());
        assert_eq!(
            fs::read_to_string(ctx.root().join("Case.0")).unwrap(),
            "squatter"
        );
        let log = fs::read_to_string(ctx.results_path()).unwrap();
        assert!(log.contains("setup failed (harness)"));
        assert!(!log.contains("preserving directory"));
    }

    #[test]
    #[serial]
    fn body_failure_records_raise_site() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "located", FixtureConfig::new(), |t| {
            t.session()?.open_cursor("table:missing")?;
            Ok(())
        });
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Engine);
        assert!(failure.trace[0].starts_with("at "), "{:?}", failure.trace);
        assert!(failure.trace[0].contains("case.rs"));

        let log = fs::read_to_string(ctx.results_path()).unwrap();
        assert!(log.contains(&format!("    {}", failure.trace[0])));
    }

    #[test]
    #[serial]
    fn failure_logs_preserved_directory_once() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "fails", FixtureConfig::new(), |_| {
            Err(HarnessError::assertion("nope"))
        });
        assert!(outcome.preserved_dir.is_some());
        let log = fs::read_to_string(ctx.results_path()).unwrap();
        assert_eq!(log.matches("preserving directory").count(), 1, "{log}");
    }

    // ==================== Raised errors ====================

    #[test]
    #[serial]
    fn raised_message_matches_error_text() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "having", FixtureConfig::new(), |t| {
            let err = t.assert_raises_having_message(
                |t| Ok(t.session()?.open_cursor("table:missing")?),
                "/no such object/",
            )?;
            assert!(matches!(err, HarnessError::Engine { .. }));
            t.assert_raises_having_message(
                |t| Ok(t.session()?.create("table:bad-name", "")?),
                "invalid table name \"bad-name\"",
            )?;

            let wrong = t.assert_raises_having_message(
                |t| Ok(t.session()?.open_cursor("table:missing")?),
                "something else",
            );
            assert!(matches!(wrong, Err(HarnessError::Assertion { .. })));
            let succeeded = t.assert_raises_having_message(|_| Ok(()), "x");
            assert!(matches!(succeeded, Err(HarnessError::Assertion { .. })));
            Ok(())
        });
        assert!(outcome.passed(), "{outcome:?}");
    }

    #[test]
    #[serial]
    fn engine_error_can_be_sent_to_error_output() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "tostderr", FixtureConfig::new(), |t| {
            let opened = t.expected_stderr("table:missing: no such object\n", |t| {
                t.error_to_stderr(|t| Ok(t.session()?.open_cursor("table:missing")?))
            })?;
            assert!(opened.is_none());
            let created = t.error_to_stderr(|t| Ok(t.session()?.create("table:t", "")?))?;
            assert!(created.is_some());
            Ok(())
        });
        assert!(outcome.passed(), "{outcome:?}");
    }

    #[test]
    #[serial]
    fn tty_verbose_respects_verbosity() {
        let (dir, ctx) = setup(|o| o.verbose = 1);
        let outcome = run(&ctx, "quiet", FixtureConfig::new(), |t| {
            t.tty_verbose(3, "too detailed");
            Ok(())
        });
        assert!(outcome.passed(), "{outcome:?}");
        let console = fs::read_to_string(dir.path().join("fake-console")).unwrap();
        assert!(!console.contains("too detailed"));
    }

    #[test]
    fn panics_on_other_threads_are_not_swallowed() {
        let recorded_elsewhere = catch_panic(|| {
            std::thread::spawn(|| {
                let caught = panic::catch_unwind(|| panic!("elsewhere"));
                caught.is_err() && PANIC_REPORT.with(|slot| slot.borrow().is_some())
            })
            .join()
            .unwrap()
        });
        assert!(!recorded_elsewhere.unwrap());

        let again = catch_panic(|| panic!("again")).unwrap_err();
        assert!(again.trace[0].starts_with("at "));
    }

    // ==================== Backups ====================

    #[test]
    #[serial]
    fn manual_backup_verifies_in_copy() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "backup", FixtureConfig::new(), |t| {
            let uri = "table:backup";
            t.session()?.create(uri, "key_format=i,value_format=i")?;
            for i in 0..12 {
                let mut c = t.session()?.open_cursor(uri)?;
                c.set_key(Item::Int(i));
                c.set_value(Item::Int(i));
                c.insert()?;
                c.close()?;
                if i % 4 == 0 {
                    let mode = CopyMode::for_iteration(i as u64, 4);
                    t.check_manual_backup(Path::new("."), Path::new("RESTART"), uri, mode)?;
                }
            }
            Ok(())
        });
        assert!(outcome.passed(), "{outcome:?}");
    }

    #[test]
    #[serial]
    fn reopen_and_copy_home() {
        let (_dir, ctx) = setup(|_| {});
        let outcome = run(&ctx, "copy", FixtureConfig::new(), |t| {
            t.session()?.create("table:t", "")?;
            t.reopen_conn()?;
            let names = t.copy_home(Path::new("."), Path::new("COPY"))?;
            if !names.iter().any(|n| n == "stdout.txt") {
                return Err(HarnessError::assertion("fixture files missing from copy"));
            }
            t.close_conn()?;
            t.open_conn()?;
            t.session()?.verify("table:t")?;
            Ok(())
        });
        assert!(outcome.passed(), "{outcome:?}");
    }
}
