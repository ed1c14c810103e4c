//! Process-wide harness state.
//!
//! One [`HarnessContext`] exists per process (the coordinator, or each worker).
//! It owns the suite root, the results log, a saved copy of the console
//! descriptor taken before any capture, and the counters that keep fixture
//! directory names unique.

use crate::backup::CopyMode;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

/// Default suite root, relative to the working directory.
pub const DEFAULT_ROOT: &str = "ENGINE_TEST";

/// Which original descriptor console output goes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Console {
    #[default]
    Stdout,
    /// Used when stdout carries a machine-readable report.
    Stderr,
    /// Any other open descriptor.
    Fd(RawFd),
}

/// Options fixed for the lifetime of a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessOptions {
    /// Suite root directory.
    pub root: PathBuf,
    /// Append `.%Y%m%d-%H%M%S` to the root.
    pub timestamp: bool,
    /// Keep fixture directories of passing tests.
    pub preserve: bool,
    pub verbose: u8,
    /// Run tests registered as long.
    pub long: bool,
    /// Prepended to every test's own connection configuration.
    #[serde(default)]
    pub conn_config: String,
    /// Tests run in several processes at once.
    pub concurrent: bool,
    /// Worker index when this process is a worker.
    pub worker: Option<usize>,
    /// Remove and recreate the root at global setup. Workers reuse the
    /// coordinator's root.
    pub purge_root: bool,
    /// Descriptor captured as the test's standard output.
    pub stdout_fd: RawFd,
    /// Descriptor captured as the test's error output.
    pub stderr_fd: RawFd,
    pub console: Console,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            timestamp: false,
            preserve: false,
            verbose: 1,
            long: false,
            conn_config: String::new(),
            concurrent: false,
            worker: None,
            purge_root: true,
            stdout_fd: libc::STDOUT_FILENO,
            stderr_fd: libc::STDERR_FILENO,
            console: Console::Stdout,
        }
    }
}

impl HarnessOptions {
    /// The root directory after applying the timestamp suffix, made absolute
    /// so that tests changing directory cannot lose it.
    pub fn resolve_root(&self) -> Result<PathBuf> {
        let mut root = self.root.clone().into_os_string();
        if self.timestamp {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            root.push(format!(".{stamp}"));
        }
        let root = PathBuf::from(root);
        if root.is_absolute() {
            Ok(root)
        } else {
            Ok(std::env::current_dir()?.join(root))
        }
    }

    fn console_fd(&self) -> RawFd {
        match self.console {
            Console::Stdout => libc::STDOUT_FILENO,
            Console::Stderr => libc::STDERR_FILENO,
            Console::Fd(fd) => fd,
        }
    }
}

/// Name of the results log for a process.
pub fn results_file_name(worker: Option<usize>) -> String {
    match worker {
        Some(k) => format!("results.w{k}.txt"),
        None => "results.txt".to_string(),
    }
}

/// Duplicate a descriptor into a `File` that survives later redirection of
/// the original.
pub fn dup_descriptor(fd: RawFd) -> std::io::Result<File> {
    // SAFETY: the caller names a descriptor that is open for the whole process.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    Ok(File::from(borrowed.try_clone_to_owned()?))
}

/// Per-process harness state shared by every test controller.
pub struct HarnessContext {
    options: HarnessOptions,
    root: PathBuf,
    console: RefCell<File>,
    results: RefCell<File>,
    results_path: PathBuf,
    class_counters: RefCell<HashMap<String, usize>>,
    printed_once: RefCell<HashSet<String>>,
    copy_counter: Cell<u64>,
    tty: RefCell<Option<File>>,
}

impl HarnessContext {
    /// Prepare the suite root and results log and save the console descriptor.
    pub fn global_setup(mut options: HarnessOptions) -> Result<Self> {
        let root = options.resolve_root()?;
        if options.purge_root && root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        // Later processes sharing these options must land in the same root.
        options.root = root.clone();
        options.timestamp = false;

        let console = dup_descriptor(options.console_fd())?;
        let results_path = root.join(results_file_name(options.worker));
        let mut results = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&results_path)?;
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        match options.worker {
            Some(k) => writeln!(results, "== worker {k} started {stamp} ==")?,
            None => writeln!(results, "== run started {stamp} ==")?,
        }
        tracing::debug!(root = %root.display(), worker = ?options.worker, "global setup");

        Ok(Self {
            options,
            root,
            console: RefCell::new(console),
            results: RefCell::new(results),
            results_path,
            class_counters: RefCell::new(HashMap::new()),
            printed_once: RefCell::new(HashSet::new()),
            copy_counter: Cell::new(0),
            tty: RefCell::new(None),
        })
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Absolute suite root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_path(&self) -> &Path {
        &self.results_path
    }

    pub fn is_concurrent(&self) -> bool {
        self.options.concurrent
    }

    pub fn verbosity(&self) -> u8 {
        self.options.verbose
    }

    /// Append a line to the results log.
    pub fn log(&self, line: &str) {
        let mut results = self.results.borrow_mut();
        if let Err(e) = writeln!(results, "{line}") {
            tracing::warn!(error = %e, "cannot write results log");
        }
    }

    /// Write a line to the saved console descriptor, bypassing capture.
    pub fn prout(&self, line: &str) {
        let mut console = self.console.borrow_mut();
        if let Err(e) = console.write_all(format!("{line}\n").as_bytes()) {
            tracing::warn!(error = %e, "cannot write console");
        }
    }

    /// Print a console line the first time it is seen in this process.
    pub fn print_once(&self, line: &str) {
        if self.printed_once.borrow_mut().insert(line.to_string()) {
            self.prout(line);
        }
    }

    pub fn print_verbose(&self, level: u8, line: &str) {
        if level <= self.options.verbose {
            self.prout(line);
        }
    }

    /// Write straight to the controlling terminal, or the console when there
    /// is none.
    pub fn tty(&self, line: &str) {
        let mut tty = self.tty.borrow_mut();
        if tty.is_none() {
            *tty = OpenOptions::new().write(true).open("/dev/tty").ok();
        }
        if let Some(terminal) = tty.as_mut() {
            let _ = terminal.write_all(format!("{line}\n").as_bytes());
            return;
        }
        drop(tty);
        self.prout(line);
    }

    /// Allocate the next fixture directory name for a test.
    ///
    /// Sequential runs use `<class>.<n>`. Concurrent runs add the test id and
    /// worker token so two processes never pick the same name.
    pub fn next_test_subdir(&self, class: &str, shortid: &str) -> String {
        let mut counters = self.class_counters.borrow_mut();
        let counter = counters.entry(class.to_string()).or_insert(0);
        let n = *counter;
        *counter += 1;
        match (self.options.concurrent, self.options.worker) {
            (true, Some(k)) => format!("{shortid}.w{k}.{n}"),
            (true, None) => format!("{shortid}.{n}"),
            (false, _) => format!("{class}.{n}"),
        }
    }

    /// Alternate copy modes across calls so both paths get exercised.
    pub fn next_copy_mode(&self) -> CopyMode {
        let n = self.copy_counter.get();
        self.copy_counter.set(n + 1);
        if n % 2 == 0 {
            CopyMode::Aligned
        } else {
            CopyMode::Unaligned
        }
    }
}
