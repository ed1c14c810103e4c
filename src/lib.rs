//! An isolating test harness for file-backed storage engines.
//!
//! Every test runs in its own fixture directory with standard output and
//! error output captured to files, against a freshly opened engine
//! connection. Helpers cover expected-output assertions, live backups and
//! crash simulation by copying an engine home mid-transaction. Suites run in
//! order in one process or split across worker processes.

pub mod backup;
pub mod capture;
pub mod case;
pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fixture;
pub mod lifecycle;
pub mod loader;
pub mod outcome;
pub mod sqlite;
pub mod suite;

pub use backup::CopyMode;
pub use case::TestCase;
pub use context::{HarnessContext, HarnessOptions};
pub use engine::{Connection, Cursor, Engine, EngineError, ErrorCode, Item, Session};
pub use error::{HarnessError, Result};
pub use lifecycle::FixtureConfig;
pub use outcome::{SuiteReport, TestId, TestOutcome};
pub use sqlite::SqliteEngine;
pub use suite::Suite;
