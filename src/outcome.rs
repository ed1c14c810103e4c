//! Test identities and recorded results.

use crate::error::HarnessError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A numbered variant of a parameterised test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scenario {
    pub number: usize,
    pub name: String,
}

/// Identity of one test: its class (group), method and optional scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestId {
    pub class: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
}

impl TestId {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            scenario: None,
        }
    }

    pub fn with_scenario(mut self, number: usize, name: impl Into<String>) -> Self {
        self.scenario = Some(Scenario {
            number,
            name: name.into(),
        });
        self
    }

    /// `class.method`
    pub fn simple_name(&self) -> String {
        format!("{}.{}", self.class, self.method)
    }

    /// Unique within a suite and safe in a file name: `class.method` plus
    /// `.s<n>` for scenarios.
    pub fn shortid(&self) -> String {
        match &self.scenario {
            Some(s) => format!("{}.{}.s{}", self.class, self.method, s.number),
            None => self.simple_name(),
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.simple_name())?;
        if let Some(s) = &self.scenario {
            write!(f, "(scenario {}: {})", s.number, s.name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
}

/// Why a test failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Fixture or engine setup failed before the body ran.
    Setup,
    Assertion,
    /// The engine returned an error the body did not handle.
    Engine,
    /// The body panicked.
    Panic,
    /// The harness itself broke.
    Harness,
    BackupProtocol,
}

impl FailureKind {
    /// Classify an error returned from a test body.
    pub fn of(err: &HarnessError) -> Self {
        match err {
            HarnessError::Assertion { .. } | HarnessError::Pattern { .. } => FailureKind::Assertion,
            HarnessError::Engine { .. } => FailureKind::Engine,
            HarnessError::BackupProtocol(_) => FailureKind::BackupProtocol,
            HarnessError::Io(_)
            | HarnessError::Harness { .. }
            | HarnessError::Config(_)
            | HarnessError::Skip(_) => FailureKind::Harness,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Setup => "setup",
            FailureKind::Assertion => "assertion",
            FailureKind::Engine => "engine",
            FailureKind::Panic => "panic",
            FailureKind::Harness => "harness",
            FailureKind::BackupProtocol => "backup protocol",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    /// Error source chain, panic location or backtrace lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Build from an error: where it was raised, then its source chain.
    pub fn from_error(kind: FailureKind, err: &HarnessError) -> Self {
        let mut info = Self::new(kind, err.to_string());
        if let Some(location) = err.location() {
            info.trace.push(format!("at {location}"));
        }
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            info.trace.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        info
    }
}

/// The recorded result of one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub id: TestId,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_dir: Option<PathBuf>,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.status == Status::Passed
    }

    pub fn failed(&self) -> bool {
        self.status == Status::Failed
    }

    pub fn skipped(id: TestId, reason: impl Into<String>, worker: Option<usize>) -> Self {
        Self {
            id,
            status: Status::Skipped,
            failure: None,
            skip_reason: Some(reason.into()),
            preserved_dir: None,
            duration: Duration::ZERO,
            worker,
        }
    }

    /// A failure recorded on behalf of a test that never reported, e.g. when
    /// its worker died.
    pub fn harness_failure(id: TestId, message: impl Into<String>, worker: Option<usize>) -> Self {
        Self {
            id,
            status: Status::Failed,
            failure: Some(FailureInfo::new(FailureKind::Harness, message)),
            skip_reason: None,
            preserved_dir: None,
            duration: Duration::ZERO,
            worker,
        }
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

/// Outcomes of a whole run, in suite order.
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub outcomes: Vec<TestOutcome>,
    pub elapsed: Duration,
}

impl SuiteReport {
    fn count(&self, status: Status) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Status::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Status::Skipped)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, ErrorCode};

    #[test]
    fn names_and_shortids() {
        let id = TestId::new("Backup", "manual");
        assert_eq!(id.shortid(), "Backup.manual");
        assert_eq!(id.to_string(), "Backup.manual");

        let id = id.with_scenario(3, "table with log");
        assert_eq!(id.shortid(), "Backup.manual.s3");
        assert_eq!(id.to_string(), "Backup.manual(scenario 3: table with log)");
    }

    #[test]
    fn errors_map_to_failure_kinds() {
        let engine: HarnessError = EngineError::new(ErrorCode::Busy, "locked").into();
        assert_eq!(FailureKind::of(&engine), FailureKind::Engine);
        assert_eq!(
            FailureKind::of(&HarnessError::assertion("x")),
            FailureKind::Assertion
        );
        assert_eq!(
            FailureKind::of(&HarnessError::BackupProtocol("early".into())),
            FailureKind::BackupProtocol
        );
        assert_eq!(
            FailureKind::of(&HarnessError::harness("cwd")),
            FailureKind::Harness
        );
    }

    #[test]
    fn failure_info_collects_source_chain() {
        let source = regex::Regex::new("(").unwrap_err();
        let err = HarnessError::Pattern {
            pattern: "(".into(),
            source,
        };
        let info = FailureInfo::from_error(FailureKind::Assertion, &err);
        assert_eq!(info.trace.len(), 1);
        assert!(info.trace[0].starts_with("caused by: "));
    }

    #[test]
    fn failure_info_starts_with_raise_site() {
        let err = HarnessError::from(EngineError::new(
            ErrorCode::NotFound,
            "table:nope: no such object",
        ));
        let info = FailureInfo::from_error(FailureKind::Engine, &err);
        assert_eq!(info.message, "engine error: table:nope: no such object");
        assert_eq!(info.trace.len(), 1);
        assert!(info.trace[0].starts_with("at "));
        assert!(info.trace[0].contains("outcome.rs"));
    }

    #[test]
    fn outcome_json_line_round_trips_duration() {
        let mut outcome = TestOutcome::harness_failure(TestId::new("A", "b"), "worker died", Some(1));
        outcome.duration = Duration::from_millis(1500);
        let line = serde_json::to_string(&outcome).unwrap();
        assert!(line.contains("\"duration\":1.5"));
        assert!(line.contains("\"kind\":\"harness\""));

        let back: TestOutcome = serde_json::from_str(&line).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
        assert_eq!(back.worker, Some(1));
        assert!(back.failed());
    }

    #[test]
    fn report_counts() {
        let report = SuiteReport {
            outcomes: vec![
                TestOutcome::skipped(TestId::new("A", "a"), "later", None),
                TestOutcome::harness_failure(TestId::new("A", "b"), "boom", None),
            ],
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.passed(), 0);
        assert!(!report.is_success());
    }
}
