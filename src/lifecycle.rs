//! Opening, closing and reopening the engine under test.

use crate::engine::{Connection, Engine, Session};
use crate::error::{HarnessError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Replaces the default connection open.
pub type ConnectionOpenFn = Rc<dyn Fn(&OpenRequest<'_>) -> Result<Box<dyn Connection>>>;
/// Replaces the default session open.
pub type SessionOpenFn = Rc<dyn Fn(&dyn Connection) -> Result<Box<dyn Session>>>;

/// Per-test connection setup.
#[derive(Clone, Default)]
pub struct FixtureConfig {
    /// Appended to the default connection configuration.
    pub conn_config: String,
    pub connection_open: Option<ConnectionOpenFn>,
    pub session_open: Option<SessionOpenFn>,
}

impl FixtureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conn_config(mut self, config: impl Into<String>) -> Self {
        self.conn_config = config.into();
        self
    }

    pub fn connection_open(
        mut self,
        f: impl Fn(&OpenRequest<'_>) -> Result<Box<dyn Connection>> + 'static,
    ) -> Self {
        self.connection_open = Some(Rc::new(f));
        self
    }

    pub fn session_open(
        mut self,
        f: impl Fn(&dyn Connection) -> Result<Box<dyn Session>> + 'static,
    ) -> Self {
        self.session_open = Some(Rc::new(f));
        self
    }
}

impl fmt::Debug for FixtureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureConfig")
            .field("conn_config", &self.conn_config)
            .field("connection_open", &self.connection_open.is_some())
            .field("session_open", &self.session_open.is_some())
            .finish()
    }
}

/// What a connection hook gets to work with.
pub struct OpenRequest<'a> {
    pub engine: &'a dyn Engine,
    pub home: &'a Path,
    pub shortid: &'a str,
    pub conn_config: &'a str,
}

impl OpenRequest<'_> {
    /// `create,error_prefix="<shortid>",<conn_config>`
    pub fn default_config(&self) -> String {
        let mut config = format!("create,error_prefix=\"{}\"", self.shortid);
        if !self.conn_config.is_empty() {
            config.push(',');
            config.push_str(self.conn_config);
        }
        config
    }

    /// Open the home with an explicit configuration string.
    pub fn open_with(&self, config: &str) -> Result<Box<dyn Connection>> {
        Ok(self.engine.open(self.home, config)?)
    }

    pub fn open_default(&self) -> Result<Box<dyn Connection>> {
        self.open_with(&self.default_config())
    }
}

/// The connection and default session a test works against.
pub struct EngineHandle {
    engine: Rc<dyn Engine>,
    shortid: String,
    fixture: FixtureConfig,
    home: PathBuf,
    conn: Option<Box<dyn Connection>>,
    session: Option<Box<dyn Session>>,
}

impl EngineHandle {
    /// A closed handle; nothing is opened until [`open`](Self::open).
    pub fn new(engine: Rc<dyn Engine>, shortid: impl Into<String>, fixture: FixtureConfig) -> Self {
        Self {
            engine,
            shortid: shortid.into(),
            fixture,
            home: PathBuf::from("."),
            conn: None,
            session: None,
        }
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn fixture(&self) -> &FixtureConfig {
        &self.fixture
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Open a connection on `home` through the hook, or the default
    /// configuration when there is none. The handle's own state is untouched.
    pub fn open_connection(&self, home: &Path) -> Result<Box<dyn Connection>> {
        let request = OpenRequest {
            engine: self.engine.as_ref(),
            home,
            shortid: &self.shortid,
            conn_config: &self.fixture.conn_config,
        };
        match &self.fixture.connection_open {
            Some(hook) => hook(&request),
            None => request.open_default(),
        }
    }

    /// Open a session through the hook, or the connection's default.
    pub fn open_session_on(&self, conn: &dyn Connection) -> Result<Box<dyn Session>> {
        match &self.fixture.session_open {
            Some(hook) => hook(conn),
            None => Ok(conn.open_session()?),
        }
    }

    /// Open the connection and default session. A no-op when already open.
    pub fn open(&mut self, home: &Path) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let mut conn = self.open_connection(home)?;
        let session = match self.open_session_on(conn.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = conn.close() {
                    tracing::warn!(error = %close_err, "closing connection after failed session open");
                }
                return Err(e);
            }
        };
        tracing::debug!(home = %home.display(), conn = ?conn, "engine opened");
        self.home = home.to_path_buf();
        self.conn = Some(conn);
        self.session = Some(session);
        Ok(())
    }

    /// Close the connection and with it the default session. Closing a
    /// closed handle does nothing.
    pub fn close(&mut self) -> Result<()> {
        self.session = None;
        if let Some(mut conn) = self.conn.take() {
            conn.close()?;
            tracing::debug!(home = %self.home.display(), "engine closed");
        }
        Ok(())
    }

    /// Close and open again on the same home.
    pub fn reopen(&mut self) -> Result<()> {
        let home = self.home.clone();
        self.close()?;
        self.open(&home)
    }

    pub fn conn(&self) -> Result<&dyn Connection> {
        self.conn
            .as_deref()
            .ok_or_else(|| HarnessError::harness("no open connection"))
    }

    pub fn session(&mut self) -> Result<&mut dyn Session> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(HarnessError::harness("no open session")),
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "closing engine on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Item;
    use crate::sqlite::{BASECFG_FILE, SqliteEngine};
    use std::cell::Cell;
    use std::fs;
    use tempfile::tempdir;

    fn handle(fixture: FixtureConfig) -> EngineHandle {
        EngineHandle::new(Rc::new(SqliteEngine::new()), "Case.method", fixture)
    }

    #[test]
    fn default_config_carries_prefix_and_extra() {
        let engine = SqliteEngine::new();
        let home = Path::new(".");
        let request = OpenRequest {
            engine: &engine,
            home,
            shortid: "Txn.commit",
            conn_config: "log=(enabled=false)",
        };
        assert_eq!(
            request.default_config(),
            "create,error_prefix=\"Txn.commit\",log=(enabled=false)"
        );
        let bare = OpenRequest {
            conn_config: "",
            ..request
        };
        assert_eq!(bare.default_config(), "create,error_prefix=\"Txn.commit\"");
    }

    #[test]
    fn open_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut h = handle(FixtureConfig::new());
        h.open(dir.path()).unwrap();
        assert!(h.is_open());
        h.open(dir.path()).unwrap();
        h.close().unwrap();
        h.close().unwrap();
        assert!(!h.is_open());
        assert!(h.conn().is_err());
        assert!(h.session().is_err());
    }

    #[test]
    fn reopen_keeps_committed_data() {
        let dir = tempdir().unwrap();
        let mut h = handle(FixtureConfig::new());
        h.open(dir.path()).unwrap();
        let session = h.session().unwrap();
        session.create("table:t", "").unwrap();
        let mut c = session.open_cursor("table:t").unwrap();
        c.set_key(Item::Int(1));
        c.set_value(Item::from("one"));
        c.insert().unwrap();
        drop(c);

        h.reopen().unwrap();
        let mut c = h.session().unwrap().open_cursor("table:t").unwrap();
        c.set_key(Item::Int(1));
        c.search().unwrap();
        assert_eq!(c.value().unwrap(), Item::from("one"));
    }

    #[test]
    fn connection_hook_replaces_default() {
        let dir = tempdir().unwrap();
        let fixture = FixtureConfig::new().connection_open(|req| {
            req.open_with("create,log=(enabled=false)")
        });
        let mut h = handle(fixture);
        h.open(dir.path()).unwrap();
        let basecfg = fs::read_to_string(dir.path().join(BASECFG_FILE)).unwrap();
        assert_eq!(basecfg, "create,log=(enabled=false)");
    }

    #[test]
    fn failing_session_hook_closes_connection() {
        let dir = tempdir().unwrap();
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let fixture = FixtureConfig::new().session_open(move |_conn| {
            seen.set(seen.get() + 1);
            Err(HarnessError::harness("no sessions today"))
        });
        let mut h = handle(fixture);
        let err = h.open(dir.path()).unwrap_err();
        assert!(matches!(err, HarnessError::Harness { .. }));
        assert_eq!(calls.get(), 1);
        assert!(!h.is_open());
    }
}
