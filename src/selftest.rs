//! The suite the `enginetest` binary runs: the harness exercised end to end
//! against the bundled SQLite engine.

use enginetest::{
    CopyMode, FixtureConfig, HarnessError, Item, Result, Session, SqliteEngine, Suite, TestCase,
    TestId,
};
use std::ops::Range;
use std::path::Path;
use std::rc::Rc;

const RESTART: &str = "RESTART";

pub fn suite() -> Suite {
    let mut suite = Suite::new(Rc::new(SqliteEngine::new()));

    suite.add(TestId::new("Output", "stdout"), |t| {
        t.expected_stdout("hello\n", |_| {
            println!("hello");
            Ok(())
        })
    });
    suite.add(TestId::new("Output", "engine_error"), engine_error);
    suite.add(TestId::new("Basic", "reopen"), reopen);
    suite.add(TestId::new("Txn", "commit_rollback"), commit_rollback);
    suite.add(TestId::new("Txn", "backup_sees_committed"), backup_sees_committed);
    suite.add(TestId::new("Backup", "manual"), manual_backup);
    suite.add(TestId::new("Bug", "truncate_checkpoint"), truncate_checkpoint);
    for (n, config) in [(1, ""), (2, "log=(enabled=false)")] {
        let name = if config.is_empty() { "default" } else { "no log" };
        suite
            .add(TestId::new("Config", "open").with_scenario(n, name), |t| {
                let session = t.session()?;
                session.create("table:config", "key_format=i,value_format=S")?;
                populate(session, "table:config", 0..10)?;
                t.reopen_conn()?;
                expect_count(t.session()?, "table:config", 10)
            })
            .fixture(FixtureConfig::new().conn_config(config));
    }
    suite.add(TestId::new("Notice", "limitation"), |t| {
        t.known_limitation("passive checkpoints only");
        Ok(())
    });
    suite.add(TestId::new("Notice", "failure"), |t| {
        t.known_failure("named checkpoints are not supported")
    });
    suite
        .add(TestId::new("Backup", "many"), |t| backup_iterations(t, 200, 10))
        .long("200 backup iterations");

    suite
}

/// Insert `key -> "value<key>"` for every key in `keys` in one transaction.
fn populate(session: &mut dyn Session, uri: &str, keys: Range<i64>) -> Result<()> {
    session.begin_transaction(None)?;
    let mut cursor = session.open_cursor(uri)?;
    for k in keys {
        cursor.set_key(Item::from(k));
        cursor.set_value(Item::from(format!("value{k}")));
        cursor.insert()?;
    }
    cursor.close()?;
    session.commit_transaction()?;
    Ok(())
}

fn count(session: &mut dyn Session, uri: &str) -> Result<usize> {
    let mut cursor = session.open_cursor(uri)?;
    let mut n = 0;
    loop {
        match cursor.next() {
            Ok(()) => n += 1,
            Err(e) if e.is_not_found() => break,
            Err(e) => return Err(e.into()),
        }
    }
    cursor.close()?;
    Ok(n)
}

fn expect_count(session: &mut dyn Session, uri: &str, expected: usize) -> Result<()> {
    let got = count(session, uri)?;
    if got != expected {
        return Err(HarnessError::assertion(format!(
            "{uri}: expected {expected} rows, found {got}"
        )));
    }
    Ok(())
}

/// Open a copied home and count `uri` there.
fn count_in(t: &TestCase<'_>, dir: &Path, uri: &str) -> Result<usize> {
    let mut conn = t.setup_connection_open(dir)?;
    let counted = t
        .setup_session_open(conn.as_ref())
        .and_then(|mut session| count(session.as_mut(), uri));
    conn.close()?;
    counted
}

fn engine_error(t: &mut TestCase<'_>) -> Result<()> {
    let err = t.assert_raises_with_message(
        |t| Ok(t.session()?.create("table:bad-name", "")?),
        "/invalid table name/",
    )?;
    t.pr(&format!("raised: {err}"));
    Ok(())
}

fn reopen(t: &mut TestCase<'_>) -> Result<()> {
    let uri = "table:reopen";
    let session = t.session()?;
    session.create(uri, "key_format=i,value_format=S")?;
    populate(session, uri, 0..100)?;
    t.reopen_conn()?;
    let session = t.session()?;
    session.verify(uri)?;
    expect_count(session, uri, 100)
}

fn commit_rollback(t: &mut TestCase<'_>) -> Result<()> {
    let uri = "table:txn";
    let session = t.session()?;
    session.create(uri, "key_format=i,value_format=S")?;
    populate(session, uri, 0..10)?;

    session.begin_transaction(Some("isolation=snapshot"))?;
    let mut cursor = session.open_cursor(uri)?;
    for k in 10..20 {
        cursor.set_key(Item::from(k));
        cursor.set_value(Item::from("rolled back"));
        cursor.insert()?;
    }
    cursor.close()?;
    session.rollback_transaction()?;
    expect_count(session, uri, 10)
}

fn backup_sees_committed(t: &mut TestCase<'_>) -> Result<()> {
    let uri = "table:txn";
    let session = t.session()?;
    session.create(uri, "key_format=i,value_format=S")?;
    populate(session, uri, 0..10)?;

    let mut writer = t.conn()?.open_session()?;
    writer.begin_transaction(None)?;
    let mut cursor = writer.open_cursor(uri)?;
    for k in 10..20 {
        cursor.set_key(Item::from(k));
        cursor.set_value(Item::from("pending"));
        cursor.insert()?;
    }
    cursor.close()?;

    let copied = t.backup(Path::new("BACKUP"))?;
    t.pr(&format!("backup copied {copied:?}"));
    writer.rollback_transaction()?;
    writer.close()?;

    let found = count_in(t, Path::new("BACKUP"), uri)?;
    if found != 10 {
        return Err(HarnessError::assertion(format!(
            "backup holds {found} rows, expected only the 10 committed"
        )));
    }
    Ok(())
}

/// Take a crash-consistent copy every `freq` iterations while writing,
/// alternating aligned and unaligned copies.
fn backup_iterations(t: &mut TestCase<'_>, iterations: u64, freq: u64) -> Result<()> {
    let uri = "table:backup";
    t.session()?.create(uri, "key_format=i,value_format=S")?;
    for i in 0..iterations {
        let base = (i * 10) as i64;
        populate(t.session()?, uri, base..base + 10)?;
        if i % freq == 0 {
            let mode = CopyMode::for_iteration(i, freq);
            t.verbose(3, &format!("iteration {i}: backup ({mode:?})"));
            t.check_manual_backup(Path::new("."), Path::new(RESTART), uri, mode)?;
            let found = count_in(t, Path::new(RESTART), uri)?;
            if found != (base + 10) as usize {
                return Err(HarnessError::assertion(format!(
                    "iteration {i}: backup holds {found} rows, expected {}",
                    base + 10
                )));
            }
        }
    }
    Ok(())
}

fn manual_backup(t: &mut TestCase<'_>) -> Result<()> {
    backup_iterations(t, 30, 5)
}

/// A range truncate left uncommitted while another session checkpoints must
/// not leak into a copy of the home.
fn truncate_checkpoint(t: &mut TestCase<'_>) -> Result<()> {
    let uri = "table:bug";
    let session = t.session()?;
    session.create(uri, "key_format=i,value_format=S")?;
    populate(session, uri, 0..1000)?;
    t.reopen_conn()?;

    let session = t.session()?;
    session.begin_transaction(None)?;
    session.truncate(uri, Some(&Item::from(250)), Some(&Item::from(499)))?;
    expect_count(session, uri, 750)?;

    let mut other = t.conn()?.open_session()?;
    other.checkpoint()?;
    other.close()?;

    let copied = t.copy_home(Path::new("."), Path::new(RESTART))?;
    t.pr(&format!("copied {copied:?}"));
    t.session()?.rollback_transaction()?;

    let found = count_in(t, Path::new(RESTART), uri)?;
    if found != 1000 {
        return Err(HarnessError::assertion(format!(
            "copy after checkpoint holds {found} rows, expected 1000"
        )));
    }
    Ok(())
}
