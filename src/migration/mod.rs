//! Schema Upgrade Coordinator
//!
//! Expand, migrate and contract phases for rolling upgrades of the registry
//! database. The version record is the pair of the last applied expand
//! revision and the last applied contract revision; a database is fully at a
//! release only when both match that release.
//!
//! Operator sequence for a rolling upgrade:
//! 1. `db expand` then `db migrate` from one upgraded node before it starts.
//! 2. Upgrade and restart the remaining nodes one at a time.
//! 3. `db contract` once every node runs the new release.

mod scripts;

pub use scripts::{Release, LEGACY_FINAL_VERSION, RELEASES};

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, ServiceError};
use crate::registry::{table_exists, Registry};

// == Schema Version ==
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchemaVersion {
    /// No schema at all
    Empty,
    /// Single-number version from before rolling upgrades
    Legacy { version: i64 },
    Composite { expand: String, contract: String },
}

impl SchemaVersion {
    /// Both revisions at the newest release this binary knows.
    pub fn is_latest(&self) -> bool {
        match self {
            SchemaVersion::Composite { expand, contract } => {
                let latest = scripts::latest();
                expand == latest.expand && contract == latest.contract
            }
            _ => false,
        }
    }

    /// The version this binary upgrades to.
    pub fn latest() -> Self {
        let latest = scripts::latest();
        SchemaVersion::Composite {
            expand: latest.expand.to_string(),
            contract: latest.contract.to_string(),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Empty => f.write_str("empty"),
            SchemaVersion::Legacy { version } => write!(f, "legacy {version}"),
            SchemaVersion::Composite { expand, contract } => {
                write!(f, "expand={expand} contract={contract}")
            }
        }
    }
}

/// Positions of the applied revisions in [`RELEASES`].
struct Applied {
    expand: usize,
    contract: usize,
}

fn read_version(conn: &Connection) -> Result<SchemaVersion> {
    if table_exists(conn, "schema_version")? {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT expand_version, contract_version FROM schema_version WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        return match row {
            Some((expand, contract)) => Ok(SchemaVersion::Composite { expand, contract }),
            None => Err(ServiceError::Schema(
                "schema_version table has no version row".to_string(),
            )),
        };
    }
    if table_exists(conn, "migrate_version")? {
        let version: i64 = conn.query_row(
            "SELECT MAX(version) FROM migrate_version",
            [],
            |row| row.get(0),
        )?;
        return Ok(SchemaVersion::Legacy { version });
    }
    if table_exists(conn, "images")? {
        return Err(ServiceError::Schema(
            "database has registry tables but no version record".to_string(),
        ));
    }
    Ok(SchemaVersion::Empty)
}

fn resolve(version: &SchemaVersion) -> Result<Applied> {
    match version {
        SchemaVersion::Composite { expand, contract } => {
            let e = scripts::expand_index(expand).ok_or_else(|| newer_than_binary(expand))?;
            let c = scripts::contract_index(contract).ok_or_else(|| newer_than_binary(contract))?;
            if c > e {
                return Err(ServiceError::Schema(format!(
                    "contract revision {contract} is ahead of expand revision {expand}"
                )));
            }
            Ok(Applied {
                expand: e,
                contract: c,
            })
        }
        SchemaVersion::Empty => Err(ServiceError::Schema(
            "database is empty, run `db sync` first".to_string(),
        )),
        SchemaVersion::Legacy { version } => Err(ServiceError::Schema(format!(
            "database is at legacy version {version}, run `db expand` first"
        ))),
    }
}

fn newer_than_binary(revision: &str) -> ServiceError {
    ServiceError::Schema(format!(
        "database revision {revision} is unknown to this release; downgrades are not supported"
    ))
}

fn write_version(conn: &Connection, expand: &str, contract: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (id, expand_version, contract_version) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
             expand_version = excluded.expand_version,
             contract_version = excluded.contract_version",
        params![expand, contract],
    )?;
    Ok(())
}

const VERSION_TABLE_SQL: &str = "
CREATE TABLE schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    expand_version TEXT NOT NULL,
    contract_version TEXT NOT NULL
);
";

// == Migrator ==
/// Runs schema phases against one registry database.
pub struct Migrator<'a> {
    registry: &'a Registry,
}

impl<'a> Migrator<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    pub fn version(&self) -> Result<SchemaVersion> {
        let conn = self.registry.conn()?;
        read_version(&conn)
    }

    /// Applies all outstanding expand scripts. Creates the base schema on an
    /// empty database and adopts a legacy database at the final legacy
    /// version.
    pub fn expand(&self) -> Result<SchemaVersion> {
        let mut conn = self.registry.conn()?;
        let base = &RELEASES[0];

        match read_version(&conn)? {
            SchemaVersion::Empty => {
                let tx = conn.transaction()?;
                tx.execute_batch(base.expand_sql)?;
                tx.execute_batch(VERSION_TABLE_SQL)?;
                write_version(&tx, base.expand, base.contract)?;
                tx.commit()?;
                info!(revision = base.expand, "base schema created");
            }
            SchemaVersion::Legacy { version } if version == LEGACY_FINAL_VERSION => {
                let tx = conn.transaction()?;
                tx.execute_batch(VERSION_TABLE_SQL)?;
                write_version(&tx, base.expand, base.contract)?;
                tx.execute_batch("DROP TABLE migrate_version;")?;
                tx.commit()?;
                info!(legacy_version = version, "legacy version record adopted");
            }
            SchemaVersion::Legacy { version } if version > LEGACY_FINAL_VERSION => {
                return Err(ServiceError::Schema(format!(
                    "legacy version {version} is newer than {LEGACY_FINAL_VERSION}; \
                     downgrades are not supported"
                )));
            }
            SchemaVersion::Legacy { version } => {
                return Err(ServiceError::Schema(format!(
                    "legacy version {version} must first be upgraded to \
                     {LEGACY_FINAL_VERSION} by an older release"
                )));
            }
            SchemaVersion::Composite { .. } => {}
        }

        let applied = resolve(&read_version(&conn)?)?;
        for release in &RELEASES[applied.expand + 1..] {
            let contract = RELEASES[applied.contract].contract;
            let tx = conn.transaction()?;
            tx.execute_batch(release.expand_sql)?;
            write_version(&tx, release.expand, contract)?;
            tx.commit()?;
            info!(release = release.name, revision = release.expand, "expand applied");
        }

        read_version(&conn)
    }

    /// Releases whose data migration belongs to the current rolling window.
    fn open_window(applied: &Applied) -> impl Iterator<Item = &'static Release> {
        let (contracted, expanded) = (applied.contract, applied.expand);
        RELEASES
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i > contracted && *i <= expanded)
            .map(|(_, r)| r)
    }

    /// Rows still waiting for a data migration.
    pub fn pending(&self) -> Result<u64> {
        let conn = self.registry.conn()?;
        let applied = resolve(&read_version(&conn)?)?;
        let mut total = 0;
        for release in Self::open_window(&applied) {
            if let Some(data) = &release.data {
                total += (data.pending)(&conn)?;
            }
        }
        Ok(total)
    }

    /// Runs the data migrations of every expanded but not yet contracted
    /// release. Returns the number of rows migrated.
    pub fn migrate(&self) -> Result<u64> {
        let mut conn = self.registry.conn()?;
        let applied = resolve(&read_version(&conn)?)?;

        let mut migrated = 0;
        for release in Self::open_window(&applied) {
            if let Some(data) = &release.data {
                let tx = conn.transaction()?;
                let rows = (data.run)(&tx)?;
                tx.commit()?;
                info!(release = release.name, migration = data.name, rows, "data migrated");
                migrated += rows;
            }
        }
        Ok(migrated)
    }

    /// Applies outstanding contract scripts. Refused until expand is at the
    /// newest release and no data migration is pending.
    pub fn contract(&self) -> Result<SchemaVersion> {
        let pending = self.pending()?;
        let mut conn = self.registry.conn()?;
        let applied = resolve(&read_version(&conn)?)?;

        if applied.expand != RELEASES.len() - 1 {
            return Err(ServiceError::Schema(format!(
                "expand is at {}, run `db expand` before `db contract`",
                RELEASES[applied.expand].expand
            )));
        }
        if pending > 0 {
            return Err(ServiceError::Schema(format!(
                "{pending} rows still need migrating, run `db migrate` before `db contract`"
            )));
        }

        let expand = RELEASES[applied.expand].expand;
        for release in &RELEASES[applied.contract + 1..=applied.expand] {
            let tx = conn.transaction()?;
            tx.execute_batch(release.contract_sql)?;
            write_version(&tx, expand, release.contract)?;
            tx.commit()?;
            info!(release = release.name, revision = release.contract, "contract applied");
        }

        read_version(&conn)
    }

    /// Expand, migrate and contract in one go, for offline upgrades and new
    /// deployments.
    pub fn sync(&self) -> Result<SchemaVersion> {
        self.expand()?;
        self.migrate()?;
        self.contract()
    }

    pub fn upgrade(&self) -> Result<SchemaVersion> {
        self.sync()
    }

    /// Gate for starting a service node: expand at the newest release and no
    /// pending data migrations. Contract may lag while older nodes run.
    pub fn check_ready(&self) -> Result<()> {
        let version = self.version()?;
        let applied = resolve(&version)?;
        if applied.expand != RELEASES.len() - 1 {
            return Err(ServiceError::Schema(format!(
                "database is at {version}, run `db expand` and `db migrate` before starting"
            )));
        }
        let pending = self.pending()?;
        if pending > 0 {
            return Err(ServiceError::Schema(format!(
                "{pending} rows still need migrating, run `db migrate` before starting"
            )));
        }
        if !version.is_latest() {
            warn!(%version, "schema contract pending; run `db contract` once all nodes are upgraded");
        }
        Ok(())
    }
}
