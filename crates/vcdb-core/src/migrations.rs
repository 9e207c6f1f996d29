//! Named, append-only schema migrations.
//!
//! `_migrations` is the ledger: a migration whose name is recorded there is
//! never run again. Each migration and its ledger row commit in the same
//! transaction, so a failure leaves neither behind.

use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

const LEDGER_DDL: &str = "
    CREATE TABLE IF NOT EXISTS _migrations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        applied_at TEXT NOT NULL
    );
";

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_contacts_and_tags",
        sql: "
            CREATE TABLE tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                color TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE contacts (
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                title TEXT,
                company TEXT,
                city TEXT,
                country TEXT,
                email TEXT,
                phone TEXT,
                linkedin_url TEXT,
                website TEXT,
                notes TEXT,
                last_touched_at TEXT,
                next_touch_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE contact_tags (
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (contact_id, tag_id)
            );
        ",
    },
    Migration {
        name: "0002_activity",
        sql: "
            CREATE TABLE notes (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                kind TEXT NOT NULL DEFAULT 'note',
                title TEXT,
                body TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE reminders (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                note_id TEXT REFERENCES notes(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                due_at TEXT NOT NULL,
                snooze_until TEXT,
                recurring_days INTEGER,
                completed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE interactions (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                happened_at TEXT NOT NULL,
                summary TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_reminders_due ON reminders(due_at) WHERE completed_at IS NULL;
            CREATE INDEX idx_notes_contact ON notes(contact_id, created_at);
            CREATE INDEX idx_interactions_contact ON interactions(contact_id, happened_at);
        ",
    },
    Migration {
        name: "0003_contact_search",
        sql: "
            CREATE VIRTUAL TABLE contacts_fts USING fts5(
                first_name, last_name, company, notes,
                content='contacts',
                content_rowid='rowid'
            );

            CREATE TRIGGER contacts_fts_insert AFTER INSERT ON contacts BEGIN
                INSERT INTO contacts_fts(rowid, first_name, last_name, company, notes)
                VALUES (new.rowid, new.first_name, new.last_name, new.company, new.notes);
            END;

            CREATE TRIGGER contacts_fts_update AFTER UPDATE ON contacts BEGIN
                INSERT INTO contacts_fts(contacts_fts, rowid, first_name, last_name, company, notes)
                VALUES ('delete', old.rowid, old.first_name, old.last_name, old.company, old.notes);
                INSERT INTO contacts_fts(rowid, first_name, last_name, company, notes)
                VALUES (new.rowid, new.first_name, new.last_name, new.company, new.notes);
            END;

            CREATE TRIGGER contacts_fts_delete AFTER DELETE ON contacts BEGIN
                INSERT INTO contacts_fts(contacts_fts, rowid, first_name, last_name, company, notes)
                VALUES ('delete', old.rowid, old.first_name, old.last_name, old.company, old.notes);
            END;

            INSERT INTO contacts_fts(contacts_fts) VALUES ('rebuild');
        ",
    },
    Migration {
        name: "0004_companies_and_custom_fields",
        sql: "
            CREATE TABLE companies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                domain TEXT,
                industry TEXT,
                notes TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            ALTER TABLE contacts ADD COLUMN company_id TEXT REFERENCES companies(id) ON DELETE SET NULL;

            CREATE TABLE custom_fields (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                field_type TEXT NOT NULL DEFAULT 'text',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE contact_custom_values (
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                field_id TEXT NOT NULL REFERENCES custom_fields(id) ON DELETE CASCADE,
                value TEXT,
                PRIMARY KEY (contact_id, field_id)
            );
        ",
    },
    Migration {
        name: "0005_attachments",
        sql: "
            CREATE TABLE attachments (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                file_name TEXT NOT NULL,
                stored_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        ",
    },
    Migration {
        name: "0006_default_tags",
        sql: "
            INSERT OR IGNORE INTO tags (id, name, color) VALUES
                ('tag-investors', 'Investors', '#2563eb'),
                ('tag-customers', 'Customers', '#16a34a'),
                ('tag-lps', 'LPs', '#9333ea');
        ",
    },
];

pub struct SchemaMigrator {
    migrations: &'static [Migration],
}

impl SchemaMigrator {
    pub fn new(migrations: &'static [Migration]) -> Result<Self> {
        let mut names = HashSet::new();
        for m in migrations {
            if !names.insert(m.name) {
                return Err(VaultError::MigrationFailed {
                    name: m.name.to_string(),
                    reason: "duplicate migration name".into(),
                });
            }
        }
        Ok(Self { migrations })
    }

    pub fn standard() -> Self {
        Self {
            migrations: MIGRATIONS,
        }
    }

    pub fn migrations(&self) -> &'static [Migration] {
        self.migrations
    }

    /// Ledger contents in application order.
    pub fn applied(&self, conn: &Connection) -> Result<Vec<MigrationRecord>> {
        conn.execute_batch(LEDGER_DDL)?;
        let mut stmt = conn.prepare("SELECT name, applied_at FROM _migrations ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(MigrationRecord {
                name: row.get(0)?,
                applied_at: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Apply every migration missing from the ledger, in list order.
    /// Returns the names applied by this call.
    pub fn run(&self, conn: &mut Connection) -> Result<Vec<&'static str>> {
        let applied = self.applied(conn)?;
        let known: HashSet<&str> = self.migrations.iter().map(|m| m.name).collect();
        if let Some(unknown) = applied.iter().find(|r| !known.contains(r.name.as_str())) {
            return Err(VaultError::MigrationFailed {
                name: unknown.name.clone(),
                reason: "database was migrated by a newer version".into(),
            });
        }
        let done: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();

        let mut newly_applied = Vec::new();
        for migration in self.migrations.iter().filter(|m| !done.contains(m.name)) {
            apply_one(conn, migration).map_err(|e| VaultError::MigrationFailed {
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;
            info!(migration = migration.name, "applied migration");
            newly_applied.push(migration.name);
        }
        if newly_applied.is_empty() {
            debug!("schema up to date");
        }
        Ok(newly_applied)
    }
}

fn apply_one(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO _migrations (name, applied_at) VALUES (?1, ?2)",
        params![migration.name, Utc::now()],
    )?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_snapshot(conn: &Connection) -> Vec<(String, String)> {
        let mut stmt = conn
            .prepare("SELECT name, COALESCE(sql, '') FROM sqlite_master ORDER BY name")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn applies_all_in_order() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = SchemaMigrator::standard();
        let applied = migrator.run(&mut conn).unwrap();
        let expected: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        assert_eq!(applied, expected);

        let ledger: Vec<String> = migrator
            .applied(&conn)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(ledger, expected);

        let tags: i64 = conn
            .query_row("SELECT COUNT(*) FROM tags", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tags, 3);
    }

    #[test]
    fn second_run_changes_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = SchemaMigrator::standard();
        migrator.run(&mut conn).unwrap();
        let ledger_before = migrator.applied(&conn).unwrap();
        let schema_before = schema_snapshot(&conn);

        assert!(migrator.run(&mut conn).unwrap().is_empty());
        assert_eq!(migrator.applied(&conn).unwrap(), ledger_before);
        assert_eq!(schema_snapshot(&conn), schema_before);
    }

    #[test]
    fn failing_migration_rolls_back_with_its_ledger_row() {
        static BROKEN: &[Migration] = &[
            Migration {
                name: "0001_ok",
                sql: "CREATE TABLE a (id INTEGER);",
            },
            Migration {
                name: "0002_broken",
                sql: "CREATE TABLE b (id INTEGER); INSERT INTO missing_table VALUES (1);",
            },
        ];
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = SchemaMigrator::new(BROKEN).unwrap();
        let err = migrator.run(&mut conn).unwrap_err();
        match err {
            VaultError::MigrationFailed { name, .. } => assert_eq!(name, "0002_broken"),
            other => panic!("unexpected error {other:?}"),
        }

        let ledger = migrator.applied(&conn).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].name, "0001_ok");
        let b_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'b'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(b_exists, 0);
    }

    #[test]
    fn later_migrations_are_picked_up_incrementally() {
        static V1: &[Migration] = &[Migration {
            name: "0001",
            sql: "CREATE TABLE one (id INTEGER);",
        }];
        static V2: &[Migration] = &[
            Migration {
                name: "0001",
                sql: "CREATE TABLE one (id INTEGER);",
            },
            Migration {
                name: "0002",
                sql: "CREATE TABLE two (id INTEGER);",
            },
        ];
        let mut conn = Connection::open_in_memory().unwrap();
        SchemaMigrator::new(V1).unwrap().run(&mut conn).unwrap();
        let applied = SchemaMigrator::new(V2).unwrap().run(&mut conn).unwrap();
        assert_eq!(applied, vec!["0002"]);
    }

    #[test]
    fn ledger_from_newer_build_is_rejected() {
        static V1: &[Migration] = &[Migration {
            name: "0001",
            sql: "CREATE TABLE one (id INTEGER);",
        }];
        let mut conn = Connection::open_in_memory().unwrap();
        SchemaMigrator::standard().run(&mut conn).unwrap();
        let err = SchemaMigrator::new(V1).unwrap().run(&mut conn).unwrap_err();
        assert!(matches!(err, VaultError::MigrationFailed { .. }));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        static DUP: &[Migration] = &[
            Migration { name: "x", sql: "" },
            Migration { name: "x", sql: "" },
        ];
        assert!(SchemaMigrator::new(DUP).is_err());
    }

    #[test]
    fn search_index_follows_contact_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        SchemaMigrator::standard().run(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO contacts (id, first_name, last_name, company) VALUES ('c1', 'Ada', 'Lovelace', 'Analytical')",
            [],
        )
        .unwrap();
        let id: String = conn
            .query_row(
                "SELECT id FROM contacts WHERE rowid IN (SELECT rowid FROM contacts_fts WHERE contacts_fts MATCH 'lovel*')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(id, "c1");
    }
}
