#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use intake_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ClientId, ClientIdentity, ClientSummary,
    IntakeError, Submission,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

const INTAKE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_INTAKE_V1: &str = r"
CREATE TABLE IF NOT EXISTS clients (
  client_id INTEGER PRIMARY KEY AUTOINCREMENT,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  exam_date TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (first_name, last_name, exam_date)
);

CREATE TABLE IF NOT EXISTS client_answers (
  client_id INTEGER NOT NULL,
  key TEXT NOT NULL CHECK (length(key) > 0),
  value TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (client_id, key),
  FOREIGN KEY (client_id) REFERENCES clients (client_id) ON DELETE CASCADE
);
";

/// SQLite-backed intake store. One handle per unit of work; callers own the
/// handle explicitly rather than reaching for process-wide state.
pub struct SqliteIntakeStore {
    conn: Connection,
}

/// A client summary together with every stored answer for that client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientDetail {
    pub client: ClientSummary,
    pub answers: BTreeMap<String, String>,
}

impl SqliteIntakeStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_INTAKE_V1)
            .context("failed to apply intake schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![INTAKE_MIGRATION_VERSION, now],
            )
            .context("failed to register intake schema migration")?;

        Ok(())
    }

    /// Resolves the identity triple to a client id, creating the row on first
    /// sight. The insert-or-touch is a single statement against the identity
    /// uniqueness constraint, so two racing first submissions converge on one
    /// row instead of creating duplicates.
    pub fn find_or_create_client(&mut self, identity: &ClientIdentity) -> Result<ClientId> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start find-or-create transaction")?;

        let client_id = find_or_create_client_tx(&tx, identity, &now)?;
        tx.commit()
            .context("failed to commit find-or-create transaction")?;

        Ok(client_id)
    }

    /// Inserts or overwrites the one answer row for `(client_id, key)` and
    /// refreshes the owning client's `updated_at`. The caller is responsible
    /// for passing an existing client id; a missing parent surfaces as the
    /// foreign-key failure it is.
    pub fn upsert_answer(&mut self, client_id: ClientId, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(anyhow::Error::new(IntakeError::Validation(
                "answer key cannot be empty".to_string(),
            )));
        }

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start upsert transaction")?;

        tx.execute(
            "UPDATE clients SET updated_at = ?2 WHERE client_id = ?1",
            params![client_id.0, now],
        )
        .context("failed to touch client updated_at")?;

        upsert_answer_tx(&tx, client_id, key, value, &now)?;
        tx.commit().context("failed to commit upsert transaction")?;

        Ok(())
    }

    /// Persists one whole submission: find-or-create on the identity triple,
    /// then one upsert per field, identity fields included. All rows commit
    /// together or not at all.
    pub fn save_submission(&mut self, submission: &Submission) -> Result<ClientId> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let identity = submission.identity();

        let tx = self
            .conn
            .transaction()
            .context("failed to start submission transaction")?;

        let client_id = find_or_create_client_tx(&tx, &identity, &now)?;
        for (key, value) in submission.answers() {
            upsert_answer_tx(&tx, client_id, key, &value, &now)?;
        }

        tx.commit()
            .context("failed to commit submission transaction")?;

        Ok(client_id)
    }

    /// All clients, most recently touched first. Recency ordering is applied
    /// after parsing `updated_at`: RFC3339 text with variable subsecond
    /// precision is not safe to compare lexically in SQL.
    pub fn list_clients(&self) -> Result<Vec<ClientSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT client_id, first_name, last_name, exam_date, updated_at
             FROM clients
             ORDER BY client_id ASC",
        )?;

        let rows = stmt.query_map([], parse_client_row)?;
        let mut summaries = collect_rows(rows)?;
        summaries.sort_by(|lhs, rhs| {
            rhs.updated_at
                .cmp(&lhs.updated_at)
                .then(rhs.client_id.cmp(&lhs.client_id))
        });

        Ok(summaries)
    }

    pub fn get_client_with_answers(&self, client_id: ClientId) -> Result<ClientDetail> {
        let mut stmt = self.conn.prepare(
            "SELECT client_id, first_name, last_name, exam_date, updated_at
             FROM clients
             WHERE client_id = ?1",
        )?;

        let client = stmt
            .query_row(params![client_id.0], parse_client_row)
            .optional()
            .context("failed to query client row")?
            .ok_or(IntakeError::ClientNotFound(client_id))?;

        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM client_answers WHERE client_id = ?1",
        )?;

        let mut rows = stmt.query(params![client_id.0])?;
        let mut answers = BTreeMap::new();
        while let Some(row) = rows.next()? {
            answers.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }

        Ok(ClientDetail { client, answers })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn find_or_create_client_tx(
    conn: &Connection,
    identity: &ClientIdentity,
    now: &str,
) -> Result<ClientId> {
    conn.execute(
        "INSERT INTO clients(first_name, last_name, exam_date, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(first_name, last_name, exam_date) DO UPDATE SET
           updated_at = excluded.updated_at",
        params![
            identity.first_name,
            identity.last_name,
            identity.exam_date,
            now
        ],
    )
    .with_context(|| format!("failed to find-or-create client {identity}"))?;

    let client_id = conn
        .query_row(
            "SELECT client_id FROM clients
             WHERE first_name = ?1 AND last_name = ?2 AND exam_date = ?3",
            params![identity.first_name, identity.last_name, identity.exam_date],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("client row missing after find-or-create for {identity}"))?;

    Ok(ClientId(client_id))
}

fn upsert_answer_tx(
    conn: &Connection,
    client_id: ClientId,
    key: &str,
    value: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO client_answers(client_id, key, value, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(client_id, key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![client_id.0, key, value, now],
    )
    .with_context(|| format!("failed to upsert answer {key} for client {client_id}"))?;

    Ok(())
}

fn parse_client_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClientSummary> {
    let updated_at_raw: String = row.get(4)?;
    let updated_at = parse_rfc3339_utc(&updated_at_raw).map_err(to_sql_error)?;

    Ok(ClientSummary {
        client_id: ClientId(row.get(0)?),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        exam_date: row.get(3)?,
        updated_at,
    })
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: IntakeError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        4,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteIntakeStore {
        let store = must(SqliteIntakeStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn identity(first: &str, last: &str, exam: &str) -> ClientIdentity {
        ClientIdentity {
            first_name: first.to_string(),
            last_name: last.to_string(),
            exam_date: exam.to_string(),
        }
    }

    fn submission(value: serde_json::Value) -> Submission {
        match Submission::from_value(value) {
            Ok(submission) => submission,
            Err(err) => panic!("invalid fixture submission: {err}"),
        }
    }

    fn count(store: &SqliteIntakeStore, sql: &str) -> i64 {
        match store.connection().query_row(sql, [], |row| row.get(0)) {
            Ok(count) => count,
            Err(err) => panic!("count query failed: {err}"),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        must(store.migrate());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM schema_migrations"), 1);
    }

    #[test]
    fn find_or_create_returns_the_same_id_for_the_same_triple() {
        let mut store = fixture_store();
        let jane = identity("Jane", "Doe", "2024-01-01");

        let first = must(store.find_or_create_client(&jane));
        let second = must(store.find_or_create_client(&jane));

        assert_eq!(first, second);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM clients"), 1);
    }

    #[test]
    fn find_or_create_distinguishes_each_member_of_the_triple() {
        let mut store = fixture_store();
        let base = must(store.find_or_create_client(&identity("Jane", "Doe", "2024-01-01")));

        for other in [
            identity("jane", "Doe", "2024-01-01"),
            identity("Jane", "Roe", "2024-01-01"),
            identity("Jane", "Doe", "2024-01-02"),
        ] {
            let id = must(store.find_or_create_client(&other));
            assert_ne!(id, base, "triple {other} must not collapse into {base}");
        }

        assert_eq!(count(&store, "SELECT COUNT(*) FROM clients"), 4);
    }

    #[test]
    fn find_or_create_accepts_the_empty_triple_and_dedups_it() {
        let mut store = fixture_store();
        let blank = identity("", "", "");

        let first = must(store.find_or_create_client(&blank));
        let second = must(store.find_or_create_client(&blank));

        assert_eq!(first, second);
    }

    #[test]
    fn find_or_create_refreshes_updated_at_but_not_created_at() {
        let mut store = fixture_store();
        let jane = identity("Jane", "Doe", "2024-01-01");

        let id = must(store.find_or_create_client(&jane));
        let read_stamps = |store: &SqliteIntakeStore| -> (String, String) {
            match store.connection().query_row(
                "SELECT created_at, updated_at FROM clients WHERE client_id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ) {
                Ok(stamps) => stamps,
                Err(err) => panic!("failed to read stamps: {err}"),
            }
        };

        let (created_before, updated_before) = read_stamps(&store);
        must(store.find_or_create_client(&jane));
        let (created_after, updated_after) = read_stamps(&store);

        assert_eq!(created_before, created_after);
        assert_ne!(updated_before, updated_after);
    }

    #[test]
    fn upsert_keeps_exactly_one_row_holding_the_latest_value() {
        let mut store = fixture_store();
        let id = must(store.find_or_create_client(&identity("Jane", "Doe", "2024-01-01")));

        for round in 1..=5_i64 {
            must(store.upsert_answer(id, "score", &(round * 10).to_string()));
        }

        let detail = must(store.get_client_with_answers(id));
        assert_eq!(detail.answers.get("score").map(String::as_str), Some("50"));
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM client_answers WHERE key = 'score'"),
            1
        );
    }

    #[test]
    fn upsert_rejects_empty_keys() {
        let mut store = fixture_store();
        let id = must(store.find_or_create_client(&identity("Jane", "Doe", "2024-01-01")));

        for key in ["", "   "] {
            let err = match store.upsert_answer(id, key, "x") {
                Ok(()) => panic!("empty key {key:?} must be rejected"),
                Err(err) => err,
            };
            assert!(
                matches!(
                    err.downcast_ref::<IntakeError>(),
                    Some(IntakeError::Validation(_))
                ),
                "unexpected error: {err:#}"
            );
        }
    }

    #[test]
    fn upsert_against_a_missing_client_fails_on_the_foreign_key() {
        let mut store = fixture_store();
        let result = store.upsert_answer(ClientId(999), "score", "90");
        assert!(result.is_err(), "dangling client id must not be writable");
    }

    #[test]
    fn save_submission_round_trips_identity_and_answers() {
        let mut store = fixture_store();
        let id = must(store.save_submission(&submission(json!({
            "firstName": "Jane",
            "lastName": "Doe",
            "testDate": "2024-01-01",
            "score": "90",
        }))));

        let detail = must(store.get_client_with_answers(id));
        assert_eq!(detail.client.client_id, id);
        assert_eq!(detail.client.first_name, "Jane");
        assert_eq!(detail.answers.get("firstName").map(String::as_str), Some("Jane"));
        assert_eq!(detail.answers.get("lastName").map(String::as_str), Some("Doe"));
        assert_eq!(detail.answers.get("testDate").map(String::as_str), Some("2024-01-01"));
        assert_eq!(detail.answers.get("score").map(String::as_str), Some("90"));
    }

    #[test]
    fn save_submission_coerces_non_string_values_to_text() {
        let mut store = fixture_store();
        let id = must(store.save_submission(&submission(json!({
            "firstName": "Jane",
            "lastName": "Doe",
            "testDate": "2024-01-01",
            "attempts": 3,
            "passed": true,
            "notes": null,
            "sections": {"reading": 40},
        }))));

        let detail = must(store.get_client_with_answers(id));
        assert_eq!(detail.answers.get("attempts").map(String::as_str), Some("3"));
        assert_eq!(detail.answers.get("passed").map(String::as_str), Some("true"));
        assert_eq!(detail.answers.get("notes").map(String::as_str), Some("null"));
        assert_eq!(
            detail.answers.get("sections").map(String::as_str),
            Some("{\"reading\":40}")
        );
    }

    #[test]
    fn resubmitting_an_identity_updates_rows_instead_of_duplicating_them() {
        let mut store = fixture_store();
        let first = must(store.save_submission(&submission(json!({
            "firstName": "Jane",
            "lastName": "Doe",
            "testDate": "2024-01-01",
            "score": "70",
        }))));
        let second = must(store.save_submission(&submission(json!({
            "firstName": "Jane",
            "lastName": "Doe",
            "testDate": "2024-01-01",
            "score": "95",
            "retake": "yes",
        }))));

        assert_eq!(first, second);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM clients"), 1);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM client_answers WHERE key = 'score'"),
            1
        );

        let detail = must(store.get_client_with_answers(first));
        assert_eq!(detail.answers.get("score").map(String::as_str), Some("95"));
        assert_eq!(detail.answers.get("retake").map(String::as_str), Some("yes"));
    }

    #[test]
    fn list_clients_orders_by_recency_and_resubmission_moves_to_front() {
        let mut store = fixture_store();
        let ada = must(store.save_submission(&submission(json!({
            "firstName": "Ada", "lastName": "L", "testDate": "2024-01-01",
        }))));
        let ben = must(store.save_submission(&submission(json!({
            "firstName": "Ben", "lastName": "M", "testDate": "2024-01-02",
        }))));
        let cyd = must(store.save_submission(&submission(json!({
            "firstName": "Cyd", "lastName": "N", "testDate": "2024-01-03",
        }))));

        let listed: Vec<ClientId> = must(store.list_clients())
            .into_iter()
            .map(|summary| summary.client_id)
            .collect();
        assert_eq!(listed, vec![cyd, ben, ada]);

        must(store.save_submission(&submission(json!({
            "firstName": "Ada", "lastName": "L", "testDate": "2024-01-01",
        }))));

        let listed: Vec<ClientId> = must(store.list_clients())
            .into_iter()
            .map(|summary| summary.client_id)
            .collect();
        assert_eq!(listed, vec![ada, cyd, ben]);
    }

    #[test]
    fn list_clients_on_an_empty_store_returns_empty() {
        let store = fixture_store();
        assert!(must(store.list_clients()).is_empty());
    }

    #[test]
    fn get_client_with_answers_reports_not_found_for_unknown_ids() {
        let store = fixture_store();
        let err = match store.get_client_with_answers(ClientId(424_242)) {
            Ok(detail) => panic!("unexpected client detail: {detail:?}"),
            Err(err) => err,
        };

        assert!(
            matches!(
                err.downcast_ref::<IntakeError>(),
                Some(IntakeError::ClientNotFound(ClientId(424_242)))
            ),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn answers_survive_special_characters() {
        let mut store = fixture_store();
        let id = must(store.save_submission(&submission(json!({
            "firstName": "Zoë",
            "lastName": "O'Hara",
            "testDate": "2024-01-01",
            "notes": "said \"fine\" 🎧",
        }))));

        let detail = must(store.get_client_with_answers(id));
        assert_eq!(detail.client.first_name, "Zoë");
        assert_eq!(
            detail.answers.get("notes").map(String::as_str),
            Some("said \"fine\" 🎧")
        );
    }

    proptest! {
        #[test]
        fn upsert_last_write_wins(values in proptest::collection::vec(".*", 1..8)) {
            let mut store = fixture_store();
            let id = must(store.find_or_create_client(&identity("P", "Q", "2024-01-01")));

            for value in &values {
                must(store.upsert_answer(id, "field", value));
            }

            let detail = must(store.get_client_with_answers(id));
            prop_assert_eq!(
                detail.answers.get("field"),
                values.last(),
                "exactly the last written value must survive"
            );
            prop_assert_eq!(
                count(&store, "SELECT COUNT(*) FROM client_answers WHERE key = 'field'"),
                1
            );
        }

        #[test]
        fn find_or_create_is_idempotent_for_any_triple(
            first in ".{0,24}",
            last in ".{0,24}",
            exam in ".{0,24}",
        ) {
            let mut store = fixture_store();
            let triple = identity(&first, &last, &exam);

            let lhs = must(store.find_or_create_client(&triple));
            let rhs = must(store.find_or_create_client(&triple));

            prop_assert_eq!(lhs, rhs);
            prop_assert_eq!(count(&store, "SELECT COUNT(*) FROM clients"), 1);
        }
    }
}
