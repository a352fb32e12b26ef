//! Durable trial storage.

use std::{collections::BTreeMap, path::Path};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::search::{Distribution, FrozenTrial, TrialState};

/// Errors raised by the trial storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database rejected a statement.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored distribution could not be encoded or decoded.
    #[error("distribution encoding: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored trial state is not known.
    #[error("unknown trial state {0:?}")]
    UnknownState(String),
    /// No trial has the given identifier.
    #[error("no trial with id {0}")]
    UnknownTrial(i64),
}

/// Trial storage in a SQLite database.
///
/// Every write is committed before returning, so a study survives the process and can be
/// resumed by name.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::init(Connection::open(path)?)
    }

    /// Open a database that lives only as long as the returned value.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS studies (
                study_id   INTEGER PRIMARY KEY,
                study_name TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS trials (
                trial_id INTEGER PRIMARY KEY,
                number   INTEGER NOT NULL,
                study_id INTEGER NOT NULL REFERENCES studies(study_id),
                state    TEXT NOT NULL,
                value    REAL,
                UNIQUE (study_id, number)
            );
            CREATE TABLE IF NOT EXISTS trial_params (
                trial_id          INTEGER NOT NULL REFERENCES trials(trial_id),
                param_name        TEXT NOT NULL,
                param_value       REAL NOT NULL,
                distribution_json TEXT NOT NULL,
                PRIMARY KEY (trial_id, param_name)
            );
            CREATE TABLE IF NOT EXISTS trial_intermediate_values (
                trial_id           INTEGER NOT NULL REFERENCES trials(trial_id),
                step               INTEGER NOT NULL,
                intermediate_value REAL,
                PRIMARY KEY (trial_id, step)
            );",
        )?;
        Ok(Self { conn })
    }

    /// Return the identifier of the study called `name`, creating it if needed.
    pub fn create_study(&mut self, name: &str) -> Result<i64, StorageError> {
        let existing = self
            .conn
            .query_row(
                "SELECT study_id FROM studies WHERE study_name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.conn
            .execute("INSERT INTO studies (study_name) VALUES (?1)", params![name])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Names of all studies in the database.
    pub fn study_names(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT study_name FROM studies ORDER BY study_id")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Start a new trial, numbered after the existing ones.
    pub fn create_trial(&mut self, study_id: i64) -> Result<FrozenTrial, StorageError> {
        let tx = self.conn.transaction()?;
        let number: i64 = tx.query_row(
            "SELECT COUNT(*) FROM trials WHERE study_id = ?1",
            params![study_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO trials (number, study_id, state) VALUES (?1, ?2, ?3)",
            params![number, study_id, TrialState::Running.as_str()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(FrozenTrial::running(id, number as usize))
    }

    /// Record a parameter of a running trial.
    pub fn set_param(
        &mut self,
        trial_id: i64,
        name: &str,
        value: f64,
        distribution: &Distribution,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(distribution)?;
        self.conn.execute(
            "INSERT INTO trial_params (trial_id, param_name, param_value, distribution_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![trial_id, name, value, json],
        )?;
        Ok(())
    }

    /// Record the value reported at `step`, replacing any earlier report for the same step.
    pub fn report(&mut self, trial_id: i64, step: usize, value: f64) -> Result<(), StorageError> {
        let value = (!value.is_nan()).then_some(value);
        self.conn.execute(
            "INSERT OR REPLACE INTO trial_intermediate_values (trial_id, step, intermediate_value)
             VALUES (?1, ?2, ?3)",
            params![trial_id, step as i64, value],
        )?;
        Ok(())
    }

    /// Set the final state and value of a trial.
    pub fn finish(
        &mut self,
        trial_id: i64,
        state: TrialState,
        value: Option<f64>,
    ) -> Result<(), StorageError> {
        let value = value.filter(|v| !v.is_nan());
        let updated = self.conn.execute(
            "UPDATE trials SET state = ?1, value = ?2 WHERE trial_id = ?3",
            params![state.as_str(), value, trial_id],
        )?;
        if updated == 0 {
            return Err(StorageError::UnknownTrial(trial_id));
        }
        Ok(())
    }

    /// Mark every trial left running by a previous process as failed.
    ///
    /// Returns the number of trials updated.
    pub fn fail_stale_trials(&mut self, study_id: i64) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "UPDATE trials SET state = ?1 WHERE study_id = ?2 AND state = ?3",
            params![
                TrialState::Fail.as_str(),
                study_id,
                TrialState::Running.as_str()
            ],
        )?)
    }

    /// All trials of a study, ordered by number.
    pub fn trials(&self, study_id: i64) -> Result<Vec<FrozenTrial>, StorageError> {
        let mut trials = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT trial_id, number, state, value FROM trials
             WHERE study_id = ?1 ORDER BY number",
        )?;
        let rows = stmt.query_map(params![study_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })?;
        for row in rows {
            let (id, number, state, value) = row?;
            let mut trial = FrozenTrial::running(id, number as usize);
            trial.state = state.parse()?;
            trial.value = value;
            trials.insert(id, trial);
        }

        let mut stmt = self.conn.prepare(
            "SELECT p.trial_id, p.param_name, p.param_value, p.distribution_json
             FROM trial_params p JOIN trials t ON p.trial_id = t.trial_id
             WHERE t.study_id = ?1",
        )?;
        let rows = stmt.query_map(params![study_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (id, name, value, json) = row?;
            let trial = trials
                .get_mut(&id)
                .ok_or(StorageError::UnknownTrial(id))?;
            trial
                .distributions
                .insert(name.clone(), serde_json::from_str(&json)?);
            trial.params.insert(name, value);
        }

        let mut stmt = self.conn.prepare(
            "SELECT v.trial_id, v.step, v.intermediate_value
             FROM trial_intermediate_values v JOIN trials t ON v.trial_id = t.trial_id
             WHERE t.study_id = ?1",
        )?;
        let rows = stmt.query_map(params![study_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })?;
        for row in rows {
            let (id, step, value) = row?;
            let trial = trials
                .get_mut(&id)
                .ok_or(StorageError::UnknownTrial(id))?;
            trial
                .intermediate_values
                .insert(step as usize, value.unwrap_or(f64::NAN));
        }

        let mut trials: Vec<_> = trials.into_values().collect();
        trials.sort_by_key(|t| t.number);
        Ok(trials)
    }
}
