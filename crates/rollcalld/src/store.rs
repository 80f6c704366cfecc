//! SQLite-backed roster persistence.
//!
//! One row per stored sample; `seq` keeps the per-identity sample order so
//! that a reload rebuilds byte-identical prototypes.

use rollcall_core::{Embedding, Roster, RosterError, RosterStore};
use rusqlite::{params, Connection};
use std::path::Path;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS embeddings (
    name          TEXT NOT NULL,
    seq           INTEGER NOT NULL,
    model_version TEXT,
    vector        BLOB NOT NULL,
    PRIMARY KEY (name, seq)
);
"#;

pub struct SqliteRosterStore {
    conn: Connection,
}

impl SqliteRosterStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, RosterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        tracing::info!(path = %path.display(), "roster database opened");
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, RosterError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }
}

impl RosterStore for SqliteRosterStore {
    fn load(&self) -> Result<Roster, RosterError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, model_version, vector FROM embeddings ORDER BY name, seq")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(backend)?;

        let mut roster = Roster::new();
        for row in rows {
            let (name, model_version, blob) = row.map_err(backend)?;
            let values = decode_vector(&blob).ok_or_else(|| RosterError::Corrupt {
                name: name.clone(),
                reason: format!("vector blob of {} bytes is not a multiple of 4", blob.len()),
            })?;
            roster.entry(name).or_default().push(Embedding {
                values,
                model_version,
            });
        }

        tracing::debug!(identities = roster.len(), "roster loaded");
        Ok(roster)
    }

    fn save(&self, roster: &Roster) -> Result<(), RosterError> {
        let tx = self.conn.unchecked_transaction().map_err(backend)?;
        tx.execute("DELETE FROM embeddings", []).map_err(backend)?;
        {
            let mut insert = tx
                .prepare("INSERT INTO embeddings (name, seq, model_version, vector) VALUES (?1, ?2, ?3, ?4)")
                .map_err(backend)?;
            for (name, samples) in roster {
                for (seq, sample) in samples.iter().enumerate() {
                    insert
                        .execute(params![
                            name,
                            seq as i64,
                            sample.model_version,
                            encode_vector(&sample.values)
                        ])
                        .map_err(backend)?;
                }
            }
        }
        tx.commit().map_err(backend)?;

        tracing::debug!(identities = roster.len(), "roster saved");
        Ok(())
    }
}

fn backend(e: rusqlite::Error) -> RosterError {
    RosterError::Backend(Box::new(e))
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
