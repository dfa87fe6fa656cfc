//! Beacon tables targeted by the loader.

use rusqlite::{Connection, Transaction};

/// Tables in dependency order, parents first.
pub const TABLES: &[&str] = &[
    "beacon_dataset_table",
    "dataset_access_level_table",
    "beacon_dataset_consent_code_table",
    "patient_table",
    "patient_attribute_table",
    "beacon_sample_table",
    "beacon_dataset_sample_table",
    "beacon_data_table",
    "beacon_data_sample_table",
];

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS beacon_dataset_table (
    id INTEGER PRIMARY KEY,
    stable_id TEXT NOT NULL UNIQUE,
    description TEXT,
    access_type TEXT,
    reference_genome TEXT,
    variant_cnt INTEGER NOT NULL DEFAULT 0,
    call_cnt INTEGER NOT NULL DEFAULT 0,
    sample_cnt INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS dataset_access_level_table (
    dataset_id INTEGER NOT NULL REFERENCES beacon_dataset_table (id),
    parent_field TEXT NOT NULL,
    field TEXT NOT NULL,
    access_level TEXT NOT NULL,
    UNIQUE (dataset_id, parent_field, field)
);

CREATE TABLE IF NOT EXISTS beacon_dataset_consent_code_table (
    dataset_id INTEGER NOT NULL REFERENCES beacon_dataset_table (id),
    consent_code_id INTEGER NOT NULL,
    additional_constraint TEXT,
    version TEXT,
    UNIQUE (dataset_id, consent_code_id)
);

CREATE TABLE IF NOT EXISTS patient_table (
    id INTEGER PRIMARY KEY,
    stable_id TEXT NOT NULL UNIQUE,
    sex TEXT,
    age_of_onset INTEGER,
    disease TEXT
);

CREATE TABLE IF NOT EXISTS patient_attribute_table (
    patient_id INTEGER NOT NULL REFERENCES patient_table (id),
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    UNIQUE (patient_id, key)
);

CREATE TABLE IF NOT EXISTS beacon_sample_table (
    id INTEGER PRIMARY KEY,
    stable_id TEXT NOT NULL UNIQUE,
    sex TEXT,
    tissue TEXT,
    collection TEXT,
    patient_id INTEGER NOT NULL REFERENCES patient_table (id)
);

CREATE TABLE IF NOT EXISTS beacon_dataset_sample_table (
    dataset_id INTEGER NOT NULL REFERENCES beacon_dataset_table (id),
    sample_id INTEGER NOT NULL REFERENCES beacon_sample_table (id),
    UNIQUE (dataset_id, sample_id)
);

CREATE TABLE IF NOT EXISTS beacon_data_table (
    id INTEGER PRIMARY KEY,
    dataset_id INTEGER NOT NULL REFERENCES beacon_dataset_table (id),
    variant_id TEXT,
    chromosome TEXT NOT NULL,
    reference TEXT NOT NULL,
    alternate TEXT NOT NULL,
    start INTEGER NOT NULL,
    "end" INTEGER NOT NULL,
    quality REAL,
    filter TEXT,
    call_cnt INTEGER NOT NULL,
    sample_cnt INTEGER NOT NULL,
    matching_sample_cnt INTEGER NOT NULL,
    frequency REAL NOT NULL,
    UNIQUE (dataset_id, chromosome, start, reference, alternate)
);

CREATE TABLE IF NOT EXISTS beacon_data_sample_table (
    data_id INTEGER NOT NULL REFERENCES beacon_data_table (id),
    sample_id INTEGER NOT NULL REFERENCES beacon_sample_table (id),
    genotype TEXT NOT NULL,
    phased INTEGER NOT NULL,
    UNIQUE (data_id, sample_id)
);
"#;

/// Create all tables that do not exist yet.
pub fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(DDL)
}

/// Remove all rows from all tables in one transaction.
pub fn clear(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    clear_in(&tx)?;
    tx.commit()
}

/// Remove all rows from all tables within the caller's transaction.
pub(crate) fn clear_in(tx: &Transaction) -> Result<(), rusqlite::Error> {
    for table in TABLES.iter().rev() {
        tx.execute(&format!("DELETE FROM {}", table), [])?;
    }
    Ok(())
}

/// Number of rows in `table`.
pub fn count_rows(conn: &Connection, table: &str) -> Result<usize, rusqlite::Error> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|n| n as usize)
}

#[cfg(test)]
mod test {
    use rusqlite::Connection;

    use super::*;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn ensure_schema_is_idempotent() -> Result<(), anyhow::Error> {
        let conn = memory();
        ensure_schema(&conn)?;
        ensure_schema(&conn)?;
        for table in TABLES {
            assert_eq!(count_rows(&conn, table)?, 0);
        }
        Ok(())
    }

    #[test]
    fn clear_respects_foreign_keys() -> Result<(), anyhow::Error> {
        let mut conn = memory();
        ensure_schema(&conn)?;
        conn.execute_batch(
            "INSERT INTO patient_table (id, stable_id) VALUES (1, 'P1');
             INSERT INTO patient_attribute_table (patient_id, key, value) VALUES (1, 'k', '1');
             INSERT INTO beacon_sample_table (id, stable_id, patient_id) VALUES (1, 'S1', 1);",
        )?;
        assert_eq!(count_rows(&conn, "beacon_sample_table")?, 1);

        clear(&mut conn)?;
        for table in TABLES {
            assert_eq!(count_rows(&conn, table)?, 0);
        }
        Ok(())
    }

    #[test]
    fn foreign_keys_are_enforced() -> Result<(), anyhow::Error> {
        let conn = memory();
        ensure_schema(&conn)?;
        let result = conn.execute(
            "INSERT INTO beacon_sample_table (stable_id, patient_id) VALUES ('S1', 42)",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }
}
