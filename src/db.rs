use std::path::{Path, PathBuf};

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, ToSql};
use tracing::{debug, info};

use crate::chunk::Cell;
use crate::config::DEFAULT_WRITE_BATCH_SIZE;
use crate::errors::{AppError, AppResult};
use crate::schema::{NormalizedChunk, TableSchema, TRIPS};
use crate::store::{LoadError, TripStore, WriteOutcome};

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(Value::Null),
            Cell::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            Cell::Float(value) => ToSqlOutput::Owned(Value::Real(*value)),
        })
    }
}

/// SQLite destination. Chunks are staged in `<TABLE>_STAGE`, promoted in one
/// transaction, and recorded in the `<TABLE>_LOADS` ledger so a repeated
/// load of the same chunk is a no-op.
pub struct SqliteTripStore {
    connection: Connection,
    path: Option<PathBuf>,
    schema: &'static TableSchema,
    write_batch_size: usize,
}

impl SqliteTripStore {
    pub fn open<P: AsRef<Path>>(path: P, write_batch_size: usize) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(path, flags)?;
        configure(&connection)?;
        info!(
            target: "trip_store",
            path = %path.display(),
            "destination database opened"
        );
        Ok(Self {
            connection,
            path: Some(path.to_path_buf()),
            schema: &TRIPS,
            write_batch_size: write_batch_size.max(1),
        })
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        configure(&connection)?;
        Ok(Self {
            connection,
            path: None,
            schema: &TRIPS,
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
        })
    }

    pub fn with_write_batch_size(mut self, write_batch_size: usize) -> Self {
        self.write_batch_size = write_batch_size.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn row_count(&self) -> AppResult<i64> {
        self.count(self.schema.table)
    }

    pub fn staged_row_count(&self) -> AppResult<i64> {
        self.count(&self.stage_table())
    }

    fn count(&self, table: &str) -> AppResult<i64> {
        self.connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .map_err(AppError::from)
    }

    fn stage_table(&self) -> String {
        format!("{}_STAGE", self.schema.table)
    }

    fn ledger_table(&self) -> String {
        format!("{}_LOADS", self.schema.table)
    }

    fn stage_rows(&mut self, load_id: &str, chunk: &NormalizedChunk) -> Result<usize, LoadError> {
        let placeholders = (1..=self.schema.width() + 1)
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} (LOAD_ID, {}) VALUES ({placeholders})",
            self.stage_table(),
            self.schema.column_list()
        );

        let mut operations = 0;
        for batch in chunk.rows.chunks(self.write_batch_size) {
            let tx = self.connection.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&insert)?;
                for row in batch {
                    let values = std::iter::once(&load_id as &dyn ToSql)
                        .chain(row.iter().map(|cell| cell as &dyn ToSql));
                    stmt.execute(params_from_iter(values))?;
                }
            }
            tx.commit()?;
            operations += 1;
        }
        Ok(operations)
    }
}

impl TripStore for SqliteTripStore {
    fn ensure_schema(&mut self) -> AppResult<()> {
        let table = self.schema.table;
        self.connection.execute(&self.schema.create_table_sql(), [])?;
        for column in self.schema.columns {
            ensure_column(
                &self.connection,
                table,
                &format!("{} {}", column.name, column.column_type.sql_type()),
            )?;
        }

        self.connection.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {stage} (
                LOAD_ID TEXT NOT NULL,
                {definitions}
            );
            CREATE INDEX IF NOT EXISTS IDX_{stage}_LOAD ON {stage}(LOAD_ID);

            CREATE TABLE IF NOT EXISTS {ledger} (
                LOAD_ID TEXT PRIMARY KEY,
                CHUNK_INDEX INTEGER NOT NULL,
                ROW_COUNT INTEGER NOT NULL,
                LOADED_AT TEXT NOT NULL DEFAULT (DATETIME('now'))
            );
            "#,
            stage = self.stage_table(),
            ledger = self.ledger_table(),
            definitions = self.schema.column_definitions(),
        ))?;

        for column in self.schema.column_names() {
            if !column_exists(&self.connection, table, column)? {
                return Err(AppError::Schema(format!("{table} is missing column {column}")));
            }
        }
        debug!(target: "trip_store", table, "destination schema ensured");
        Ok(())
    }

    fn bulk_append(&mut self, chunk: &NormalizedChunk) -> Result<WriteOutcome, LoadError> {
        let expected = self.schema.width();
        if let Some(row) = chunk.rows.iter().find(|row| row.len() != expected) {
            return Err(LoadError::Shape {
                expected,
                found: row.len(),
            });
        }

        let load_id = chunk.load_id.as_str();
        let seen: Option<i64> = self
            .connection
            .query_row(
                &format!("SELECT ROW_COUNT FROM {} WHERE LOAD_ID = ?1", self.ledger_table()),
                [&load_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(rows) = seen {
            info!(
                target: "trip_store",
                chunk = chunk.index,
                rows,
                "chunk already loaded; skipping write"
            );
            return Ok(WriteOutcome {
                already_loaded: true,
                ..WriteOutcome::default()
            });
        }

        let write_operations = self.stage_rows(load_id, chunk)?;

        let promote = format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM {stage} WHERE LOAD_ID = ?1",
            table = self.schema.table,
            columns = self.schema.column_list(),
            stage = self.stage_table(),
        );
        let record = format!(
            "INSERT INTO {} (LOAD_ID, CHUNK_INDEX, ROW_COUNT) VALUES (?1, ?2, ?3)",
            self.ledger_table()
        );

        let tx = self.connection.transaction()?;
        let rows_written = tx.execute(&promote, [load_id])?;
        tx.execute(
            &record,
            params![load_id, chunk.index as i64, rows_written as i64],
        )?;
        tx.commit()?;

        Ok(WriteOutcome {
            rows_written,
            write_operations,
            already_loaded: false,
        })
    }

    fn clear_staging(&mut self) -> AppResult<usize> {
        let stage = self.stage_table();
        let exists: Option<String> = self
            .connection
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&stage],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(0);
        }
        let removed = self.connection.execute(&format!("DELETE FROM {stage}"), [])?;
        debug!(target: "trip_store", removed, "staging area cleared");
        Ok(removed)
    }
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Schema(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    info!(target: "trip_store", table, column = column_name, "adding missing column");
    connection.execute(&format!("ALTER TABLE {table} ADD COLUMN {definition}"), [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let mut stmt = connection.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}
