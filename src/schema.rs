use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Timelike};
use tracing::debug;

use crate::chunk::{Cell, Chunk, ChunkParts};

const TIMESTAMP_INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Varchar,
    Timestamp,
    Float,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Float => "FLOAT",
        }
    }

    fn coerce(&self, cell: Cell) -> Cell {
        match (self, cell) {
            (ColumnType::Float, Cell::Text(text)) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Cell::Float)
                .unwrap_or_default(),
            (ColumnType::Timestamp, Cell::Text(text)) => Cell::Text(canonical_timestamp(&text)),
            (ColumnType::Varchar | ColumnType::Timestamp, Cell::Float(value)) => {
                Cell::Text(value.to_string())
            }
            (_, cell) => cell,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
}

const fn column(name: &'static str, column_type: ColumnType) -> ColumnDef {
    ColumnDef { name, column_type }
}

/// A destination table: the single definition behind table creation, chunk
/// normalization and inserts.
#[derive(Debug)]
pub struct TableSchema {
    pub table: &'static str,
    pub columns: &'static [ColumnDef],
}

pub static TRIPS: TableSchema = TableSchema {
    table: "TRIPS",
    columns: &[
        column("REGION", ColumnType::Varchar),
        column("ORIGIN_COORD", ColumnType::Varchar),
        column("DESTINATION_COORD", ColumnType::Varchar),
        column("DEPARTURE_TIME", ColumnType::Timestamp),
        column("DATASOURCE", ColumnType::Varchar),
        column("ORIGIN_CITY", ColumnType::Varchar),
        column("ORIGIN_COUNTRY", ColumnType::Varchar),
        column("ORIGIN_LATITUDE", ColumnType::Float),
        column("ORIGIN_LONGITUDE", ColumnType::Float),
        column("DESTINATION_CITY", ColumnType::Varchar),
        column("DESTINATION_COUNTRY", ColumnType::Varchar),
        column("DESTINATION_LATITUDE", ColumnType::Float),
        column("DESTINATION_LONGITUDE", ColumnType::Float),
    ],
};

/// A chunk reshaped to exactly the columns of its schema, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedChunk {
    pub index: usize,
    /// Carried over from the input chunk; identifies the load.
    pub load_id: String,
    pub rows: Vec<Vec<Cell>>,
}

impl NormalizedChunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl TableSchema {
    /// Destination identifiers are upper case.
    pub fn canonical_name(name: &str) -> String {
        name.trim().to_ascii_uppercase()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|column| column.name)
    }

    pub fn column_list(&self) -> String {
        self.column_names().collect::<Vec<_>>().join(", ")
    }

    pub fn column_definitions(&self) -> String {
        self.columns
            .iter()
            .map(|column| format!("{} {}", column.name, column.column_type.sql_type()))
            .collect::<Vec<_>>()
            .join(",\n    ")
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.table,
            self.column_definitions()
        )
    }

    /// Re-cases column names, keeps schema columns in schema order, drops
    /// the rest and fills missing ones with nulls. On case-insensitive
    /// duplicates the first column wins.
    pub fn normalize(&self, chunk: Chunk) -> NormalizedChunk {
        let ChunkParts {
            index,
            load_id,
            columns,
            rows,
        } = chunk.into_parts();

        let mut positions: HashMap<String, usize> = HashMap::with_capacity(columns.len());
        for (position, name) in columns.iter().enumerate() {
            positions
                .entry(Self::canonical_name(name))
                .or_insert(position);
        }

        let mapping: Vec<Option<usize>> = self
            .column_names()
            .map(|name| positions.get(name).copied())
            .collect();

        let dropped: Vec<&str> = columns
            .iter()
            .enumerate()
            .filter(|(position, _)| !mapping.contains(&Some(*position)))
            .map(|(_, name)| name.as_str())
            .collect();
        if !dropped.is_empty() {
            debug!(chunk = index, ?dropped, "discarding columns outside the schema");
        }

        let rows = rows
            .into_iter()
            .map(|mut row| {
                mapping
                    .iter()
                    .zip(self.columns)
                    .map(|(source, column)| {
                        let cell = source
                            .map(|position| std::mem::take(&mut row[position]))
                            .unwrap_or_default();
                        column.column_type.coerce(cell)
                    })
                    .collect()
            })
            .collect();

        NormalizedChunk {
            index,
            load_id,
            rows,
        }
    }
}

/// Rewrites common timestamp layouts as `YYYY-MM-DD HH:MM:SS[.fff]`; anything
/// else is returned unchanged.
pub fn canonical_timestamp(value: &str) -> String {
    let trimmed = value.trim();
    let parsed = DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| {
            TIMESTAMP_INPUT_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        });

    match parsed {
        Some(dt) if dt.nanosecond() == 0 => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Cell {
        Cell::Text(value.to_string())
    }

    #[test]
    fn create_table_lists_every_column_once() {
        let sql = TRIPS.create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS TRIPS"));
        assert!(sql.contains("DEPARTURE_TIME TIMESTAMP"));
        assert!(sql.contains("ORIGIN_LATITUDE FLOAT"));
        assert_eq!(TRIPS.width(), 13);
        assert_eq!(sql.matches(',').count(), 12);
    }

    #[test]
    fn normalize_emits_schema_columns_in_order() {
        let chunk = Chunk::new(
            3,
            vec![
                "origin_city".into(),
                "Region".into(),
                "unused".into(),
                "ORIGIN_LATITUDE".into(),
                "departure_time".into(),
                "region".into(),
            ],
            vec![vec![
                text("Prague"),
                text("Prague region"),
                text("drop me"),
                Cell::Float(50.0),
                text("2018-05-28T09:03:40"),
                text("shadowed"),
            ]],
        );

        let load_id = chunk.load_id().to_string();
        let normalized = TRIPS.normalize(chunk);
        assert_eq!(normalized.index, 3);
        assert_eq!(normalized.load_id, load_id);
        assert_eq!(normalized.len(), 1);
        let row = &normalized.rows[0];
        assert_eq!(row.len(), 13);
        assert_eq!(row[0], text("Prague region"));
        assert_eq!(row[3], text("2018-05-28 09:03:40"));
        assert_eq!(row[5], text("Prague"));
        assert_eq!(row[7], Cell::Float(50.0));
        assert!(row[1].is_null());
        assert!(row[12].is_null());
        assert!(!row.contains(&text("drop me")));
    }

    #[test]
    fn normalize_pads_an_empty_shape() {
        let chunk = Chunk::new(1, vec!["something".into()], vec![vec![text("x")]; 4]);
        let normalized = TRIPS.normalize(chunk);
        assert_eq!(normalized.len(), 4);
        assert!(normalized
            .rows
            .iter()
            .all(|row| row.len() == 13 && row.iter().all(Cell::is_null)));
    }

    #[test]
    fn float_columns_coerce_text() {
        assert_eq!(ColumnType::Float.coerce(text(" 40.5 ")), Cell::Float(40.5));
        assert_eq!(ColumnType::Float.coerce(text("north")), Cell::Null);
        assert_eq!(ColumnType::Varchar.coerce(Cell::Float(1.5)), text("1.5"));
    }

    #[test]
    fn timestamps_are_canonicalized_when_recognized() {
        assert_eq!(
            canonical_timestamp("2018-05-28 09:03:40"),
            "2018-05-28 09:03:40"
        );
        assert_eq!(
            canonical_timestamp("2018-05-28T09:03:40+02:00"),
            "2018-05-28 07:03:40"
        );
        assert_eq!(
            canonical_timestamp("2018-05-28 09:03:40.250"),
            "2018-05-28 09:03:40.250"
        );
        assert_eq!(canonical_timestamp("last tuesday"), "last tuesday");
    }
}
