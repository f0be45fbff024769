use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// One value of a record. Empty CSV fields read as `Null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Null,
    Text(String),
    Float(f64),
}

impl Cell {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Cell::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl From<Option<String>> for Cell {
    fn from(value: Option<String>) -> Self {
        value.map(Cell::Text).unwrap_or_default()
    }
}

/// An ordered batch of records with named, dynamically shaped columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    index: usize,
    load_id: String,
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Chunk {
    /// Rows shorter than the header are padded with nulls, longer ones are cut.
    ///
    /// The load id is fixed here, from the records as read; later column
    /// edits and enrichment do not change it.
    pub fn new(index: usize, columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let width = columns.len();
        let rows: Vec<Vec<Cell>> = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Cell::Null);
                row
            })
            .collect();
        Self {
            index,
            load_id: load_id(index, &columns, &rows),
            columns,
            rows,
        }
    }

    /// 1-based position of this chunk in the input.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Content address of the input this chunk was read from.
    pub fn load_id(&self) -> &str {
        &self.load_id
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_position(from) {
            Some(position) => {
                self.columns[position] = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Returns the position of `name`, appending an all-null column if absent.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(position) = self.column_position(name) {
            return position;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Cell::Null);
        }
        self.columns.len() - 1
    }

    pub fn cell(&self, row: usize, column: usize) -> &Cell {
        &self.rows[row][column]
    }

    pub fn set_cell(&mut self, row: usize, column: usize, value: Cell) {
        self.rows[row][column] = value;
    }

    pub fn into_parts(self) -> ChunkParts {
        ChunkParts {
            index: self.index,
            load_id: self.load_id,
            columns: self.columns,
            rows: self.rows,
        }
    }
}

pub struct ChunkParts {
    pub index: usize,
    pub load_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// SHA-256 over the chunk index, the header and every cell.
fn load_id(index: usize, columns: &[String], rows: &[Vec<Cell>]) -> String {
    fn text(hasher: &mut Sha256, value: &str) {
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }

    let mut hasher = Sha256::new();
    hasher.update((index as u64).to_le_bytes());
    hasher.update((columns.len() as u64).to_le_bytes());
    for column in columns {
        text(&mut hasher, column);
    }
    for row in rows {
        for cell in row {
            match cell {
                Cell::Null => hasher.update([0_u8]),
                Cell::Text(value) => {
                    hasher.update([1_u8]);
                    text(&mut hasher, value);
                }
                Cell::Float(value) => {
                    hasher.update([2_u8]);
                    hasher.update(value.to_bits().to_le_bytes());
                }
            }
        }
    }
    STANDARD_NO_PAD.encode(hasher.finalize())
}

/// Streams a CSV file as consecutive fixed-size chunks.
pub struct ChunkReader<R: Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    chunk_size: usize,
    next_index: usize,
    record: csv::ByteRecord,
    exhausted: bool,
}

impl ChunkReader<File> {
    pub fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AppError::Path(format!(
                "input file not found: {}",
                path.display()
            )));
        }
        Self::from_reader(File::open(path)?, chunk_size)
    }
}

impl<R: Read> ChunkReader<R> {
    pub fn from_reader(input: R, chunk_size: usize) -> AppResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(input);
        let headers: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();
        if headers.iter().all(|header| header.trim().is_empty()) {
            return Err(AppError::Input("input has no header row".into()));
        }
        Ok(Self {
            reader,
            headers,
            chunk_size: chunk_size.max(1),
            next_index: 1,
            record: csv::ByteRecord::new(),
            exhausted: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// `Ok(None)` once the input is exhausted.
    pub fn next_chunk(&mut self) -> AppResult<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.chunk_size.min(4096));
        while rows.len() < self.chunk_size {
            if !self.reader.read_byte_record(&mut self.record)? {
                self.exhausted = true;
                break;
            }
            let line = self.record.position().map(|position| position.line());
            let row = self
                .record
                .iter()
                .enumerate()
                .map(|(column, field)| decode_field(field, line, column))
                .collect();
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(None);
        }
        let chunk = Chunk::new(self.next_index, self.headers.clone(), rows);
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

/// Invalid UTF-8 is replaced rather than failing the whole input; the
/// damaged value then fails whatever parsing applies to it downstream.
fn decode_field(field: &[u8], line: Option<u64>, column: usize) -> Cell {
    if field.is_empty() {
        return Cell::Null;
    }
    match String::from_utf8_lossy(field) {
        Cow::Borrowed(text) => Cell::Text(text.to_string()),
        Cow::Owned(text) => {
            warn!(?line, column, value = %text, "replaced invalid UTF-8 in field");
            Cell::Text(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIPS: &str = "region,origin_coord,destination_coord,datetime,datasource
Prague,POINT (14.49 50.00),POINT (14.43 50.04),2018-05-28 09:03:40,funny_car
Turin,POINT (7.67 44.99),,2018-05-21 02:54:04,baba_car
Hamburg,\"53.5,10.0\",\"53.6,9.9\",2018-05-03 05:43:03
";

    #[test]
    fn splits_input_into_ordered_chunks() {
        let mut reader = ChunkReader::from_reader(TRIPS.as_bytes(), 2).unwrap();
        assert_eq!(reader.headers().len(), 5);

        let first = reader.next_chunk().unwrap().unwrap();
        assert_eq!(first.index(), 1);
        assert_eq!(first.len(), 2);
        assert_eq!(first.cell(1, 0), &Cell::Text("Turin".into()));
        assert!(first.cell(1, 2).is_null());

        let second = reader.next_chunk().unwrap().unwrap();
        assert_eq!(second.index(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second.cell(0, 1).as_text(), Some("53.5,10.0"));
        assert!(second.cell(0, 4).is_null(), "short rows are padded");

        assert!(reader.next_chunk().unwrap().is_none());
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn invalid_utf8_damages_only_its_own_field() {
        let mut input = b"region,origin_coord\nPrague,\"50.0,14.4\"\n".to_vec();
        input.extend_from_slice(b"Bad\xff,\"45.0,7.6\"\nTurin,\"45.1,7.7\"\n");
        let mut reader = ChunkReader::from_reader(input.as_slice(), 1).unwrap();

        let indexes: Vec<_> = std::iter::from_fn(|| reader.next_chunk().unwrap())
            .map(|chunk| {
                if chunk.index() == 2 {
                    assert_eq!(chunk.cell(0, 0).as_text(), Some("Bad\u{fffd}"));
                    assert_eq!(chunk.cell(0, 1).as_text(), Some("45.0,7.6"));
                }
                chunk.index()
            })
            .collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test]
    fn load_id_follows_input_not_later_edits() {
        let mut first = ChunkReader::from_reader(TRIPS.as_bytes(), 2).unwrap();
        let mut second = ChunkReader::from_reader(TRIPS.as_bytes(), 2).unwrap();
        let mut chunk = first.next_chunk().unwrap().unwrap();
        let same = second.next_chunk().unwrap().unwrap();
        let next = second.next_chunk().unwrap().unwrap();
        let original = chunk.load_id().to_string();
        assert_eq!(original, same.load_id());
        assert_ne!(original, next.load_id());

        chunk.rename_column("datetime", "departure_time");
        let city = chunk.ensure_column("origin_city");
        chunk.set_cell(0, city, Cell::Text("Prague".into()));
        assert_eq!(chunk.load_id(), original);
        assert_eq!(chunk.into_parts().load_id, original);

        let edited = TRIPS.replace("funny_car", "other_car");
        let mut changed = ChunkReader::from_reader(edited.as_bytes(), 2).unwrap();
        assert_ne!(changed.next_chunk().unwrap().unwrap().load_id(), original);
    }

    #[test]
    fn header_only_input_has_no_chunks() {
        let mut reader =
            ChunkReader::from_reader("region,origin_coord\n".as_bytes(), 10).unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn missing_file_is_a_path_error() {
        let err = ChunkReader::open("/no/such/trips.csv", 10).err().unwrap();
        assert!(matches!(err, AppError::Path(_)));
    }

    #[test]
    fn columns_can_be_renamed_and_added() {
        let mut chunk = Chunk::new(
            1,
            vec!["datetime".into()],
            vec![vec![Cell::Text("2018-05-28 09:03:40".into())]],
        );
        assert!(chunk.rename_column("datetime", "departure_time"));
        assert!(!chunk.rename_column("datetime", "departure_time"));
        assert_eq!(chunk.column_position("departure_time"), Some(0));

        let city = chunk.ensure_column("origin_city");
        assert_eq!(city, 1);
        assert_eq!(chunk.ensure_column("origin_city"), 1);
        assert!(chunk.cell(0, city).is_null());
        chunk.set_cell(0, city, Cell::Text("Prague".into()));
        assert_eq!(chunk.cell(0, city).as_text(), Some("Prague"));
    }
}
