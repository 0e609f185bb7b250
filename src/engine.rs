//! The boundary to the SQL engine.
//!
//! The engine itself (parsing, planning, execution) is an external
//! collaborator. These traits are everything the core asks of it; the
//! embedder supplies an implementation wired to the real engine, handing it
//! the [`BufferedFileSystem`] for its I/O.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::db::WebDBConfig;
use crate::filesystem::BufferedFileSystem;
use crate::Result;

/// A scalar bound to a prepared-statement parameter. Numbers travel as
/// doubles; the engine coerces from there.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarParam {
    Double(f64),
    Text(String),
    Bool(bool),
    Null,
}

/// Pass-through tokenizer output for editor highlighting.
#[derive(Debug, Clone, Serialize)]
pub struct TokenizeResult {
    pub offsets: Vec<u32>,
    pub types: Vec<u8>,
}

/// Options for synchronous CSV ingestion. The parsing itself is the
/// engine's; the core only validates and forwards the options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CsvInsertOptions {
    pub schema_name: Option<String>,
    #[serde(rename = "table_name", alias = "name")]
    pub table_name: Option<String>,
    pub header: Option<bool>,
    pub delimiter: Option<String>,
    pub escape: Option<String>,
    pub quote: Option<String>,
    pub skip: Option<u32>,
    pub dateformat: Option<String>,
    pub timestampformat: Option<String>,
    /// Explicit column names and engine type names, in order.
    pub columns: Option<Vec<(String, String)>>,
    pub auto_detect: Option<bool>,
}

/// The shape of a JSON document being ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JsonTableShape {
    /// `[{"a": 1}, {"a": 2}]`
    RowArray,
    /// `{"a": [1, 2]}`
    ColumnObject,
    #[default]
    #[serde(other)]
    Unrecognized,
}

/// Options for synchronous JSON ingestion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonInsertOptions {
    pub schema_name: Option<String>,
    #[serde(rename = "table_name", alias = "name")]
    pub table_name: Option<String>,
    pub table_shape: Option<JsonTableShape>,
    pub auto_detect: Option<bool>,
    pub columns: Option<Vec<(String, String)>>,
}

/// Options for streamed Arrow IPC ingestion.
#[derive(Debug, Clone, Deserialize)]
pub struct ArrowInsertOptions {
    pub schema_name: Option<String>,
    #[serde(rename = "table_name", alias = "name")]
    pub table_name: String,
    #[serde(default)]
    pub create_new: bool,
}

/// A pull-based query result: the schema up front, record batches on
/// demand.
pub trait QueryResult {
    fn schema(&self) -> SchemaRef;

    /// The next batch, or `None` once the result is exhausted.
    fn next_batch(&mut self) -> Result<Option<RecordBatch>>;
}

/// A statement prepared once and executed with varying parameters.
pub trait PreparedQuery {
    fn execute(&mut self, params: &[ScalarParam]) -> Result<Box<dyn QueryResult>>;
}

/// One session's connection into the engine.
pub trait EngineConnection {
    fn query(&mut self, sql: &str) -> Result<Box<dyn QueryResult>>;

    fn prepare(&mut self, sql: &str) -> Result<Box<dyn PreparedQuery>>;

    fn insert_csv(&mut self, path: &str, options: &CsvInsertOptions) -> Result<()>;

    fn insert_json(&mut self, path: &str, options: &JsonInsertOptions) -> Result<()>;

    /// Creates or appends to a table from fully-decoded record batches,
    /// atomically from the caller's point of view.
    fn register_batches(
        &mut self,
        schema_name: Option<&str>,
        table_name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        create_new: bool,
    ) -> Result<()>;
}

/// The engine instance: a connection factory plus the odd stateless
/// service.
pub trait QueryEngine: Send + Sync {
    fn connect(&self) -> Result<Box<dyn EngineConnection>>;

    fn tokenize(&self, text: &str) -> TokenizeResult;
}

/// Builds a fresh engine against a fresh filesystem. `WebDB::open` calls
/// this on every (re)configuration; loading baseline extensions is the
/// factory's job.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        filesystem: Arc<BufferedFileSystem>,
        config: &WebDBConfig,
    ) -> Result<Arc<dyn QueryEngine>>;
}
