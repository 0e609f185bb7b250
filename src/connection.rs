//! Per-session query execution and result streaming.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::engine::{
    ArrowInsertOptions, CsvInsertOptions, EngineConnection, JsonInsertOptions, JsonTableShape,
    PreparedQuery, QueryResult, ScalarParam,
};
use crate::filesystem::{BufferedFileSystem, OpenFlags};
use crate::ipc::{
    ipc_stream_finished, patch_batch, patch_schema, read_ipc_stream, write_ipc_file,
    StreamSerializer,
};
use crate::{Error, Result};

/// Prepared-statement ids wrap modulo 2⁶⁴ − 1; the all-ones value is the
/// sentinel and is never handed out.
const STATEMENT_ID_SENTINEL: u64 = u64::MAX;

struct QueryStream {
    result: Box<dyn QueryResult>,
    serializer: StreamSerializer,
    patched: Option<SchemaRef>,
}

struct ArrowInsertState {
    options: ArrowInsertOptions,
    buffered: Vec<u8>,
}

/// One session against the engine: queries, prepared statements, streamed
/// results and data ingestion.
///
/// At most one streamed result is live at a time; starting a new stream
/// discards the previous one. Dropping the connection cancels whatever is
/// in flight.
pub struct Connection {
    conn: Box<dyn EngineConnection>,
    filesystem: Arc<BufferedFileSystem>,
    emit_bigint: bool,
    prepared: FxHashMap<u64, Box<dyn PreparedQuery>>,
    next_statement_id: u64,
    current: Option<QueryStream>,
    arrow_insert: Option<ArrowInsertState>,
}

impl Connection {
    pub(crate) fn new(
        conn: Box<dyn EngineConnection>,
        filesystem: Arc<BufferedFileSystem>,
        emit_bigint: bool,
    ) -> Self {
        Self {
            conn,
            filesystem,
            emit_bigint,
            prepared: FxHashMap::default(),
            next_statement_id: 0,
            current: None,
            arrow_insert: None,
        }
    }

    /// Runs `sql` and materializes the whole result as an Arrow IPC file
    /// buffer (schema, batches, footer).
    pub fn run_query(&mut self, sql: &str) -> Result<Vec<u8>> {
        self.current = None;
        let mut result = self.conn.query(sql)?;
        self.materialize(result.as_mut())
    }

    /// Runs `sql` and returns the serialized schema; batches follow through
    /// [`fetch_query_results`](Self::fetch_query_results).
    pub fn send_query(&mut self, sql: &str) -> Result<Vec<u8>> {
        self.current = None;
        let result = self.conn.query(sql)?;
        self.start_stream(result)
    }

    /// One serialized record batch per call; `None` once the stream is
    /// exhausted, after which the streaming state is gone.
    pub fn fetch_query_results(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(stream) = self.current.as_mut() else {
            return Ok(None);
        };
        let batch = match stream.result.next_batch() {
            Ok(batch) => batch,
            Err(err) => {
                self.current = None;
                return Err(err);
            }
        };
        match batch {
            Some(batch) => {
                let batch = match &stream.patched {
                    Some(patched) => patch_batch(&batch, patched)?,
                    None => batch,
                };
                Ok(Some(stream.serializer.write_batch(&batch)?))
            }
            None => {
                self.current = None;
                Ok(None)
            }
        }
    }

    /// Prepares `sql`, returning the statement id.
    pub fn create_prepared(&mut self, sql: &str) -> Result<u64> {
        let statement = self.conn.prepare(sql)?;
        let id = self.allocate_statement_id();
        self.prepared.insert(id, statement);
        Ok(id)
    }

    /// Executes a prepared statement with a JSON array of scalar arguments,
    /// materializing the full result.
    pub fn run_prepared(&mut self, id: u64, args_json: &str) -> Result<Vec<u8>> {
        let params = parse_params(args_json)?;
        let statement = self
            .prepared
            .get_mut(&id)
            .ok_or_else(|| Error::key(format!("unknown prepared statement {id}")))?;
        let mut result = statement.execute(&params)?;
        self.current = None;
        self.materialize(result.as_mut())
    }

    /// Executes a prepared statement, streaming the result.
    pub fn send_prepared(&mut self, id: u64, args_json: &str) -> Result<Vec<u8>> {
        let params = parse_params(args_json)?;
        let statement = self
            .prepared
            .get_mut(&id)
            .ok_or_else(|| Error::key(format!("unknown prepared statement {id}")))?;
        let result = statement.execute(&params)?;
        self.current = None;
        self.start_stream(result)
    }

    pub fn close_prepared(&mut self, id: u64) -> Result<()> {
        self.prepared
            .remove(&id)
            .map(drop)
            .ok_or_else(|| Error::key(format!("unknown prepared statement {id}")))
    }

    /// Appends a chunk of an Arrow IPC stream destined for a table.
    ///
    /// The first call carries the options; once the stream signals its end,
    /// the decoded batches reach the engine as a single create-or-insert.
    /// Any failure clears the partial state.
    pub fn insert_arrow_ipc(&mut self, chunk: &[u8], options_json: Option<&str>) -> Result<()> {
        if self.arrow_insert.is_none() {
            let options_json = options_json
                .ok_or_else(|| Error::invalid("missing Arrow insert options"))?;
            let options: ArrowInsertOptions = serde_json::from_str(options_json)
                .map_err(|err| Error::invalid(format!("bad Arrow insert options: {err}")))?;
            self.arrow_insert = Some(ArrowInsertState {
                options,
                buffered: Vec::new(),
            });
        }
        let state = self.arrow_insert.as_mut().expect("state initialized above");
        state.buffered.extend_from_slice(chunk);
        if !ipc_stream_finished(&state.buffered, chunk) {
            return Ok(());
        }
        // Taking the state here means any decode or insert failure leaves
        // the connection reset for the next attempt.
        let state = self.arrow_insert.take().expect("state initialized above");
        let (schema, batches) = read_ipc_stream(&state.buffered)?;
        self.conn.register_batches(
            state.options.schema_name.as_deref(),
            &state.options.table_name,
            schema,
            batches,
            state.options.create_new,
        )
    }

    /// Synchronous CSV ingestion of a registered file.
    pub fn insert_csv(&mut self, path: &str, options_json: &str) -> Result<()> {
        let options: CsvInsertOptions = serde_json::from_str(options_json)
            .map_err(|err| Error::invalid(format!("bad CSV insert options: {err}")))?;
        if options.table_name.is_none() {
            return Err(Error::invalid("missing 'name' option"));
        }
        self.conn.insert_csv(path, &options)
    }

    /// Synchronous JSON ingestion. An unrecognized or absent table shape is
    /// inferred from a look at the head of the document before the engine
    /// reads it for real.
    pub fn insert_json(&mut self, path: &str, options_json: &str) -> Result<()> {
        let mut options: JsonInsertOptions = serde_json::from_str(options_json)
            .map_err(|err| Error::invalid(format!("bad JSON insert options: {err}")))?;
        if options.table_name.is_none() {
            return Err(Error::invalid("missing 'name' option"));
        }
        if options
            .table_shape
            .is_none_or(|shape| shape == JsonTableShape::Unrecognized)
        {
            options.table_shape = Some(self.infer_json_shape(path)?);
        }
        self.conn.insert_json(path, &options)
    }

    fn infer_json_shape(&self, path: &str) -> Result<JsonTableShape> {
        let handle = self.filesystem.open(path, OpenFlags::default())?;
        let mut head = [0u8; 1024];
        let n = self.filesystem.read_at(&handle, &mut head, 0)?;
        let shape = head[..n]
            .iter()
            .copied()
            .find(|b| !b.is_ascii_whitespace())
            .map(|b| match b {
                b'[' => JsonTableShape::RowArray,
                b'{' => JsonTableShape::ColumnObject,
                _ => JsonTableShape::Unrecognized,
            })
            .unwrap_or(JsonTableShape::Unrecognized);
        Ok(shape)
    }

    fn start_stream(&mut self, result: Box<dyn QueryResult>) -> Result<Vec<u8>> {
        let schema = result.schema();
        let patched = if self.emit_bigint {
            None
        } else {
            patch_schema(&schema)
        };
        let (serializer, header) =
            StreamSerializer::new(patched.as_ref().unwrap_or(&schema))?;
        self.current = Some(QueryStream {
            result,
            serializer,
            patched,
        });
        Ok(header)
    }

    fn materialize(&self, result: &mut dyn QueryResult) -> Result<Vec<u8>> {
        let schema = result.schema();
        let patched = if self.emit_bigint {
            None
        } else {
            patch_schema(&schema)
        };
        let out_schema = patched.clone().unwrap_or_else(|| schema.clone());
        let mut batches = Vec::new();
        while let Some(batch) = result.next_batch()? {
            batches.push(match &patched {
                Some(patched) => patch_batch(&batch, patched)?,
                None => batch,
            });
        }
        write_ipc_file(&out_schema, &batches)
    }

    fn allocate_statement_id(&mut self) -> u64 {
        loop {
            let id = self.next_statement_id;
            self.next_statement_id = self.next_statement_id.wrapping_add(1);
            if self.next_statement_id == STATEMENT_ID_SENTINEL {
                self.next_statement_id = 0;
            }
            if !self.prepared.contains_key(&id) {
                return id;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_next_statement_id(&mut self, id: u64) {
        self.next_statement_id = id;
    }
}

/// Parses a JSON array of scalar arguments. Numbers become lossless
/// doubles; nested arrays and objects are rejected.
fn parse_params(args_json: &str) -> Result<Vec<ScalarParam>> {
    let value: Value = serde_json::from_str(args_json)
        .map_err(|err| Error::invalid(format!("bad argument list: {err}")))?;
    let Value::Array(items) = value else {
        return Err(Error::invalid("arguments must be a JSON array"));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Number(n) => n
                .as_f64()
                .map(ScalarParam::Double)
                .ok_or_else(|| Error::invalid(format!("invalid column type for argument {i}"))),
            Value::String(s) => Ok(ScalarParam::Text(s)),
            Value::Bool(b) => Ok(ScalarParam::Bool(b)),
            Value::Null => Ok(ScalarParam::Null),
            Value::Array(_) | Value::Object(_) => {
                Err(Error::invalid(format!("invalid column type for argument {i}")))
            }
        })
        .collect()
}
