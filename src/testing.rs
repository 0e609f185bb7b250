//! Deterministic in-memory host runtime and query engine for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::engine::{
    CsvInsertOptions, EngineConnection, EngineFactory, JsonInsertOptions, PreparedQuery,
    QueryEngine, QueryResult, ScalarParam, TokenizeResult,
};
use crate::filesystem::BufferedFileSystem;
use crate::host::{HostFile, HostRuntime, OpenedFile};
use crate::registry::{glob_to_regex, DataProtocol, FileId};
use crate::{Error, Result, WebDBConfig};

struct HttpSource {
    body: Vec<u8>,
    ranged: bool,
}

enum MockHandle {
    Native(String),
    Http(String),
}

/// An in-memory host: native files are byte vectors keyed by path, HTTP
/// sources are byte vectors keyed by url with or without range support.
#[derive(Default)]
pub(crate) struct MockHost {
    native: Mutex<FxHashMap<String, Vec<u8>>>,
    http: Mutex<FxHashMap<String, HttpSource>>,
    handles: Mutex<FxHashMap<FileId, MockHandle>>,
    host_reads: AtomicUsize,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_native(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.native.lock().insert(path.to_owned(), bytes.into());
    }

    pub fn native_contents(&self, path: &str) -> Option<Vec<u8>> {
        self.native.lock().get(path).cloned()
    }

    pub fn put_http(&self, url: &str, bytes: impl Into<Vec<u8>>, ranged: bool) {
        self.http.lock().insert(
            url.to_owned(),
            HttpSource {
                body: bytes.into(),
                ranged,
            },
        );
    }

    pub fn reads(&self) -> usize {
        self.host_reads.load(Ordering::Relaxed)
    }
}

impl HostRuntime for MockHost {
    fn open(&self, file: &HostFile) -> Result<OpenedFile> {
        match file.protocol {
            DataProtocol::Http => {
                let url = file
                    .data_url
                    .clone()
                    .ok_or_else(|| Error::invalid("HTTP file without a url"))?;
                let http = self.http.lock();
                let source = http.get(&url).ok_or_else(|| Error::Http {
                    code: 404,
                    message: format!("no such url {url}"),
                })?;
                if source.ranged {
                    let size = source.body.len() as u64;
                    drop(http);
                    self.handles.lock().insert(file.file_id, MockHandle::Http(url));
                    Ok(OpenedFile {
                        file_size: size,
                        inline_buffer: None,
                    })
                } else if file.allow_full_http_reads {
                    Ok(OpenedFile {
                        file_size: source.body.len() as u64,
                        inline_buffer: Some(source.body.clone()),
                    })
                } else {
                    Err(Error::Http {
                        code: 200,
                        message: format!("server does not accept range requests: {url}"),
                    })
                }
            }
            DataProtocol::Native => {
                let path = file.location().to_owned();
                let size = {
                    let mut native = self.native.lock();
                    native.entry(path.clone()).or_default().len() as u64
                };
                self.handles
                    .lock()
                    .insert(file.file_id, MockHandle::Native(path));
                Ok(OpenedFile {
                    file_size: size,
                    inline_buffer: None,
                })
            }
            DataProtocol::Buffer => Err(Error::invalid("BUFFER files never reach the host")),
        }
    }

    fn close(&self, file_id: FileId) {
        self.handles.lock().remove(&file_id);
    }

    fn sync(&self, _file_id: FileId) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, file_id: FileId, new_size: u64) -> Result<()> {
        let handles = self.handles.lock();
        match handles.get(&file_id) {
            Some(MockHandle::Native(path)) => {
                let mut native = self.native.lock();
                let contents = native.get_mut(path).expect("open file exists");
                contents.resize(new_size as usize, 0);
                Ok(())
            }
            Some(MockHandle::Http(_)) => Err(Error::not_supported("truncating HTTP sources")),
            None => Err(Error::key(format!("unknown file id {file_id}"))),
        }
    }

    fn last_modified(&self, _file_id: FileId) -> Result<i64> {
        Ok(1_700_000_000)
    }

    fn read(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.host_reads.fetch_add(1, Ordering::Relaxed);
        let handles = self.handles.lock();
        let contents;
        match handles.get(&file_id) {
            Some(MockHandle::Native(path)) => {
                contents = self.native.lock().get(path).cloned().unwrap_or_default();
            }
            Some(MockHandle::Http(url)) => {
                contents = self
                    .http
                    .lock()
                    .get(url)
                    .map(|s| s.body.clone())
                    .unwrap_or_default();
            }
            None => return Err(Error::key(format!("unknown file id {file_id}"))),
        }
        if offset >= contents.len() as u64 {
            return Ok(0);
        }
        let n = buf.len().min(contents.len() - offset as usize);
        buf[..n].copy_from_slice(&contents[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn write(&self, file_id: FileId, buf: &[u8], offset: u64) -> Result<usize> {
        let handles = self.handles.lock();
        match handles.get(&file_id) {
            Some(MockHandle::Native(path)) => {
                let mut native = self.native.lock();
                let contents = native.get_mut(path).expect("open file exists");
                let end = offset as usize + buf.len();
                if end > contents.len() {
                    contents.resize(end, 0);
                }
                contents[offset as usize..end].copy_from_slice(buf);
                Ok(buf.len())
            }
            Some(MockHandle::Http(_)) => Err(Error::not_supported("writes to HTTP sources")),
            None => Err(Error::key(format!("unknown file id {file_id}"))),
        }
    }

    fn dir_exists(&self, _path: &str) -> bool {
        false
    }

    fn dir_create(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn dir_remove(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn list_files(&self, _path: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn file_exists(&self, path: &str) -> bool {
        self.native.lock().contains_key(path)
    }

    fn file_move(&self, from: &str, to: &str) -> Result<()> {
        let mut native = self.native.lock();
        let contents = native
            .remove(from)
            .ok_or_else(|| Error::key(format!("unknown file {from}")))?;
        native.insert(to.to_owned(), contents);
        Ok(())
    }

    fn glob(&self, pattern: &str) -> Vec<String> {
        let Ok(matcher) = glob_to_regex(pattern) else {
            return Vec::new();
        };
        self.native
            .lock()
            .keys()
            .filter(|name| matcher.is_match(name))
            .cloned()
            .collect()
    }
}

pub(crate) fn int32_batch(name: &str, values: Vec<i32>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int32, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values)) as ArrayRef]).unwrap()
}

pub(crate) fn int64_batch(name: &str, values: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values)) as ArrayRef]).unwrap()
}

struct CannedResult {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

#[derive(Default)]
struct MockEngineState {
    /// Results served to the next queries, front first. An empty queue
    /// serves the default single-value batch.
    canned: Vec<CannedResult>,
    fail_next: Option<String>,
    pub csv_inserts: Vec<(String, Option<String>)>,
    pub json_inserts: Vec<(String, JsonInsertOptions)>,
    pub tables: FxHashMap<String, (SchemaRef, Vec<RecordBatch>, bool)>,
}

/// A canned engine: serves queued results, sums prepared-statement
/// arguments, and records ingest calls.
#[derive(Default)]
pub(crate) struct MockEngine {
    state: Arc<Mutex<MockEngineState>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_result(&self, batches: Vec<RecordBatch>) {
        let schema = batches.first().expect("at least one batch").schema();
        self.state.lock().canned.push(CannedResult { schema, batches });
    }

    pub fn fail_next_query(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_owned());
    }

    pub fn csv_inserts(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().csv_inserts.clone()
    }

    pub fn json_inserts(&self) -> Vec<(String, JsonInsertOptions)> {
        self.state.lock().json_inserts.clone()
    }

    pub fn table(&self, name: &str) -> Option<(SchemaRef, Vec<RecordBatch>, bool)> {
        self.state.lock().tables.get(name).cloned()
    }
}

struct MockResult {
    schema: SchemaRef,
    batches: std::vec::IntoIter<RecordBatch>,
}

impl QueryResult for MockResult {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        Ok(self.batches.next())
    }
}

struct MockPrepared {
    state: Arc<Mutex<MockEngineState>>,
}

impl PreparedQuery for MockPrepared {
    /// Sums numeric arguments into one Float64 cell, the way a `?+?`
    /// statement would.
    fn execute(&mut self, params: &[ScalarParam]) -> Result<Box<dyn QueryResult>> {
        if let Some(message) = self.state.lock().fail_next.take() {
            return Err(Error::Execution(message));
        }
        let sum: f64 = params
            .iter()
            .map(|p| match p {
                ScalarParam::Double(v) => *v,
                _ => 0.0,
            })
            .sum();
        let schema = Arc::new(Schema::new(vec![Field::new(
            "sum",
            DataType::Float64,
            false,
        )]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Float64Array::from(vec![sum])) as ArrayRef],
        )
        .map_err(|err| Error::Execution(err.to_string()))?;
        Ok(Box::new(MockResult {
            schema,
            batches: vec![batch].into_iter(),
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockEngineState>>,
}

impl EngineConnection for MockConnection {
    fn query(&mut self, _sql: &str) -> Result<Box<dyn QueryResult>> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(Error::Execution(message));
        }
        let canned = if state.canned.is_empty() {
            let batch = int32_batch("v", vec![42]);
            CannedResult {
                schema: batch.schema(),
                batches: vec![batch],
            }
        } else {
            state.canned.remove(0)
        };
        Ok(Box::new(MockResult {
            schema: canned.schema,
            batches: canned.batches.into_iter(),
        }))
    }

    fn prepare(&mut self, _sql: &str) -> Result<Box<dyn PreparedQuery>> {
        Ok(Box::new(MockPrepared {
            state: self.state.clone(),
        }))
    }

    fn insert_csv(&mut self, path: &str, options: &CsvInsertOptions) -> Result<()> {
        self.state
            .lock()
            .csv_inserts
            .push((path.to_owned(), options.table_name.clone()));
        Ok(())
    }

    fn insert_json(&mut self, path: &str, options: &JsonInsertOptions) -> Result<()> {
        self.state
            .lock()
            .json_inserts
            .push((path.to_owned(), options.clone()));
        Ok(())
    }

    fn register_batches(
        &mut self,
        _schema_name: Option<&str>,
        table_name: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        create_new: bool,
    ) -> Result<()> {
        self.state
            .lock()
            .tables
            .insert(table_name.to_owned(), (schema, batches, create_new));
        Ok(())
    }
}

impl QueryEngine for MockEngine {
    fn connect(&self) -> Result<Box<dyn EngineConnection>> {
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
        }))
    }

    fn tokenize(&self, text: &str) -> TokenizeResult {
        let mut offsets = Vec::new();
        let mut types = Vec::new();
        let mut in_token = false;
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                in_token = false;
            } else if !in_token {
                offsets.push(i as u32);
                types.push(0);
                in_token = true;
            }
        }
        TokenizeResult { offsets, types }
    }
}

/// Hands the same engine instance out for every (re)configuration.
pub(crate) struct MockEngineFactory {
    pub engine: Arc<MockEngine>,
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        _filesystem: Arc<BufferedFileSystem>,
        _config: &WebDBConfig,
    ) -> Result<Arc<dyn QueryEngine>> {
        Ok(self.engine.clone())
    }
}
