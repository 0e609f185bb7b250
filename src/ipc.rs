//! Result marshalling into the Arrow IPC interchange formats.
//!
//! Fully materialized results use the file format (schema, batches,
//! footer); streamed results use the stream format with the schema message
//! handed out first and one encoded batch per fetch.

use std::io::{self, Cursor};
use std::sync::Arc;

use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{FileWriter, StreamWriter};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use crate::{Error, Result};

/// The stream-format end-of-stream marker: continuation sentinel plus a
/// zero-length message.
const STREAM_EOS: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
/// Pre-continuation encoding of the same.
const STREAM_EOS_LEGACY: [u8; 4] = [0, 0, 0, 0];

fn arrow_err(err: ArrowError) -> Error {
    Error::Execution(err.to_string())
}

/// A byte sink shared between an IPC writer and the code draining its
/// output message by message.
#[derive(Clone, Default)]
pub(crate) struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serializes one query result as an IPC stream, one message at a time.
pub(crate) struct StreamSerializer {
    writer: StreamWriter<SharedSink>,
    sink: SharedSink,
}

impl StreamSerializer {
    /// Creates the serializer and returns the encoded schema message.
    pub fn new(schema: &SchemaRef) -> Result<(Self, Vec<u8>)> {
        let sink = SharedSink::default();
        let writer = StreamWriter::try_new(sink.clone(), schema).map_err(arrow_err)?;
        let header = sink.drain();
        Ok((Self { writer, sink }, header))
    }

    /// Encodes one record batch message.
    pub fn write_batch(&mut self, batch: &RecordBatch) -> Result<Vec<u8>> {
        self.writer.write(batch).map_err(arrow_err)?;
        Ok(self.sink.drain())
    }
}

/// Materializes a whole result into the IPC file format.
pub(crate) fn write_ipc_file(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut writer = FileWriter::try_new(Vec::new(), schema).map_err(arrow_err)?;
    for batch in batches {
        writer.write(batch).map_err(arrow_err)?;
    }
    writer.finish().map_err(arrow_err)?;
    writer.into_inner().map_err(arrow_err)
}

/// Decodes a complete IPC stream into its schema and batches. Fails with
/// `Invalid` because the bytes come from the caller, not the engine.
pub(crate) fn read_ipc_stream(bytes: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|err| Error::invalid(format!("malformed Arrow IPC stream: {err}")))?;
    let schema = reader.schema();
    let mut batches = Vec::new();
    for batch in reader {
        batches
            .push(batch.map_err(|err| Error::invalid(format!("malformed Arrow IPC stream: {err}")))?);
    }
    Ok((schema, batches))
}

/// Whether the buffered stream bytes end in an end-of-stream marker, or the
/// latest append was itself a bare marker (or empty, the third way hosts
/// signal completion).
pub(crate) fn ipc_stream_finished(buffered: &[u8], appended: &[u8]) -> bool {
    (!buffered.is_empty() && appended.is_empty())
        || appended == STREAM_EOS_LEGACY
        || buffered.ends_with(&STREAM_EOS)
}

/// Rewrites every 64-bit integer column to double precision, returning
/// `None` when the schema has nothing to rewrite.
///
/// Values beyond 2^53 lose precision in the conversion; that truncation is
/// the documented contract for hosts without a native 64-bit integer.
pub(crate) fn patch_schema(schema: &SchemaRef) -> Option<SchemaRef> {
    let needs_patch = schema
        .fields()
        .iter()
        .any(|f| matches!(f.data_type(), DataType::Int64 | DataType::UInt64));
    if !needs_patch {
        return None;
    }
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| match f.data_type() {
            DataType::Int64 | DataType::UInt64 => {
                f.as_ref().clone().with_data_type(DataType::Float64)
            }
            _ => f.as_ref().clone(),
        })
        .collect();
    Some(Arc::new(Schema::new_with_metadata(
        fields,
        schema.metadata().clone(),
    )))
}

/// Casts a batch's 64-bit integer columns to match a patched schema.
pub(crate) fn patch_batch(batch: &RecordBatch, patched: &SchemaRef) -> Result<RecordBatch> {
    let columns = batch
        .columns()
        .iter()
        .zip(patched.fields())
        .map(|(column, field)| {
            if column.data_type() == field.data_type() {
                Ok(column.clone())
            } else {
                cast(column, field.data_type()).map_err(arrow_err)
            }
        })
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(patched.clone(), columns).map_err(arrow_err)
}

#[cfg(test)]
mod tests {
    use arrow::array::{Array, Float64Array, Int64Array, StringArray};

    use super::*;

    fn bigint_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("n", DataType::Int64, false),
            Field::new("s", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1i64 << 31, (1i64 << 54) + 1])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn file_roundtrip_through_stream_reader() {
        let batch = bigint_batch();
        let bytes = write_ipc_file(&batch.schema(), &[batch.clone()]).unwrap();
        let reader =
            arrow::ipc::reader::FileReader::try_new(Cursor::new(bytes), None).unwrap();
        let read: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], batch);
    }

    #[test]
    fn stream_serializer_emits_schema_then_batches() {
        let batch = bigint_batch();
        let (mut serializer, header) = StreamSerializer::new(&batch.schema()).unwrap();
        assert!(!header.is_empty());
        let message = serializer.write_batch(&batch).unwrap();
        assert!(!message.is_empty());

        let mut stream = header;
        stream.extend_from_slice(&message);
        let (schema, batches) = read_ipc_stream(&stream).unwrap();
        assert_eq!(schema, batch.schema());
        assert_eq!(batches, vec![batch]);
    }

    #[test]
    fn bigint_columns_become_doubles() {
        let batch = bigint_batch();
        let patched = patch_schema(&batch.schema()).expect("Int64 column needs patching");
        assert_eq!(patched.field(0).data_type(), &DataType::Float64);
        assert_eq!(patched.field(1).data_type(), &DataType::Utf8);

        let patched_batch = patch_batch(&batch, &patched).unwrap();
        let doubles = patched_batch
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        // 2^31 survives exactly; 2^54 + 1 is allowed to round.
        assert_eq!(doubles.value(0), (1i64 << 31) as f64);
        assert_eq!(doubles.value(1), ((1i64 << 54) + 1) as f64);
    }

    #[test]
    fn double_only_schema_needs_no_patch() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "x",
            DataType::Float64,
            false,
        )]));
        assert!(patch_schema(&schema).is_none());
    }

    #[test]
    fn eos_detection() {
        assert!(ipc_stream_finished(b"data", b""));
        assert!(!ipc_stream_finished(b"", b""));
        assert!(ipc_stream_finished(b"data", &STREAM_EOS_LEGACY));
        let mut buffered = b"data".to_vec();
        buffered.extend_from_slice(&STREAM_EOS);
        assert!(ipc_stream_finished(&buffered, &STREAM_EOS));
    }
}
