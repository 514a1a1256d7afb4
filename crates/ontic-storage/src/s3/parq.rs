//! Parquet encoding of history rows.
//!
//! Every data file carries the core columns (`commit_id`, identity
//! columns, `schema_version_id`, `fields_json`) plus typed scalar columns
//! for pushdown-friendly scans. Reads only rely on the core columns;
//! `fields_json` is the complete payload.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;

use ontic_core::canonical::to_canonical_json;
use ontic_core::descriptor::{RecordKind, TypeDescriptor};
use ontic_core::error::{EngineError, Result};
use ontic_core::identity::Identity;
use ontic_core::row::StoredRow;
use ontic_core::spec::Primitive;

use crate::sqlite::layout::typed_columns;

fn arrow_type(primitive: Primitive) -> DataType {
    match primitive {
        Primitive::Int => DataType::Int64,
        Primitive::Float => DataType::Float64,
        Primitive::Bool => DataType::Boolean,
        Primitive::Str | Primitive::Datetime | Primitive::Null => DataType::Utf8,
    }
}

fn file_schema(descriptor: &TypeDescriptor) -> Arc<Schema> {
    let mut fields = vec![
        Field::new("commit_id", DataType::Int64, false),
        Field::new(
            match descriptor.kind {
                RecordKind::Entity => "entity_type",
                RecordKind::Relation => "relation_type",
            },
            DataType::Utf8,
            false,
        ),
    ];
    match descriptor.kind {
        RecordKind::Entity => fields.push(Field::new("entity_key", DataType::Utf8, false)),
        RecordKind::Relation => {
            fields.push(Field::new("left_key", DataType::Utf8, false));
            fields.push(Field::new("right_key", DataType::Utf8, false));
            fields.push(Field::new("instance_key", DataType::Utf8, false));
        }
    }
    fields.push(Field::new("schema_version_id", DataType::Int64, false));
    fields.push(Field::new("fields_json", DataType::Utf8, false));
    for (name, primitive) in typed_columns(descriptor) {
        fields.push(Field::new(&name, arrow_type(primitive), true));
    }
    Arc::new(Schema::new(fields))
}

fn typed_array(rows: &[StoredRow], name: &str, primitive: Primitive) -> ArrayRef {
    match primitive {
        Primitive::Int => {
            let values: Vec<Option<i64>> = rows
                .iter()
                .map(|r| r.fields.get(name).and_then(Value::as_i64))
                .collect();
            Arc::new(Int64Array::from(values))
        }
        Primitive::Float => {
            let values: Vec<Option<f64>> = rows
                .iter()
                .map(|r| r.fields.get(name).and_then(Value::as_f64))
                .collect();
            Arc::new(Float64Array::from(values))
        }
        Primitive::Bool => {
            let values: Vec<Option<bool>> = rows
                .iter()
                .map(|r| r.fields.get(name).and_then(Value::as_bool))
                .collect();
            Arc::new(BooleanArray::from(values))
        }
        Primitive::Str | Primitive::Datetime | Primitive::Null => {
            let values: Vec<Option<String>> = rows
                .iter()
                .map(|r| {
                    r.fields
                        .get(name)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect();
            Arc::new(StringArray::from(values))
        }
    }
}

/// Encodes rows of one type into a parquet file.
pub(crate) fn write_rows(descriptor: &TypeDescriptor, rows: &[StoredRow]) -> Result<Bytes> {
    let schema = file_schema(descriptor);

    let commit_ids: Vec<i64> = rows.iter().map(|r| r.commit_id as i64).collect();
    let type_names: Vec<&str> = rows.iter().map(|r| r.type_name.as_str()).collect();
    let versions: Vec<i64> = rows.iter().map(|r| r.schema_version_id).collect();
    let fields_json: Vec<String> = rows.iter().map(|r| to_canonical_json(&r.fields)).collect();

    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(commit_ids)),
        Arc::new(StringArray::from(type_names)),
    ];
    match descriptor.kind {
        RecordKind::Entity => {
            let keys: Vec<String> = rows
                .iter()
                .map(|r| match &r.identity {
                    Identity::Entity { key } => key.clone(),
                    Identity::Relation { .. } => String::new(),
                })
                .collect();
            arrays.push(Arc::new(StringArray::from(keys)));
        }
        RecordKind::Relation => {
            let mut lefts = Vec::with_capacity(rows.len());
            let mut rights = Vec::with_capacity(rows.len());
            let mut instances = Vec::with_capacity(rows.len());
            for row in rows {
                match &row.identity {
                    Identity::Relation {
                        left_key,
                        right_key,
                        instance_key,
                    } => {
                        lefts.push(left_key.clone());
                        rights.push(right_key.clone());
                        instances.push(instance_key.clone());
                    }
                    Identity::Entity { .. } => {
                        lefts.push(String::new());
                        rights.push(String::new());
                        instances.push(String::new());
                    }
                }
            }
            arrays.push(Arc::new(StringArray::from(lefts)));
            arrays.push(Arc::new(StringArray::from(rights)));
            arrays.push(Arc::new(StringArray::from(instances)));
        }
    }
    arrays.push(Arc::new(Int64Array::from(versions)));
    arrays.push(Arc::new(StringArray::from(fields_json)));
    for (name, primitive) in typed_columns(descriptor) {
        arrays.push(typed_array(rows, &name, primitive));
    }

    let batch = RecordBatch::try_new(Arc::clone(&schema), arrays)
        .map_err(|e| EngineError::storage(format!("record batch build failed: {e}")))?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None)
        .map_err(|e| EngineError::storage(format!("parquet writer failed: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| EngineError::storage(format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| EngineError::storage(format!("parquet close failed: {e}")))?;
    Ok(Bytes::from(buf))
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| EngineError::storage(format!("parquet file missing column `{name}`")))
}

fn int_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| EngineError::storage(format!("parquet file missing column `{name}`")))
}

/// Decodes a parquet file back into stored rows.
pub(crate) fn read_rows(kind: RecordKind, bytes: Bytes) -> Result<Vec<StoredRow>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .map_err(|e| EngineError::storage(format!("parquet open failed: {e}")))?
        .build()
        .map_err(|e| EngineError::storage(format!("parquet read failed: {e}")))?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| EngineError::storage(format!("parquet batch failed: {e}")))?;
        let commit_ids = int_col(&batch, "commit_id")?;
        let versions = int_col(&batch, "schema_version_id")?;
        let fields_json = string_col(&batch, "fields_json")?;
        let type_names = string_col(
            &batch,
            match kind {
                RecordKind::Entity => "entity_type",
                RecordKind::Relation => "relation_type",
            },
        )?;

        for i in 0..batch.num_rows() {
            let identity = match kind {
                RecordKind::Entity => Identity::Entity {
                    key: string_col(&batch, "entity_key")?.value(i).to_string(),
                },
                RecordKind::Relation => Identity::Relation {
                    left_key: string_col(&batch, "left_key")?.value(i).to_string(),
                    right_key: string_col(&batch, "right_key")?.value(i).to_string(),
                    instance_key: string_col(&batch, "instance_key")?.value(i).to_string(),
                },
            };
            out.push(StoredRow {
                kind,
                type_name: type_names.value(i).to_string(),
                identity,
                fields: serde_json::from_str(fields_json.value(i))?,
                commit_id: commit_ids.value(i) as u64,
                schema_version_id: versions.value(i),
            });
        }
    }
    Ok(out)
}
