//! Append-log write path.
//!
//! Streams are encoded into records keyed by tenant, each record carrying a
//! bincode-serialized [`Stream`] holding a contiguous run of the stream's
//! entries. Records never exceed the configured maximum size; an entry that
//! cannot fit on its own fails the whole stream.

use crate::error::{DistributorError, EncodeError, ProduceError};
use crate::metrics::DistributorMetrics;
use crate::ring::PartitionRing;
use crate::stream::{Entry, KeyedStream, Stream};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One append-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Destination partition.
    pub partition: i32,
    /// Record key (tenant id).
    pub key: Vec<u8>,
    /// Serialized stream.
    pub value: Vec<u8>,
}

/// Outcome of producing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResult {
    /// Size of the record value in bytes.
    pub record_size: usize,
    /// Error, if the record was not written.
    pub error: Option<ProduceError>,
}

impl ProduceResult {
    /// A successful result.
    pub fn ok(record_size: usize) -> Self {
        Self {
            record_size,
            error: None,
        }
    }

    /// A failed result.
    pub fn failed(record_size: usize, error: ProduceError) -> Self {
        Self {
            record_size,
            error: Some(error),
        }
    }
}

/// Synchronous producer for the append log.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Write all records and wait for every acknowledgement. Returns one
    /// result per record, in order.
    async fn produce_sync(&self, records: Vec<Record>) -> Vec<ProduceResult>;
}

/// Encode a stream into records no larger than `max_record_size` bytes.
pub fn encode(
    partition: i32,
    tenant_id: &str,
    stream: &Stream,
    max_record_size: usize,
) -> Result<Vec<Record>, EncodeError> {
    let header = Stream {
        labels: stream.labels.clone(),
        hash: stream.hash,
        entries: Vec::new(),
    };
    let base_size = bincode::serialized_size(&header)? as usize;

    let mut records = Vec::new();
    let mut batch: Vec<Entry> = Vec::new();
    let mut batch_size = base_size;

    for entry in &stream.entries {
        let entry_size = bincode::serialized_size(entry)? as usize;
        if base_size + entry_size > max_record_size {
            return Err(EncodeError::EntryTooLarge {
                size: entry_size,
                max: max_record_size,
            });
        }
        if batch_size + entry_size > max_record_size {
            records.push(record_for(partition, tenant_id, &header, std::mem::take(&mut batch))?);
            batch_size = base_size;
        }
        batch.push(entry.clone());
        batch_size += entry_size;
    }
    if !batch.is_empty() {
        records.push(record_for(partition, tenant_id, &header, batch)?);
    }
    Ok(records)
}

fn record_for(
    partition: i32,
    tenant_id: &str,
    header: &Stream,
    entries: Vec<Entry>,
) -> Result<Record, EncodeError> {
    let chunk = Stream {
        labels: header.labels.clone(),
        hash: header.hash,
        entries,
    };
    Ok(Record {
        partition,
        key: tenant_id.as_bytes().to_vec(),
        value: bincode::serialize(&chunk)?,
    })
}

/// Decode a record back into its tenant and stream.
pub fn decode(record: &Record) -> Result<(String, Stream), EncodeError> {
    let stream: Stream = bincode::deserialize(&record.value)?;
    Ok((String::from_utf8_lossy(&record.key).into_owned(), stream))
}

/// Writes keyed streams to their partitions.
pub struct AppendLogWriter {
    producer: Arc<dyn LogProducer>,
    metrics: DistributorMetrics,
    max_record_size: usize,
}

impl AppendLogWriter {
    /// Create a writer.
    pub fn new(
        producer: Arc<dyn LogProducer>,
        metrics: DistributorMetrics,
        max_record_size: usize,
    ) -> Self {
        Self {
            producer,
            metrics,
            max_record_size,
        }
    }

    /// Write one stream to the active partition owning its key.
    pub async fn write_stream(
        &self,
        subring: &PartitionRing,
        tenant_id: &str,
        stream: &KeyedStream,
    ) -> Result<(), DistributorError> {
        if stream.stream.entries.is_empty() {
            return Ok(());
        }

        let partition = match subring.active_partition_for_key(stream.hash_key) {
            Ok(p) => p,
            Err(e) => {
                self.metrics
                    .kafka_appends
                    .with_label_values(&["kafka", "fail"])
                    .inc();
                return Err(DistributorError::AppendLog {
                    msg: format!("failed to find active partition for stream: {e}"),
                });
            }
        };
        let partition_label = format!("partition_{partition}");

        let start = Instant::now();
        let records = encode(partition, tenant_id, &stream.stream, self.max_record_size).map_err(
            |e| {
                self.metrics
                    .kafka_appends
                    .with_label_values(&[partition_label.as_str(), "fail"])
                    .inc();
                DistributorError::AppendLog {
                    msg: format!("failed to marshal write request to records: {e}"),
                }
            },
        )?;
        self.metrics
            .kafka_records_per_request
            .observe(records.len() as f64);

        let results = self.producer.produce_sync(records).await;

        let (written, written_bytes) = results
            .iter()
            .filter(|r| r.error.is_none())
            .fold((0usize, 0usize), |(n, b), r| (n + 1, b + r.record_size));
        if written > 0 {
            self.metrics
                .kafka_write_latency
                .observe(start.elapsed().as_secs_f64());
            self.metrics.kafka_write_bytes.inc_by(written_bytes as u64);
        }

        let mut last_err = None;
        for result in results {
            match result.error {
                Some(err) => {
                    self.metrics
                        .kafka_appends
                        .with_label_values(&[partition_label.as_str(), "fail"])
                        .inc();
                    last_err = Some(err);
                }
                None => {
                    self.metrics
                        .kafka_appends
                        .with_label_values(&[partition_label.as_str(), "success"])
                        .inc();
                }
            }
        }

        match last_err {
            Some(err) => Err(DistributorError::AppendLog {
                msg: err.to_string(),
            }),
            None => {
                debug!(tenant = tenant_id, partition, "stream written to append log");
                Ok(())
            }
        }
    }
}
