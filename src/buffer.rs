//! Per-partition batching: a bounded ordered buffer of records plus the
//! lazy map handing one buffer out per (topic, partition).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::consumer::CommitHandle;
use crate::event::{FileStats, PartitionId, Record};

/// A record (and its commit handle) bounced off a full buffer. The caller
/// flushes the buffer and retries the append with the returned pair.
#[derive(Debug)]
pub struct Rejected {
    pub record: Record,
    pub commit: CommitHandle,
    pub reason: String,
}

/// The owned result of draining a buffer. Records and commit handles are
/// index-aligned; both follow consumption order.
#[derive(Debug, Default)]
pub struct DrainedBatch {
    pub records: Vec<Record>,
    pub commits: Vec<CommitHandle>,
}

impl DrainedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Default)]
struct BufferState {
    records: Vec<Record>,
    commits: Vec<CommitHandle>,
    size_bytes: u64,
    stats: FileStats,
}

/// Thread-safe bounded batch of records for one (topic, partition).
///
/// A cap of zero disables the corresponding limit. A record whose size
/// estimate alone exceeds the byte cap is still admitted into an empty
/// buffer, so a flush-and-retry always succeeds.
#[derive(Debug)]
pub struct PartitionBuffer {
    id: PartitionId,
    max_size_bytes: u64,
    max_records: usize,
    state: RwLock<BufferState>,
}

impl PartitionBuffer {
    pub fn new(id: PartitionId, max_size_bytes: u64, max_records: usize) -> Self {
        PartitionBuffer {
            id,
            max_size_bytes,
            max_records,
            state: RwLock::new(BufferState::default()),
        }
    }

    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    /// Appends a record under the write lock. Rejects when the record cap
    /// is reached or the byte cap would be exceeded; on acceptance the
    /// size and write-time stats are updated.
    pub fn add(&self, record: Record, commit: CommitHandle) -> Result<(), Rejected> {
        let mut state = self.state.write();
        if self.max_records > 0 && state.records.len() >= self.max_records {
            return Err(Rejected {
                reason: format!("record cap {} reached", self.max_records),
                record,
                commit,
            });
        }
        let estimate = record.estimated_size() as u64;
        if self.max_size_bytes > 0
            && !state.records.is_empty()
            && state.size_bytes + estimate > self.max_size_bytes
        {
            return Err(Rejected {
                reason: format!(
                    "size cap {} would be exceeded ({} + {})",
                    self.max_size_bytes, state.size_bytes, estimate
                ),
                record,
                commit,
            });
        }

        let now = Utc::now();
        state.size_bytes += estimate;
        state.records.push(record);
        state.commits.push(commit);
        state.stats.record_count = state.records.len();
        state.stats.size_bytes = state.size_bytes;
        if state.stats.first_write_time.is_none() {
            state.stats.first_write_time = Some(now);
        }
        state.stats.last_write_time = Some(now);
        Ok(())
    }

    /// Takes ownership of the buffered records and resets the buffer with
    /// fresh backing storage. The caller owns the returned batch.
    pub fn drain(&self) -> DrainedBatch {
        let mut state = self.state.write();
        let records = std::mem::take(&mut state.records);
        let commits = std::mem::take(&mut state.commits);
        state.size_bytes = 0;
        state.stats = FileStats::default();
        DrainedBatch { records, commits }
    }

    /// Read-locked snapshot of the buffer's statistics.
    pub fn stats(&self) -> FileStats {
        self.state.read().stats.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    pub fn reset(&self) {
        let _ = self.drain();
    }
}

/// Lazy map from partition to buffer. Lookups take the read lock; misses
/// upgrade to the write lock with a double-check before inserting.
#[derive(Debug)]
pub struct BufferManager {
    max_size_bytes: u64,
    max_records: usize,
    buffers: RwLock<HashMap<PartitionId, Arc<PartitionBuffer>>>,
}

impl BufferManager {
    pub fn new(max_size_bytes: u64, max_records: usize) -> Self {
        BufferManager {
            max_size_bytes,
            max_records,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, id: &PartitionId) -> Arc<PartitionBuffer> {
        {
            let buffers = self.buffers.read();
            if let Some(buffer) = buffers.get(id) {
                return Arc::clone(buffer);
            }
        }
        let mut buffers = self.buffers.write();
        Arc::clone(buffers.entry(id.clone()).or_insert_with(|| {
            Arc::new(PartitionBuffer::new(
                id.clone(),
                self.max_size_bytes,
                self.max_records,
            ))
        }))
    }

    /// Snapshot of every known buffer, for the sweeper and shutdown drain.
    pub fn snapshot(&self) -> Vec<Arc<PartitionBuffer>> {
        self.buffers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.read().is_empty()
    }
}
