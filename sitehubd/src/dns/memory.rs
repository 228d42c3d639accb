use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use async_trait::async_trait;
use parking_lot::Mutex;
use super::{DnsError, DnsProvider, DnsRecord, RecordKind};

/// In-process zone for development and tests. Counts writes and can be told
/// to fail the next N calls.
#[derive(Default)]
pub struct MemoryDnsProvider {
    records: Mutex<HashMap<String, DnsRecord>>,
    next_id: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    fail_next: AtomicU32,
}

impl MemoryDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` provider calls with a transport error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.creates() + self.updates() + self.deletes()
    }

    pub fn record(&self, kind: RecordKind, name: &str) -> Option<DnsRecord> {
        self.records
            .lock()
            .values()
            .find(|r| r.kind == kind && r.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn injected_failure(&self) -> Result<(), DnsError> {
        let tripped = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(DnsError::Transport("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DnsProvider for MemoryDnsProvider {
    async fn find(&self, kind: RecordKind, name: &str) -> Result<Option<DnsRecord>, DnsError> {
        self.injected_failure()?;
        Ok(self.record(kind, name))
    }

    async fn create(&self, record: &DnsRecord) -> Result<String, DnsError> {
        self.injected_failure()?;
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut stored = record.clone();
        stored.id = Some(id.clone());
        self.records.lock().insert(id.clone(), stored);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn update(&self, id: &str, record: &DnsRecord) -> Result<(), DnsError> {
        self.injected_failure()?;
        let mut records = self.records.lock();
        let existing = records
            .get_mut(id)
            .ok_or_else(|| DnsError::Provider(format!("no record {}", id)))?;
        existing.content = record.content.clone();
        existing.ttl = record.ttl;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), DnsError> {
        self.injected_failure()?;
        if self.records.lock().remove(id).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
