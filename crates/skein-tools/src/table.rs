use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;

use skein_core::error::{Result, SkeinError};
use skein_core::types::{ToolRequestRecord, ToolRequestStatus};

/// One slot in the table. The record has its own lock so writers to
/// different requests never contend; the reconciliation flag is a separate
/// atomic so claiming is a single compare-and-swap.
struct Entry {
    record: Mutex<ToolRequestRecord>,
    processed: AtomicBool,
}

impl Entry {
    fn record(&self) -> MutexGuard<'_, ToolRequestRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> ToolRequestRecord {
        let mut rec = self.record().clone();
        rec.processed_by_owner = self.processed.load(Ordering::Acquire);
        rec
    }
}

/// Correlation table of in-flight tool requests, keyed by request id.
///
/// Shared by the dispatcher (writes results) and every poller (claims and
/// removes reconciled records). Construct one per process and inject it.
#[derive(Default)]
pub struct ToolRequestTable {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
}

impl ToolRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, request_id: &str) -> Option<Arc<Entry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(request_id)
            .cloned()
    }

    fn all_entries(&self) -> Vec<Arc<Entry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Insert a new record and return its request id.
    pub fn insert(&self, record: ToolRequestRecord) -> String {
        let id = record.request_id.clone();
        let processed = record.processed_by_owner;
        let entry = Arc::new(Entry {
            record: Mutex::new(record),
            processed: AtomicBool::new(processed),
        });
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), entry);
        id
    }

    /// Snapshot of a record.
    pub fn get(&self, request_id: &str) -> Option<ToolRequestRecord> {
        self.entry(request_id).map(|e| e.snapshot())
    }

    /// Mark a pending request completed with its response.
    ///
    /// Returns `Ok(false)` if the request already reached a terminal status.
    pub fn complete(&self, request_id: &str, response: serde_json::Value) -> Result<bool> {
        self.finish(request_id, ToolRequestStatus::Completed, response)
    }

    /// Mark a pending request failed. The error text lands in the response
    /// under `error`.
    pub fn fail(&self, request_id: &str, error: &str) -> Result<bool> {
        self.finish(
            request_id,
            ToolRequestStatus::Error,
            serde_json::json!({ "error": error }),
        )
    }

    fn finish(
        &self,
        request_id: &str,
        status: ToolRequestStatus,
        response: serde_json::Value,
    ) -> Result<bool> {
        let entry = self
            .entry(request_id)
            .ok_or_else(|| SkeinError::RequestNotFound(request_id.to_string()))?;
        let mut rec = entry.record();
        if rec.status.is_terminal() {
            return Ok(false);
        }
        rec.status = status;
        rec.response = Some(response);
        rec.completed_at = Some(Utc::now());
        Ok(true)
    }

    /// Claim a terminal record for reconciliation.
    ///
    /// Flips `processed_by_owner` false -> true atomically; while a claim
    /// is held no other caller gets `true` for the same request.
    pub fn claim(&self, request_id: &str) -> bool {
        let Some(entry) = self.entry(request_id) else {
            return false;
        };
        if !entry.record().status.is_terminal() {
            return false;
        }
        entry
            .processed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hand back a claim whose reconciliation did not finish, so a later
    /// pass picks the record up again.
    pub fn release(&self, request_id: &str) -> bool {
        let Some(entry) = self.entry(request_id) else {
            return false;
        };
        entry
            .processed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop a record once it has been fully reconciled.
    pub fn remove(&self, request_id: &str) -> Option<ToolRequestRecord> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id)
            .map(|e| e.snapshot())
    }

    /// Terminal records nobody has reconciled yet.
    ///
    /// With an owner, only that owner's records and unowned records are
    /// returned, oldest first.
    pub fn terminal_unprocessed(&self, owner: Option<&str>) -> Vec<ToolRequestRecord> {
        let mut out: Vec<ToolRequestRecord> = self
            .all_entries()
            .iter()
            .map(|e| e.snapshot())
            .filter(|r| r.status.is_terminal() && !r.processed_by_owner)
            .filter(|r| match (owner, r.owner.as_deref()) {
                (Some(want), Some(have)) => want == have,
                _ => true,
            })
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Requests still waiting on the executor.
    pub fn pending(&self) -> Vec<ToolRequestRecord> {
        let mut out: Vec<ToolRequestRecord> = self
            .all_entries()
            .iter()
            .map(|e| e.snapshot())
            .filter(|r| r.status == ToolRequestStatus::Pending)
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<ToolRequestRecord> {
        let mut out: Vec<ToolRequestRecord> =
            self.all_entries().iter().map(|e| e.snapshot()).collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(owner: Option<&str>) -> ToolRequestRecord {
        ToolRequestRecord::new("search", json!({"q": "rust"}), owner.map(String::from))
    }

    #[test]
    fn complete_transitions_once() {
        let table = ToolRequestTable::new();
        let id = table.insert(record(None));

        assert!(table.complete(&id, json!({"hits": 3})).unwrap());
        assert!(!table.complete(&id, json!({"hits": 4})).unwrap());
        assert!(!table.fail(&id, "late").unwrap());

        let rec = table.get(&id).unwrap();
        assert_eq!(rec.status, ToolRequestStatus::Completed);
        assert_eq!(rec.response, Some(json!({"hits": 3})));
        assert!(rec.completed_at.is_some());
    }

    #[test]
    fn fail_records_error_text() {
        let table = ToolRequestTable::new();
        let id = table.insert(record(None));
        assert!(table.fail(&id, "quota exceeded").unwrap());
        let rec = table.get(&id).unwrap();
        assert_eq!(rec.status, ToolRequestStatus::Error);
        assert_eq!(rec.response.unwrap()["error"], "quota exceeded");
    }

    #[test]
    fn unknown_request_is_an_error() {
        let table = ToolRequestTable::new();
        assert!(matches!(
            table.complete("nope", json!(null)),
            Err(SkeinError::RequestNotFound(_))
        ));
        assert!(!table.claim("nope"));
    }

    #[test]
    fn claim_requires_terminal_and_succeeds_once() {
        let table = ToolRequestTable::new();
        let id = table.insert(record(None));
        assert!(!table.claim(&id), "pending records cannot be claimed");

        table.complete(&id, json!("ok")).unwrap();
        assert!(table.claim(&id));
        assert!(!table.claim(&id));
        assert!(table.get(&id).unwrap().processed_by_owner);
        assert!(table.terminal_unprocessed(None).is_empty());
    }

    #[test]
    fn released_claim_can_be_taken_again() {
        let table = ToolRequestTable::new();
        let id = table.insert(record(Some("c1")));
        table.complete(&id, json!("ok")).unwrap();

        assert!(!table.release(&id), "nothing to release before a claim");
        assert!(table.claim(&id));
        assert!(table.release(&id));
        assert!(!table.get(&id).unwrap().processed_by_owner);
        assert_eq!(table.terminal_unprocessed(Some("c1")).len(), 1);
        assert!(table.claim(&id));
        assert!(!table.release("nope"));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let table = Arc::new(ToolRequestTable::new());
        let id = table.insert(record(None));
        table.complete(&id, json!("ok")).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = table.clone();
                let id = id.clone();
                std::thread::spawn(move || table.claim(&id))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn terminal_unprocessed_filters_by_owner() {
        let table = ToolRequestTable::new();
        let mine = table.insert(record(Some("c1")));
        let theirs = table.insert(record(Some("c2")));
        let unowned = table.insert(record(None));
        let still_pending = table.insert(record(Some("c1")));
        for id in [&mine, &theirs, &unowned] {
            table.complete(id, json!("done")).unwrap();
        }

        let ids: Vec<String> = table
            .terminal_unprocessed(Some("c1"))
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        assert!(ids.contains(&mine));
        assert!(ids.contains(&unowned));
        assert!(!ids.contains(&theirs));
        assert!(!ids.contains(&still_pending));

        assert_eq!(table.terminal_unprocessed(None).len(), 3);
        assert_eq!(table.pending().len(), 1);
    }

    #[test]
    fn remove_drops_record() {
        let table = ToolRequestTable::new();
        let id = table.insert(record(None));
        assert_eq!(table.len(), 1);
        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
        assert!(table.get(&id).is_none());
    }
}
