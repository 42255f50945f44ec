use std::collections::VecDeque;

use wavelet_hub::MessageData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    DropNew,
    DropOld,
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub broker_id: String,
    pub seq: Option<u64>,
    pub data: MessageData,
    pub raw_payload: serde_json::Value,
}

/// A per-conversation queue of events awaiting delivery. Bounded at
/// `max_queue`; once full, `push` applies `drop_policy` and reports what it
/// dropped so the caller can emit a `ws.dropped{reason}` metric. A dropped
/// entry is never retried — durability already happened upstream in the
/// outbox/record store, so this is a deliberate live-delivery backpressure
/// choice, not a correctness failure. It is still staged for ack: the
/// broker entry it came from has already been durably written elsewhere.
pub struct ReorderBuffer {
    pending: VecDeque<PendingEntry>,
    max_queue: usize,
    drop_policy: DropPolicy,
}

impl ReorderBuffer {
    pub fn new(max_queue: usize, drop_policy: DropPolicy) -> Self {
        Self {
            pending: VecDeque::new(),
            max_queue,
            drop_policy,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pushes an entry, applying the drop policy when full. Returns the
    /// entry that was dropped, if any (it's still staged for ack by the
    /// caller before being discarded).
    pub fn push(&mut self, entry: PendingEntry) -> Option<PendingEntry> {
        if self.pending.len() < self.max_queue {
            self.pending.push_back(entry);
            return None;
        }

        match self.drop_policy {
            DropPolicy::DropNew => Some(entry),
            DropPolicy::DropOld => {
                let dropped = self.pending.pop_front();
                self.pending.push_back(entry);
                dropped
            }
        }
    }

    /// Sorts by `seq` ascending (entries with no `seq` sort before any that
    /// have one, since they carry no ordering information to act on) and
    /// hands back the full queue, leaving the buffer empty. The caller
    /// re-pushes whatever it didn't finish processing.
    pub fn drain_sorted(&mut self) -> Vec<PendingEntry> {
        let mut entries: Vec<PendingEntry> = self.pending.drain(..).collect();
        entries.sort_by(|a, b| a.seq.cmp(&b.seq));
        entries
    }

    pub fn push_front_all(&mut self, entries: Vec<PendingEntry>) {
        for entry in entries.into_iter().rev() {
            self.pending.push_front(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(broker_id: &str, seq: Option<u64>) -> PendingEntry {
        PendingEntry {
            broker_id: broker_id.to_string(),
            seq,
            data: MessageData {
                message_id: broker_id.to_string(),
                conversation_id: "c1".to_string(),
                ciphertext: "x".to_string(),
                metadata: None,
                content_size: None,
                content_mime_type: None,
                occurred_at: "2026-07-28T00:00:00Z".to_string(),
            },
            raw_payload: serde_json::json!({}),
        }
    }

    #[test]
    fn drain_sorted_orders_by_seq_ascending() {
        let mut buffer = ReorderBuffer::new(10, DropPolicy::DropNew);
        buffer.push(entry("3-0", Some(3)));
        buffer.push(entry("1-0", Some(1)));
        buffer.push(entry("2-0", Some(2)));
        let drained = buffer.drain_sorted();
        let seqs: Vec<_> = drained.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn drop_new_rejects_incoming_entry_once_full() {
        let mut buffer = ReorderBuffer::new(1, DropPolicy::DropNew);
        assert!(buffer.push(entry("1-0", Some(1))).is_none());
        let dropped = buffer.push(entry("2-0", Some(2)));
        assert_eq!(dropped.unwrap().broker_id, "2-0");
        assert_eq!(buffer.drain_sorted().len(), 1);
    }

    #[test]
    fn drop_old_evicts_oldest_pending_entry() {
        let mut buffer = ReorderBuffer::new(1, DropPolicy::DropOld);
        assert!(buffer.push(entry("1-0", Some(1))).is_none());
        let dropped = buffer.push(entry("2-0", Some(2)));
        assert_eq!(dropped.unwrap().broker_id, "1-0");
        let drained = buffer.drain_sorted();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].broker_id, "2-0");
    }

    #[test]
    fn push_front_all_restores_order() {
        let mut buffer = ReorderBuffer::new(10, DropPolicy::DropNew);
        buffer.push(entry("1-0", Some(1)));
        let remaining = buffer.drain_sorted();
        buffer.push_front_all(remaining);
        buffer.push(entry("2-0", Some(2)));
        let drained = buffer.drain_sorted();
        assert_eq!(drained[0].broker_id, "1-0");
        assert_eq!(drained[1].broker_id, "2-0");
    }
}
