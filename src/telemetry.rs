//! RPC telemetry: bounded per-type and per-user counters plus the coarse
//! diagnostic counters dumped alongside them.
//!
//! Both tables are linear-probed slot arrays under one mutex. The mutex is
//! its own island: it is never taken while a lock-domain guard is held.
//! When a table is full and a new id arrives, the sample is dropped; that
//! saturation policy is deliberate and no drop counter is kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capacity of the per-request-type table.
pub const TYPE_TABLE_SIZE: usize = 100;
/// Capacity of the per-user table.
pub const USER_TABLE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySlot {
    pub id: u32,
    pub count: u32,
    pub total_ns: u64,
}

#[derive(Debug)]
struct SlotTable {
    slots: Vec<Option<TelemetrySlot>>,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Finds the slot for `id`, claiming the first empty slot when the id
    /// is new. Returns false when the table is saturated.
    fn record(&mut self, id: u32, elapsed: Duration) -> bool {
        for slot in self.slots.iter_mut() {
            match slot {
                Some(s) if s.id == id => {
                    s.count += 1;
                    s.total_ns += elapsed.as_nanos() as u64;
                    return true;
                }
                Some(_) => continue,
                None => {
                    *slot = Some(TelemetrySlot {
                        id,
                        count: 1,
                        total_ns: elapsed.as_nanos() as u64,
                    });
                    return true;
                }
            }
        }
        false
    }

    fn dump(&self) -> Vec<TelemetrySlot> {
        self.slots.iter().flatten().copied().collect()
    }

    fn reset(&mut self) {
        self.slots.fill(None);
    }
}

#[derive(Debug)]
struct Tables {
    by_type: SlotTable,
    by_user: SlotTable,
}

/// Per-RPC telemetry. One `record` call per handler invocation.
#[derive(Debug)]
pub struct RpcTelemetry {
    tables: Mutex<Tables>,
}

impl Default for RpcTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcTelemetry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                by_type: SlotTable::new(TYPE_TABLE_SIZE),
                by_user: SlotTable::new(USER_TABLE_SIZE),
            }),
        }
    }

    pub fn record(&self, msg_type: u16, uid: u32, elapsed: Duration) {
        let mut tables = self.tables.lock().expect("telemetry mutex poisoned");
        tables.by_type.record(msg_type as u32, elapsed);
        tables.by_user.record(uid, elapsed);
    }

    pub fn dump(&self) -> (Vec<TelemetrySlot>, Vec<TelemetrySlot>) {
        let tables = self.tables.lock().expect("telemetry mutex poisoned");
        (tables.by_type.dump(), tables.by_user.dump())
    }

    pub fn reset(&self) {
        let mut tables = self.tables.lock().expect("telemetry mutex poisoned");
        tables.by_type.reset();
        tables.by_user.reset();
    }
}

/// Controller-lifetime job counters.
#[derive(Debug, Default)]
pub struct DiagStats {
    pub jobs_submitted: AtomicU64,
    pub jobs_started: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_canceled: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiagSnapshot {
    pub jobs_submitted: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_canceled: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
}

impl DiagStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagSnapshot {
        DiagSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_canceled: self.jobs_canceled.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_requeued: self.jobs_requeued.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.jobs_submitted.store(0, Ordering::Relaxed);
        self.jobs_started.store(0, Ordering::Relaxed);
        self.jobs_completed.store(0, Ordering::Relaxed);
        self.jobs_canceled.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.jobs_requeued.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_per_type_and_user() {
        let t = RpcTelemetry::new();
        t.record(4001, 100, Duration::from_micros(10));
        t.record(4001, 100, Duration::from_micros(20));
        t.record(2003, 200, Duration::from_micros(5));

        let (by_type, by_user) = t.dump();
        let alloc = by_type.iter().find(|s| s.id == 4001).unwrap();
        assert_eq!(alloc.count, 2);
        assert_eq!(alloc.total_ns, 30_000);
        assert_eq!(by_user.iter().find(|s| s.id == 100).unwrap().count, 2);
        assert_eq!(by_user.iter().find(|s| s.id == 200).unwrap().count, 1);
    }

    #[test]
    fn saturated_table_drops_new_ids() {
        let t = RpcTelemetry::new();
        for i in 0..(TYPE_TABLE_SIZE as u16 + 10) {
            t.record(3000 + i, 1, Duration::from_nanos(1));
        }
        let (by_type, by_user) = t.dump();
        assert_eq!(by_type.len(), TYPE_TABLE_SIZE);
        // All samples came from one uid; the user table keeps counting.
        assert_eq!(
            by_user.iter().find(|s| s.id == 1).unwrap().count as usize,
            TYPE_TABLE_SIZE + 10
        );
        // Known ids still accumulate after saturation.
        t.record(3000, 1, Duration::from_nanos(1));
        let (by_type, _) = t.dump();
        assert_eq!(by_type.iter().find(|s| s.id == 3000).unwrap().count, 2);
    }

    #[test]
    fn reset_zeroes_both_tables() {
        let t = RpcTelemetry::new();
        t.record(1008, 5, Duration::from_nanos(1));
        t.reset();
        let (by_type, by_user) = t.dump();
        assert!(by_type.is_empty());
        assert!(by_user.is_empty());
    }

    #[test]
    fn diag_stats_roundtrip() {
        let d = DiagStats::default();
        DiagStats::bump(&d.jobs_submitted);
        DiagStats::bump(&d.jobs_canceled);
        let snap = d.snapshot();
        assert_eq!(snap.jobs_submitted, 1);
        assert_eq!(snap.jobs_canceled, 1);
        d.reset();
        assert_eq!(d.snapshot().jobs_submitted, 0);
    }
}
