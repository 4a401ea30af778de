//! Reservations: named holds on a node set over a time window.
//!
//! The scheduler consults the reservation set while filtering candidate
//! nodes; create/update/delete are admin RPCs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::NodeBitmap;
use crate::error::{Result, SchedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResvFlags {
    /// Maintenance reservations may start in the past and override the
    /// overlap checks.
    pub maint: bool,
    /// Nodes are reserved even when idle (no backfill into the window).
    pub exclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub name: String,
    pub node_names: Vec<String>,
    pub node_bitmap: NodeBitmap,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub users: Vec<u32>,
    pub accounts: Vec<String>,
    pub flags: ResvFlags,
}

impl Reservation {
    pub fn active_at(&self, t: DateTime<Utc>) -> bool {
        self.start_time <= t && t < self.end_time
    }

    /// Empty user and account lists admit everyone.
    pub fn admits(&self, uid: u32, account: Option<&str>) -> bool {
        if self.users.is_empty() && self.accounts.is_empty() {
            return true;
        }
        if self.users.contains(&uid) {
            return true;
        }
        match account {
            Some(acct) => self.accounts.iter().any(|a| a == acct),
            None => false,
        }
    }

    fn user_sets_compatible(&self, other: &Reservation) -> bool {
        let a: std::collections::HashSet<u32> = self.users.iter().copied().collect();
        let b: std::collections::HashSet<u32> = other.users.iter().copied().collect();
        a.is_disjoint(&b) || a.is_subset(&b) || b.is_subset(&a)
    }

    /// Validates shape and overlap against the existing set. Overlapping
    /// reservations on shared nodes are allowed only when their user sets
    /// are disjoint or one contains the other.
    pub fn validate(&self, existing: &[&Reservation], now: DateTime<Utc>) -> Result<()> {
        if self.name.is_empty() {
            return Err(SchedError::InvalidReservationName(String::new()));
        }
        if self.start_time >= self.end_time {
            return Err(SchedError::Unexpected(
                "reservation start must precede end".into(),
            ));
        }
        if self.end_time <= now && !self.flags.maint {
            return Err(SchedError::Unexpected(
                "reservation lies entirely in the past".into(),
            ));
        }
        for other in existing {
            if other.name == self.name {
                continue;
            }
            let windows_overlap =
                self.start_time < other.end_time && other.start_time < self.end_time;
            if !windows_overlap || !self.node_bitmap.intersects(&other.node_bitmap) {
                continue;
            }
            if self.flags.maint || other.flags.maint {
                continue;
            }
            if !self.user_sets_compatible(other) {
                return Err(SchedError::ReservationBusy);
            }
        }
        Ok(())
    }
}
