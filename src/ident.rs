//! Call-site identifier assignment (dummy / unique modes)
//!
//! Every library-call site gets two identifiers in one extraction pass:
//!
//! - `unique_id`: strictly positive, contiguous within the function —
//!   the `n`-th site gets `n`. Distinguishes every site.
//! - `dummy_id`: the running site counter reduced modulo `M`, starting
//!   at 0. Sites `M` apart intentionally collide; `reset_count` records
//!   how many times the counter has wrapped.
//!
//! The active [`IdMode`] selects which value the instrumented program
//! emits and which the engine matches on. Both are recorded in the
//! artifact regardless, so one artifact serves either mode.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::MarkerId;

/// Default modulus `M` for dummy-id assignment.
pub const DEFAULT_MODULUS: u32 = 200;

/// Which identifier markers carry at run time. The only polymorphism in
/// the system; deliberately a two-variant sum, not a trait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdMode {
    /// Match on `dummy_id` (small, modulo `M`, collisions allowed).
    Dummy,
    /// Match on `unique_id` (per-function, collision-free).
    Unique,
}

impl IdMode {
    /// Stable tag used in the artifact.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            IdMode::Dummy => "dummy",
            IdMode::Unique => "unique",
        }
    }

    /// Wire encoding for the install blob header (0 = dummy, 1 = unique).
    #[inline]
    pub fn wire(self) -> u32 {
        match self {
            IdMode::Dummy => 0,
            IdMode::Unique => 1,
        }
    }

    /// Decode the wire tag; anything but 0/1 is malformed.
    #[inline]
    pub fn from_wire(v: u32) -> Option<IdMode> {
        match v {
            0 => Some(IdMode::Dummy),
            1 => Some(IdMode::Unique),
            _ => None,
        }
    }
}

/// The identifiers assigned to one call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SiteIds {
    /// Contiguous per-function id, first site gets 1.
    pub unique_id: MarkerId,
    /// Site counter modulo `M`, first site gets 0.
    pub dummy_id: MarkerId,
    /// How many times the dummy counter wrapped before this site.
    pub reset_count: u32,
}

impl SiteIds {
    /// The identifier emitted and matched under `mode`.
    #[inline]
    pub fn select(&self, mode: IdMode) -> MarkerId {
        match mode {
            IdMode::Dummy => self.dummy_id,
            IdMode::Unique => self.unique_id,
        }
    }
}

/// Per-function assigner; both counters start at zero.
#[derive(Clone, Debug)]
pub struct IdAssigner {
    modulus: u32,
    unique_counter: u32,
    dummy_counter: u32,
}

impl IdAssigner {
    /// Fresh assigner with modulus `M`. A zero modulus is rejected by
    /// the extraction options before an assigner is ever built.
    pub fn new(modulus: u32) -> Self {
        debug_assert!(modulus > 0, "modulus must be positive");
        IdAssigner {
            modulus,
            unique_counter: 0,
            dummy_counter: 0,
        }
    }

    /// Assign identifiers to the next call site in program order.
    pub fn next_site(&mut self) -> SiteIds {
        self.unique_counter += 1;
        let ids = SiteIds {
            unique_id: self.unique_counter as MarkerId,
            dummy_id: (self.dummy_counter % self.modulus) as MarkerId,
            reset_count: self.dummy_counter / self.modulus,
        };
        self.dummy_counter += 1;
        ids
    }

    /// Number of sites assigned so far.
    #[inline]
    pub fn sites_assigned(&self) -> u32 {
        self.unique_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_are_contiguous_from_one() {
        let mut a = IdAssigner::new(DEFAULT_MODULUS);
        let got: Vec<MarkerId> = (0..5).map(|_| a.next_site().unique_id).collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn dummy_ids_wrap_at_the_modulus() {
        // M=3 ⇒ dummy ids 0,1,2,0,1,2,0 with reset counts 0,0,0,1,1,1,2
        let mut a = IdAssigner::new(3);
        let sites: Vec<SiteIds> = (0..7).map(|_| a.next_site()).collect();
        let dummies: Vec<MarkerId> = sites.iter().map(|s| s.dummy_id).collect();
        let resets: Vec<u32> = sites.iter().map(|s| s.reset_count).collect();
        assert_eq!(dummies, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(resets, vec![0, 0, 0, 1, 1, 1, 2]);
    }

    #[test]
    fn mode_selects_the_emitted_identifier() {
        let mut a = IdAssigner::new(DEFAULT_MODULUS);
        let s = a.next_site();
        assert_eq!(s.select(IdMode::Dummy), 0);
        assert_eq!(s.select(IdMode::Unique), 1);
    }

    #[test]
    fn wire_tags_round_trip() {
        for mode in [IdMode::Dummy, IdMode::Unique] {
            assert_eq!(IdMode::from_wire(mode.wire()), Some(mode));
        }
        assert_eq!(IdMode::from_wire(2), None);
    }
}
