//! The synthesized policy zone: rule actions, the published image and the
//! IXFR journal.
//!
//! The image is immutable once published; the merger swaps a new one in via
//! [`arc_swap`] so query workers never take a lock on the read path. The
//! journal and the per-downstream serial memory sit behind one mutex, taken
//! only while appending a delta or finishing an IXFR.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use domain::base::Serial;

use crate::error::Error;
use crate::zone::StoredRecord;

/// How many deltas the journal retains. Requests from further back fall
/// back to AXFR.
pub const JOURNAL_CAPACITY: usize = 64;

/// Policy verdict attached to a rule, ordered by severity for conflict
/// resolution: drop > nxdomain > nodata > passthru.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Nxdomain,
    Nodata,
    Drop,
    Passthru,
    Unknown,
}

impl Action {
    fn severity(self) -> u8 {
        match self {
            Action::Drop => 3,
            Action::Nxdomain => 2,
            Action::Nodata => 1,
            Action::Passthru => 0,
            Action::Unknown => 0,
        }
    }

    pub fn more_severe(self, other: Action) -> Action {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// The CNAME target this action is expressed as in RPZ output.
    pub fn cname_target(self) -> &'static str {
        match self {
            Action::Nxdomain | Action::Unknown => ".",
            Action::Nodata => "*.",
            Action::Drop => "rpz-drop.",
            Action::Passthru => "rpz-passthru.",
        }
    }

    /// Classify an inbound RPZ CNAME by its target.
    pub fn from_cname_target(target: &str) -> Action {
        match target {
            "." => Action::Nxdomain,
            "*." => Action::Nodata,
            "rpz-drop." => Action::Drop,
            "rpz-passthru." => Action::Passthru,
            _ => Action::Unknown,
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nxdomain" => Ok(Action::Nxdomain),
            "nodata" => Ok(Action::Nodata),
            "drop" => Ok(Action::Drop),
            "passthru" => Ok(Action::Passthru),
            _ => Err(Error::config(format!("unknown action keyword: {}", s))),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Nxdomain => "nxdomain",
            Action::Nodata => "nodata",
            Action::Drop => "drop",
            Action::Passthru => "passthru",
            Action::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One emitted rule: the qualified owner, its wire CNAME and the action it
/// encodes.
#[derive(Clone, Debug)]
pub struct RpzRule {
    pub name: String,
    pub rr: StoredRecord,
    pub action: Action,
}

/// A published snapshot of the policy zone. Never mutated; the merger
/// builds a new image and swaps it in.
#[derive(Clone, Debug)]
pub struct RpzImage {
    pub serial: Serial,
    pub soa: StoredRecord,
    pub ns: Vec<StoredRecord>,
    pub data: HashMap<String, RpzRule>,
}

#[derive(Clone, Debug)]
pub struct IxfrDelta {
    pub from_serial: Serial,
    pub to_serial: Serial,
    pub removed: Vec<RpzRule>,
    pub added: Vec<RpzRule>,
}

/// Bounded forward-delta chain. Deltas are contiguous by construction:
/// each append continues from the previous head, and overflow drops the
/// tail.
#[derive(Debug, Default)]
pub struct Journal {
    deltas: VecDeque<IxfrDelta>,
    capacity: usize,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Journal {
            deltas: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, delta: IxfrDelta) {
        if let Some(head) = self.deltas.back() {
            if head.to_serial != delta.from_serial {
                log::warn!(target: "rpz",
                    "journal discontinuity: head {} vs delta from {}, dropping chain",
                    head.to_serial, delta.from_serial);
                self.deltas.clear();
            }
        }
        if self.deltas.len() == self.capacity {
            self.deltas.pop_front();
        }
        self.deltas.push_back(delta);
    }

    /// The contiguous chain from `from` up to the current head, or `None`
    /// when `from` is older than the tail (the caller downgrades to AXFR).
    pub fn walk(&self, from: Serial) -> Option<Vec<&IxfrDelta>> {
        let start = self.deltas.iter().position(|d| d.from_serial == from)?;
        Some(self.deltas.range(start..).collect())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.deltas.len()
    }
}

/// Highest serial handed to each downstream, keyed by peer host. The
/// stored serial never goes backwards.
#[derive(Debug, Default)]
pub struct DownstreamRegistry {
    serials: HashMap<IpAddr, Serial>,
}

impl DownstreamRegistry {
    pub fn remember(&mut self, downstream: IpAddr, serial: Serial) {
        match self.serials.get(&downstream) {
            Some(known) if serial <= *known => (),
            _ => {
                self.serials.insert(downstream, serial);
            }
        }
    }

    pub fn get(&self, downstream: &IpAddr) -> Option<Serial> {
        self.serials.get(downstream).copied()
    }
}

#[derive(Debug)]
pub struct JournalState {
    pub journal: Journal,
    pub downstreams: DownstreamRegistry,
}

/// Everything the responders and the merger share about the output zone.
#[derive(Debug)]
pub struct RpzState {
    pub zone_name: String,
    image: ArcSwap<RpzImage>,
    pub journal: Mutex<JournalState>,
}

impl RpzState {
    pub fn new(zone_name: String, image: RpzImage) -> Self {
        RpzState {
            zone_name,
            image: ArcSwap::from_pointee(image),
            journal: Mutex::new(JournalState {
                journal: Journal::new(JOURNAL_CAPACITY),
                downstreams: DownstreamRegistry::default(),
            }),
        }
    }

    pub fn image(&self) -> arc_swap::Guard<std::sync::Arc<RpzImage>> {
        self.image.load()
    }

    pub fn current_serial(&self) -> Serial {
        self.image.load().serial
    }

    /// Publish a new image and its delta in one go. Readers see the new
    /// image without locking; the journal mutex covers the append.
    pub fn publish(&self, image: RpzImage, delta: IxfrDelta) {
        let serial = image.serial;
        self.image.store(std::sync::Arc::new(image));
        let mut state = self.journal.lock().unwrap();
        state.journal.append(delta);
        log::info!(target: "rpz", "published rpz image, serial {}", serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(from: u32, to: u32) -> IxfrDelta {
        IxfrDelta {
            from_serial: Serial(from),
            to_serial: Serial(to),
            removed: Vec::new(),
            added: Vec::new(),
        }
    }

    #[test]
    fn action_parsing() {
        assert_eq!("NXDOMAIN".parse::<Action>().unwrap(), Action::Nxdomain);
        assert_eq!("passthru".parse::<Action>().unwrap(), Action::Passthru);
        assert!("reject".parse::<Action>().is_err());
    }

    #[test]
    fn action_severity_ordering() {
        assert_eq!(Action::Nodata.more_severe(Action::Drop), Action::Drop);
        assert_eq!(Action::Nxdomain.more_severe(Action::Nodata), Action::Nxdomain);
        assert_eq!(
            Action::Passthru.more_severe(Action::Nxdomain),
            Action::Nxdomain
        );
    }

    #[test]
    fn cname_target_classification() {
        assert_eq!(Action::from_cname_target("rpz-drop."), Action::Drop);
        assert_eq!(Action::from_cname_target("*."), Action::Nodata);
        assert_eq!(
            Action::from_cname_target("garden-path."),
            Action::Unknown
        );
    }

    #[test]
    fn walk_returns_contiguous_chain() {
        let mut journal = Journal::new(8);
        journal.append(delta(40, 41));
        journal.append(delta(41, 42));

        let chain = journal.walk(Serial(40)).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].from_serial, Serial(40));
        assert_eq!(chain[1].to_serial, Serial(42));

        let chain = journal.walk(Serial(41)).unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn walk_past_the_tail_needs_axfr() {
        let mut journal = Journal::new(2);
        journal.append(delta(30, 31));
        journal.append(delta(31, 32));
        journal.append(delta(32, 33));

        assert_eq!(journal.len(), 2);
        assert!(journal.walk(Serial(30)).is_none());
        assert!(journal.walk(Serial(5)).is_none());
        assert!(journal.walk(Serial(31)).is_some());
    }

    #[test]
    fn serial_comparison_wraps() {
        let head = Serial(u32::MAX);
        let next = head.add(1);
        assert_eq!(next, Serial(0));
        assert!(head < next);
    }

    #[test]
    fn downstream_serials_never_regress() {
        let mut registry = DownstreamRegistry::default();
        let peer: IpAddr = "192.0.2.7".parse().unwrap();

        registry.remember(peer, Serial(42));
        registry.remember(peer, Serial(40));
        assert_eq!(registry.get(&peer), Some(Serial(42)));

        registry.remember(peer, Serial(43));
        assert_eq!(registry.get(&peer), Some(Serial(43)));
    }
}
