//! The seam between the core and the transfer collaborator.
//!
//! The core never fetches zones itself. NOTIFY handling and source
//! bootstrap enqueue [`RpzRefresh`] requests; the collaborator performs
//! the transfer and calls back into the source registry
//! ([`crate::source::SourceRegistry::bulk_replace`] /
//! [`crate::source::SourceRegistry::ingest_rule`]) and the zone registry.

use std::sync::Arc;

use domain::base::Rtype;
use tokio::sync::mpsc;

use crate::source::RuleClassifier;
use crate::zone::ZoneKind;

/// NOTIFY is advisory; a small queue is plenty and overflow just drops.
pub const REFRESH_QUEUE_CAPACITY: usize = 10;

/// Ask the collaborator to (re)fetch one upstream zone.
///
/// From NOTIFY only `name` and `zone_kind` are populated and the
/// collaborator looks up the upstream itself; source bootstrap fills in
/// the upstream address, the RR keep predicate and the feed classifier.
#[derive(Clone, Debug)]
pub struct RpzRefresh {
    pub name: String,
    pub upstream: Option<String>,
    pub zone_kind: ZoneKind,
    pub keep: Option<fn(Rtype) -> bool>,
    pub classify: Option<Arc<RuleClassifier>>,
}

#[derive(Clone, Debug)]
pub struct RefreshQueue(mpsc::Sender<RpzRefresh>);

impl RefreshQueue {
    pub fn new() -> (Self, mpsc::Receiver<RpzRefresh>) {
        let (tx, rx) = mpsc::channel(REFRESH_QUEUE_CAPACITY);
        (RefreshQueue(tx), rx)
    }

    /// Non-blocking enqueue. A full queue drops the request; the upstream
    /// will be picked up by the next NOTIFY or periodic refresh.
    pub fn request(&self, refresh: RpzRefresh) {
        let name = refresh.name.clone();
        if self.0.try_send(refresh).is_err() {
            log::warn!(target: "refresh", "refresh queue full, dropping request for {}", name);
        }
    }
}

/// Keep the consumer end alive and surface requests in the log. The
/// transfer engine replaces this loop when it attaches.
pub async fn drain(mut rx: mpsc::Receiver<RpzRefresh>) {
    while let Some(refresh) = rx.recv().await {
        log::debug!(target: "refresh",
            "refresh requested for zone {} ({:?})", refresh.name, refresh.zone_kind);
    }
}
