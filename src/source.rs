//! Typed threat-intel sources and the registry that holds them.
//!
//! A source is a named list of one kind (whitelist, greylist, blacklist)
//! fed from a file, an upstream RPZ feed or an MQTT stream. Rules that do
//! not match their source's kind are redirected at ingest into one of two
//! catch-all buckets, so the merge never sees a misfiled rule:
//!
//!  1. a passthru rule inside a grey/black source goes to `white_catchall`;
//!  2. a non-passthru rule inside a whitelist source goes to `grey_catchall`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use domain::rdata::ZoneRecordData;
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::rpz::Action;
use crate::zone::{owner_key, StoredRecord};

pub const WHITE_CATCHALL: &str = "white_catchall";
pub const GREY_CATCHALL: &str = "grey_catchall";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Whitelist,
    Greylist,
    Blacklist,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceKind::Whitelist => "whitelist",
            SourceKind::Greylist => "greylist",
            SourceKind::Blacklist => "blacklist",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    File,
    Xfr,
    Mqtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Domains,
    Dawg,
}

/// Tags attached to a name by upstream threat intel. Counted and
/// intersected by the greylist policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TagSet(
            names
                .into_iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: &TagSet) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn intersects(&self, other: &TagSet) -> bool {
        self.0.iter().any(|tag| other.0.contains(tag))
    }
}

/// One listed name inside a source. File-delivered black/grey entries
/// carry no action of their own ([`Action::Unknown`]); the policy decides
/// at merge time.
#[derive(Clone, Debug)]
pub struct ListedName {
    pub name: String,
    pub tags: TagSet,
    pub action: Action,
}

impl ListedName {
    pub fn bare(name: &str) -> Self {
        ListedName {
            name: name.to_string(),
            tags: TagSet::default(),
            action: Action::Unknown,
        }
    }

    pub fn passthru(name: &str) -> Self {
        ListedName {
            name: name.to_string(),
            tags: TagSet::default(),
            action: Action::Passthru,
        }
    }
}

/// Membership probe for whitelists delivered as DAWG dictionaries. The
/// collaborator loads the file and attaches the finder; a bad file is
/// fatal at startup on its side.
pub trait DawgFinder: Send + Sync + std::fmt::Debug {
    fn contains(&self, name: &str) -> bool;
}

#[derive(Clone, Debug)]
pub struct SourceList {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: SourceKind,
    pub names: HashMap<String, ListedName>,
    pub dawg: Option<Arc<dyn DawgFinder>>,
}

impl SourceList {
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
            || self
                .dawg
                .as_ref()
                .map(|finder| finder.contains(name))
                .unwrap_or(false)
    }
}

/// All configured sources plus the two implicit catch-all buckets.
/// Mutated only by the refresh collaborator; the merger reads a snapshot.
#[derive(Debug)]
pub struct SourceRegistry {
    lists: HashMap<SourceKind, HashMap<String, SourceList>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        let mut registry = SourceRegistry {
            lists: HashMap::new(),
        };
        registry.insert_list(SourceList {
            id: WHITE_CATCHALL.to_string(),
            name: WHITE_CATCHALL.to_string(),
            description: "whitelist of passthru rules found in grey or black sources".to_string(),
            kind: SourceKind::Whitelist,
            names: HashMap::new(),
            dawg: None,
        });
        registry.insert_list(SourceList {
            id: GREY_CATCHALL.to_string(),
            name: GREY_CATCHALL.to_string(),
            description: "greylist of rules found in whitelist sources".to_string(),
            kind: SourceKind::Greylist,
            names: HashMap::new(),
            dawg: None,
        });
        registry
    }

    fn insert_list(&mut self, list: SourceList) {
        self.lists
            .entry(list.kind)
            .or_default()
            .insert(list.id.clone(), list);
    }

    pub fn add_source(&mut self, config: &SourceConfig) {
        log::info!(target: "sources",
            "registered source {} ({}, {:?})", config.id, config.kind, config.source);
        self.insert_list(SourceList {
            id: config.id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            kind: config.kind,
            names: HashMap::new(),
            dawg: None,
        });
    }

    pub fn get(&self, kind: SourceKind, id: &str) -> Option<&SourceList> {
        self.lists.get(&kind).and_then(|m| m.get(id))
    }

    pub fn lists_of(&self, kind: SourceKind) -> impl Iterator<Item = &SourceList> {
        self.lists.get(&kind).into_iter().flat_map(|m| m.values())
    }

    pub fn attach_dawg(&mut self, id: &str, finder: Arc<dyn DawgFinder>) {
        match self
            .lists
            .get_mut(&SourceKind::Whitelist)
            .and_then(|m| m.get_mut(id))
        {
            Some(list) => list.dawg = Some(finder),
            None => {
                log::warn!(target: "sources", "dawg finder for unknown whitelist {}", id)
            }
        }
    }

    /// File one rule, redirecting it into a catch-all bucket when its
    /// action does not match the source's kind. This runs before any
    /// merge, so per-source lists always honor the kind invariant.
    pub fn ingest_rule(&mut self, kind: SourceKind, source_id: &str, rule: ListedName) {
        let (kind, source_id) = match (kind, rule.action) {
            (SourceKind::Whitelist, Action::Passthru) => (kind, source_id),
            (SourceKind::Whitelist, _) => {
                log::warn!(target: "sources",
                    "whitelist source {} has non-white rule: {} ({})",
                    source_id, rule.name, rule.action);
                (SourceKind::Greylist, GREY_CATCHALL)
            }
            (_, Action::Passthru) => {
                log::warn!(target: "sources",
                    "{} source {} has whitelisted name: {}", kind, source_id, rule.name);
                (SourceKind::Whitelist, WHITE_CATCHALL)
            }
            (kind, _) => (kind, source_id),
        };

        match self.lists.get_mut(&kind).and_then(|m| m.get_mut(source_id)) {
            Some(list) => {
                list.names.insert(rule.name.clone(), rule);
            }
            None => {
                log::warn!(target: "sources", "rule for unknown source {}", source_id)
            }
        }
    }

    /// Replace a source's payload wholesale, re-running catch-all
    /// redirection over the new rule set.
    pub fn bulk_replace(&mut self, kind: SourceKind, source_id: &str, rules: Vec<ListedName>) {
        match self.lists.get_mut(&kind).and_then(|m| m.get_mut(source_id)) {
            Some(list) => list.names.clear(),
            None => {
                log::warn!(target: "sources", "bulk replace for unknown source {}", source_id);
                return;
            }
        }
        let count = rules.len();
        for rule in rules {
            self.ingest_rule(kind, source_id, rule);
        }
        log::info!(target: "sources", "source {} replaced, {} rules", source_id, count);
    }

    /// Whitelist dominance probe: is the (unqualified) name present in any
    /// whitelist source, map or DAWG?
    pub fn is_whitelisted(&self, name: &str) -> bool {
        self.lists_of(SourceKind::Whitelist)
            .any(|list| list.contains(name))
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        SourceRegistry::new()
    }
}

/// RR types worth keeping when mirroring an RPZ feed.
pub fn keep_rpz_rtype(rtype: domain::base::Rtype) -> bool {
    matches!(
        rtype,
        domain::base::Rtype::SOA | domain::base::Rtype::NS | domain::base::Rtype::CNAME
    )
}

/// What to do with one RR arriving from an RPZ feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Zone infrastructure (SOA, NS): keep in the mirror, no rule.
    KeepZone,
    /// A policy rule: the unqualified name and the action its CNAME target
    /// encodes. Handed to [`SourceRegistry::ingest_rule`].
    Rule { name: String, action: Action },
    /// Not RPZ material; reject the RR.
    Skip,
}

/// Per-source feed parser, replacing the original's per-RR callback
/// factory with something testable in isolation.
#[derive(Clone, Debug)]
pub struct RuleClassifier {
    pub source_id: String,
    pub kind: SourceKind,
}

impl RuleClassifier {
    pub fn new(source_id: &str, kind: SourceKind) -> Self {
        RuleClassifier {
            source_id: source_id.to_string(),
            kind,
        }
    }

    pub fn classify(&self, rr: &StoredRecord, apex: &str) -> Classification {
        match rr.data() {
            ZoneRecordData::Soa(_) | ZoneRecordData::Ns(_) => Classification::KeepZone,
            ZoneRecordData::Cname(cname) => {
                let target = owner_key(cname.cname());
                let action = Action::from_cname_target(&target);
                if action == Action::Unknown {
                    log::warn!(target: "sources",
                        "source {}: unknown rpz action: \"{}\"", self.source_id, target);
                }
                let owner = owner_key(rr.owner());
                let name = owner
                    .strip_suffix(apex)
                    .unwrap_or(owner.as_str())
                    .to_string();
                Classification::Rule { name, action }
            }
            _ => Classification::Skip,
        }
    }
}
