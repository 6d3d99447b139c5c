//! Fusing the source lists into the published RPZ image.
//!
//! The merge is recomputed in full on every rebuild and is deterministic:
//! blacklisted names go straight to the output, greylisted names pass the
//! policy predicate, and a name present in any whitelist is never emitted.
//! Each rebuild bumps the zone serial by one and leaves exactly one delta
//! in the IXFR journal.

use std::collections::{BTreeMap, HashMap};

use domain::base::iana::Class;
use domain::base::{Record, Serial, Ttl};
use domain::rdata::{Cname, Ns, Soa, ZoneRecordData};

use crate::config::{OutputConfig, PolicyConfig};
use crate::error::Result;
use crate::rpz::{Action, IxfrDelta, RpzImage, RpzRule, RpzState};
use crate::source::{SourceKind, SourceRegistry, TagSet};
use crate::zone::StoredName;

const RULE_TTL: Ttl = Ttl::from_secs(300);
const APEX_TTL: Ttl = Ttl::from_secs(3600);

#[derive(Clone, Debug)]
pub struct Policy {
    pub blacklist_action: Action,
    pub numsources_limit: usize,
    pub numsources_action: Action,
    pub numtapirtags_limit: usize,
    pub numtapirtags_action: Action,
    pub blacktapir_tags: TagSet,
    pub blacktapir_action: Action,
}

impl From<&PolicyConfig> for Policy {
    fn from(config: &PolicyConfig) -> Self {
        Policy {
            blacklist_action: config.blacklist.action,
            numsources_limit: config.greylist.numsources.limit,
            numsources_action: config.greylist.numsources.action,
            numtapirtags_limit: config.greylist.numtapirtags.limit,
            numtapirtags_action: config.greylist.numtapirtags.action,
            blacktapir_tags: TagSet::from_names(&config.greylist.blacktapir.tags),
            blacktapir_action: config.greylist.blacktapir.action,
        }
    }
}

pub struct Merger {
    policy: Policy,
    zone_name: String,
    apex: StoredName,
    soa_mname: StoredName,
    soa_rname: StoredName,
    ns_names: Vec<StoredName>,
}

impl Merger {
    pub fn new(output: &OutputConfig, policy: &PolicyConfig) -> Result<Self> {
        let zone_name = output.zone_apex();
        let apex = StoredName::bytes_from_str(&zone_name)?;
        let soa_mname = StoredName::bytes_from_str(&output.soa_mname())?;
        let soa_rname = StoredName::bytes_from_str(&output.soa_rname())?;
        let ns_names = output
            .ns_names()
            .iter()
            .map(|n| StoredName::bytes_from_str(n).map_err(Into::into))
            .collect::<Result<Vec<_>>>()?;

        log::debug!(target: "rpz",
            "policy: whitelist={}, blacklist={}, greylist numsources>={} numtapirtags>={}",
            policy.whitelist.action, policy.blacklist.action,
            policy.greylist.numsources.limit, policy.greylist.numtapirtags.limit);

        Ok(Merger {
            policy: Policy::from(policy),
            zone_name,
            apex,
            soa_mname,
            soa_rname,
            ns_names,
        })
    }

    pub fn zone_name(&self) -> &str {
        &self.zone_name
    }

    /// The empty image the responder serves until the first rebuild.
    pub fn bootstrap_image(&self) -> RpzImage {
        let serial = Serial(1);
        RpzImage {
            serial,
            soa: self.soa_record(serial),
            ns: self.ns_records(),
            data: HashMap::new(),
        }
    }

    /// Recompute the image from the current source snapshot, publish it
    /// and journal the delta against the previous image.
    pub fn rebuild(&self, sources: &SourceRegistry, rpz: &RpzState) -> Result<(Serial, IxfrDelta)> {
        let decisions = self.decide(sources);

        let prev = rpz.image();
        let serial = prev.serial.add(1);

        let mut data = HashMap::with_capacity(decisions.len());
        for (name, action) in decisions {
            let qualified = format!("{}{}", name, self.zone_name);
            let owner = StoredName::bytes_from_str(&qualified)?;
            let target = StoredName::bytes_from_str(action.cname_target())?;
            let rr = Record::new(
                owner,
                Class::IN,
                RULE_TTL,
                ZoneRecordData::Cname(Cname::new(target)),
            );
            data.insert(
                qualified.clone(),
                RpzRule {
                    name: qualified,
                    rr,
                    action,
                },
            );
        }

        let mut removed = Vec::new();
        let mut added = Vec::new();
        for (name, rule) in prev.data.iter() {
            match data.get(name) {
                Some(new) if new.action == rule.action => (),
                _ => removed.push(rule.clone()),
            }
        }
        for (name, rule) in data.iter() {
            match prev.data.get(name) {
                Some(old) if old.action == rule.action => (),
                _ => added.push(rule.clone()),
            }
        }

        let delta = IxfrDelta {
            from_serial: prev.serial,
            to_serial: serial,
            removed,
            added,
        };

        let image = RpzImage {
            serial,
            soa: self.soa_record(serial),
            ns: self.ns_records(),
            data,
        };

        log::info!(target: "rpz",
            "rebuild: serial {} -> {}, {} rules (+{} -{})",
            delta.from_serial, serial, image.data.len(),
            delta.added.len(), delta.removed.len());

        rpz.publish(image, delta.clone());
        Ok((serial, delta))
    }

    /// The merge proper: unqualified name to action, after whitelist
    /// dominance and the greylist policy predicate.
    fn decide(&self, sources: &SourceRegistry) -> BTreeMap<String, Action> {
        let mut out: BTreeMap<String, Action> = BTreeMap::new();
        let mut include = |out: &mut BTreeMap<String, Action>, name: &str, action: Action| {
            out.entry(name.to_string())
                .and_modify(|current| *current = current.more_severe(action))
                .or_insert(action);
        };

        for list in sources.lists_of(SourceKind::Blacklist) {
            for (name, rule) in &list.names {
                if sources.is_whitelisted(name) {
                    continue;
                }
                // Feed-delivered rules carry their own action; bare names
                // from file sources take the configured blacklist action.
                let action = match rule.action {
                    Action::Unknown => self.policy.blacklist_action,
                    action => action,
                };
                include(&mut out, name, action);
            }
        }

        struct GreyFacts {
            sources: usize,
            tags: TagSet,
        }

        let mut grey: BTreeMap<String, GreyFacts> = BTreeMap::new();
        for list in sources.lists_of(SourceKind::Greylist) {
            for (name, rule) in &list.names {
                if sources.is_whitelisted(name) {
                    continue;
                }
                let facts = grey.entry(name.clone()).or_insert(GreyFacts {
                    sources: 0,
                    tags: TagSet::default(),
                });
                facts.sources += 1;
                facts.tags.merge(&rule.tags);
            }
        }

        for (name, facts) in grey {
            let mut decided: Option<Action> = None;
            let mut apply = |action: Action| {
                decided = Some(match decided {
                    Some(current) => current.more_severe(action),
                    None => action,
                });
            };

            if facts.sources >= self.policy.numsources_limit {
                apply(self.policy.numsources_action);
            }
            if facts.tags.len() >= self.policy.numtapirtags_limit {
                apply(self.policy.numtapirtags_action);
            }
            if facts.tags.intersects(&self.policy.blacktapir_tags) {
                apply(self.policy.blacktapir_action);
            }

            if let Some(action) = decided {
                include(&mut out, &name, action);
            }
        }

        out
    }

    fn soa_record(&self, serial: Serial) -> crate::zone::StoredRecord {
        Record::new(
            self.apex.clone(),
            Class::IN,
            RULE_TTL,
            ZoneRecordData::Soa(Soa::new(
                self.soa_mname.clone(),
                self.soa_rname.clone(),
                serial,
                APEX_TTL,
                Ttl::from_secs(900),
                Ttl::from_secs(604800),
                RULE_TTL,
            )),
        )
    }

    fn ns_records(&self) -> Vec<crate::zone::StoredRecord> {
        self.ns_names
            .iter()
            .map(|ns| {
                Record::new(
                    self.apex.clone(),
                    Class::IN,
                    APEX_TTL,
                    ZoneRecordData::Ns(Ns::new(ns.clone())),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use crate::config::SourceConfig;
    use crate::source::{ListedName, SourceBackend, SourceFormat};

    fn merger(policy: &PolicyConfig) -> Merger {
        let output = OutputConfig {
            zonename: "rpz.local".to_string(),
            mname: None,
            rname: None,
            ns: Vec::new(),
        };
        Merger::new(&output, policy).unwrap()
    }

    fn policy() -> PolicyConfig {
        use crate::config::{GreylistConfig, ListPolicy, TagPolicy, Threshold};

        PolicyConfig {
            whitelist: ListPolicy {
                action: Action::Passthru,
            },
            blacklist: ListPolicy {
                action: Action::Nxdomain,
            },
            greylist: GreylistConfig {
                numsources: Threshold {
                    limit: 2,
                    action: Action::Nxdomain,
                },
                numtapirtags: Threshold {
                    limit: 3,
                    action: Action::Nodata,
                },
                blacktapir: TagPolicy {
                    tags: vec!["malware".to_string()],
                    action: Action::Drop,
                },
            },
        }
    }

    fn add_source(registry: &mut SourceRegistry, id: &str, kind: SourceKind) {
        registry.add_source(&SourceConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: "test".to_string(),
            kind,
            source: SourceBackend::File,
            format: SourceFormat::Domains,
            filename: None,
            zone: None,
            upstream: None,
        });
    }

    fn tagged(name: &str, tags: &[&str]) -> ListedName {
        ListedName {
            name: name.to_string(),
            tags: TagSet::from_names(tags.iter().copied()),
            action: Action::Unknown,
        }
    }

    fn rpz_state(merger: &Merger) -> RpzState {
        RpzState::new(merger.zone_name().to_string(), merger.bootstrap_image())
    }

    #[test]
    fn whitelist_dominance_is_absolute() {
        let merger = merger(&policy());
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "white", SourceKind::Whitelist);
        add_source(&mut sources, "black", SourceKind::Blacklist);

        sources.ingest_rule(
            SourceKind::Whitelist,
            "white",
            ListedName::passthru("safe.example."),
        );
        sources.ingest_rule(
            SourceKind::Blacklist,
            "black",
            ListedName::bare("safe.example."),
        );
        sources.ingest_rule(
            SourceKind::Blacklist,
            "black",
            ListedName::bare("bad.example."),
        );

        let decisions = merger.decide(&sources);
        assert!(!decisions.contains_key("safe.example."));
        assert_eq!(decisions.get("bad.example."), Some(&Action::Nxdomain));
    }

    #[test]
    fn feed_rules_keep_their_own_action() {
        let merger = merger(&policy());
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "black", SourceKind::Blacklist);

        sources.ingest_rule(
            SourceKind::Blacklist,
            "black",
            ListedName {
                name: "dropme.example.".to_string(),
                tags: TagSet::default(),
                action: Action::Drop,
            },
        );

        let decisions = merger.decide(&sources);
        assert_eq!(decisions.get("dropme.example."), Some(&Action::Drop));
    }

    #[test]
    fn greylist_numsources_predicate() {
        let merger = merger(&policy());
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "g1", SourceKind::Greylist);
        add_source(&mut sources, "g2", SourceKind::Greylist);

        sources.ingest_rule(SourceKind::Greylist, "g1", tagged("meh.example.", &[]));
        assert!(merger.decide(&sources).is_empty());

        sources.ingest_rule(SourceKind::Greylist, "g2", tagged("meh.example.", &[]));
        assert_eq!(
            merger.decide(&sources).get("meh.example."),
            Some(&Action::Nxdomain)
        );
    }

    #[test]
    fn greylist_tag_count_predicate() {
        let merger = merger(&policy());
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "g1", SourceKind::Greylist);

        sources.ingest_rule(
            SourceKind::Greylist,
            "g1",
            tagged("busy.example.", &["dga", "phishing", "spam"]),
        );
        assert_eq!(
            merger.decide(&sources).get("busy.example."),
            Some(&Action::Nodata)
        );
    }

    #[test]
    fn most_severe_action_wins_across_predicates() {
        let merger = merger(&policy());
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "g1", SourceKind::Greylist);
        add_source(&mut sources, "g2", SourceKind::Greylist);

        // Both the numsources (nxdomain) and blacktapir (drop) predicates
        // match; drop is more severe.
        sources.ingest_rule(
            SourceKind::Greylist,
            "g1",
            tagged("evil.example.", &["malware"]),
        );
        sources.ingest_rule(SourceKind::Greylist, "g2", tagged("evil.example.", &[]));

        assert_eq!(
            merger.decide(&sources).get("evil.example."),
            Some(&Action::Drop)
        );
    }

    #[test]
    fn untriggered_greylist_names_are_excluded() {
        let merger = merger(&policy());
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "g1", SourceKind::Greylist);

        sources.ingest_rule(
            SourceKind::Greylist,
            "g1",
            tagged("quiet.example.", &["spam"]),
        );
        assert!(merger.decide(&sources).is_empty());
    }

    #[test]
    fn merge_is_deterministic_across_insertion_order() {
        let merger = merger(&policy());

        let build = |order: &[&str]| {
            let mut sources = SourceRegistry::new();
            add_source(&mut sources, "black", SourceKind::Blacklist);
            add_source(&mut sources, "g1", SourceKind::Greylist);
            add_source(&mut sources, "g2", SourceKind::Greylist);
            for name in order {
                sources.ingest_rule(SourceKind::Blacklist, "black", ListedName::bare(name));
                sources.ingest_rule(SourceKind::Greylist, "g1", tagged(name, &["malware"]));
                sources.ingest_rule(SourceKind::Greylist, "g2", tagged(name, &[]));
            }
            merger.decide(&sources)
        };

        let forward = build(&["a.example.", "b.example.", "c.example."]);
        let backward = build(&["c.example.", "b.example.", "a.example."]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn rebuild_bumps_serial_and_journals_the_delta() {
        let merger = merger(&policy());
        let rpz = rpz_state(&merger);
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "black", SourceKind::Blacklist);

        sources.ingest_rule(
            SourceKind::Blacklist,
            "black",
            ListedName::bare("bad.example."),
        );
        let (serial, delta) = merger.rebuild(&sources, &rpz).unwrap();
        assert_eq!(serial, Serial(2));
        assert_eq!(delta.added.len(), 1);
        assert!(delta.removed.is_empty());
        assert_eq!(delta.added[0].name, "bad.example.rpz.local.");
        assert_eq!(rpz.current_serial(), Serial(2));

        sources.bulk_replace(
            SourceKind::Blacklist,
            "black",
            vec![ListedName::bare("worse.example.")],
        );
        let (serial, delta) = merger.rebuild(&sources, &rpz).unwrap();
        assert_eq!(serial, Serial(3));
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].name, "bad.example.rpz.local.");
        assert_eq!(delta.added.len(), 1);

        let state = rpz.journal.lock().unwrap();
        let chain = state.journal.walk(Serial(1)).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn walked_deltas_replay_to_the_current_image() {
        let merger = merger(&policy());
        let rpz = rpz_state(&merger);
        let mut sources = SourceRegistry::new();
        add_source(&mut sources, "black", SourceKind::Blacklist);

        sources.ingest_rule(SourceKind::Blacklist, "black", ListedName::bare("a.example."));
        merger.rebuild(&sources, &rpz).unwrap();
        sources.ingest_rule(SourceKind::Blacklist, "black", ListedName::bare("b.example."));
        merger.rebuild(&sources, &rpz).unwrap();
        sources.bulk_replace(
            SourceKind::Blacklist,
            "black",
            vec![ListedName::bare("b.example.")],
        );
        merger.rebuild(&sources, &rpz).unwrap();

        // Replay the chain from serial 1 over an empty rule set.
        let mut replayed: HashSet<String> = HashSet::new();
        let state = rpz.journal.lock().unwrap();
        for delta in state.journal.walk(Serial(1)).unwrap() {
            for rule in &delta.removed {
                replayed.remove(&rule.name);
            }
            for rule in &delta.added {
                replayed.insert(rule.name.clone());
            }
        }

        let image = rpz.image();
        let current: HashSet<String> = image.data.keys().cloned().collect();
        assert_eq!(replayed, current);
    }
}
