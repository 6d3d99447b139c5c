//! In-memory zone storage.
//!
//! Every served zone is a [`ZoneData`] whose payload lives in one of the
//! [`ZoneStore`] shapes: a plain owner map for primary zones, an ordered
//! owner slice with a name index for large static zones, the same map shape
//! tagged [`ZoneStore::Rpz`] for mirrored policy feeds, and [`ZoneStore::Xfr`]
//! for transit-only zones that are never answered from.
//!
//! Owner names are handled as canonical presentation strings: lowercase,
//! fully qualified, trailing dot. [`owner_key`] produces that form from any
//! wire name.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use domain::base::name::Name;
use domain::base::{Record, Rtype, Serial, ToName};
use domain::rdata::ZoneRecordData;

pub type StoredName = Name<Bytes>;
pub type StoredRecord = Record<StoredName, ZoneRecordData<Bytes, StoredName>>;

/// Canonical zone/owner name form: lowercase with a trailing dot.
pub fn fqdn(name: &str) -> String {
    let mut name = name.trim_end_matches('.').to_ascii_lowercase();
    name.push('.');
    name
}

pub fn owner_key<N>(name: &N) -> String
where
    N: ToName,
{
    let name = name.to_name::<Bytes>();
    format!("{}", name.fmt_with_dot()).to_ascii_lowercase()
}

/// Label-aligned suffix test: is `name` at or below `zone`?
pub fn is_suffix(zone: &str, name: &str) -> bool {
    if zone == "." {
        return true;
    }
    name == zone || name.ends_with(&format!(".{}", zone))
}

#[derive(Clone, Debug, Default)]
pub struct RrSet {
    pub rrs: Vec<StoredRecord>,
}

impl RrSet {
    pub fn is_empty(&self) -> bool {
        self.rrs.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Owner {
    pub name: StoredName,
    pub rrsets: HashMap<Rtype, RrSet>,
}

impl Owner {
    pub fn new(name: StoredName) -> Self {
        Owner {
            name,
            rrsets: HashMap::new(),
        }
    }

    pub fn get(&self, rtype: Rtype) -> Option<&RrSet> {
        self.rrsets.get(&rtype).filter(|set| !set.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneKind {
    Map,
    Slice,
    Rpz,
    Xfr,
}

#[derive(Clone, Debug)]
pub enum ZoneStore {
    Map(HashMap<String, Owner>),
    Slice {
        owners: Vec<Owner>,
        index: HashMap<String, usize>,
    },
    Rpz(HashMap<String, Owner>),
    Xfr,
}

impl ZoneStore {
    pub fn new(kind: ZoneKind) -> Self {
        match kind {
            ZoneKind::Map => ZoneStore::Map(HashMap::new()),
            ZoneKind::Slice => ZoneStore::Slice {
                owners: Vec::new(),
                index: HashMap::new(),
            },
            ZoneKind::Rpz => ZoneStore::Rpz(HashMap::new()),
            ZoneKind::Xfr => ZoneStore::Xfr,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ZoneData {
    /// Canonical zone name, also the apex owner key.
    pub name: String,
    pub serial: Serial,
    pub store: ZoneStore,
}

impl ZoneData {
    pub fn new(name: &str, kind: ZoneKind) -> crate::error::Result<Self> {
        let name = fqdn(name);
        // Reject zone names that do not parse before they can reach the
        // wire.
        StoredName::bytes_from_str(&name)?;
        Ok(ZoneData {
            name,
            serial: Serial(0),
            store: ZoneStore::new(kind),
        })
    }

    pub fn kind(&self) -> ZoneKind {
        match self.store {
            ZoneStore::Map(_) => ZoneKind::Map,
            ZoneStore::Slice { .. } => ZoneKind::Slice,
            ZoneStore::Rpz(_) => ZoneKind::Rpz,
            ZoneStore::Xfr => ZoneKind::Xfr,
        }
    }

    /// Owner lookup, dispatching on the storage shape. `Xfr` zones hold no
    /// owner data and never answer.
    pub fn find_owner(&self, name: &str) -> Option<&Owner> {
        match &self.store {
            ZoneStore::Map(map) | ZoneStore::Rpz(map) => map.get(name),
            ZoneStore::Slice { owners, index } => index.get(name).map(|i| &owners[*i]),
            ZoneStore::Xfr => None,
        }
    }

    pub fn apex_owner(&self) -> Option<&Owner> {
        self.find_owner(&self.name)
    }

    pub fn soa(&self) -> Option<&StoredRecord> {
        self.apex_owner()
            .and_then(|apex| apex.get(Rtype::SOA))
            .and_then(|set| set.rrs.first())
    }

    pub fn ns_rrset(&self) -> Option<&RrSet> {
        self.apex_owner().and_then(|apex| apex.get(Rtype::NS))
    }

    /// Union of the in-zone A/AAAA RRsets of the NS targets.
    pub fn find_glue(&self, nsset: &RrSet) -> Vec<StoredRecord> {
        let mut glue = Vec::new();
        for rr in &nsset.rrs {
            let ZoneRecordData::Ns(ns) = rr.data() else {
                continue;
            };
            let target = owner_key(ns.nsdname());
            if !is_suffix(&self.name, &target) {
                continue;
            }
            if let Some(owner) = self.find_owner(&target) {
                for rtype in [Rtype::A, Rtype::AAAA] {
                    if let Some(set) = owner.get(rtype) {
                        glue.extend(set.rrs.iter().cloned());
                    }
                }
            }
        }
        glue
    }

    /// File one record under its owner and type. An SOA also refreshes the
    /// zone serial.
    pub fn insert_rr(&mut self, rr: StoredRecord) {
        if let ZoneRecordData::Soa(soa) = rr.data() {
            self.serial = soa.serial();
        }

        let key = owner_key(rr.owner());
        let rtype = rr.rtype();
        match &mut self.store {
            ZoneStore::Map(map) | ZoneStore::Rpz(map) => {
                map.entry(key)
                    .or_insert_with(|| Owner::new(rr.owner().clone()))
                    .rrsets
                    .entry(rtype)
                    .or_default()
                    .rrs
                    .push(rr);
            }
            ZoneStore::Slice { owners, index } => {
                let i = *index.entry(key).or_insert_with(|| {
                    owners.push(Owner::new(rr.owner().clone()));
                    owners.len() - 1
                });
                owners[i].rrsets.entry(rtype).or_default().rrs.push(rr);
            }
            ZoneStore::Xfr => (),
        }
    }
}

/// The set of mirrored upstream zones, keyed by canonical zone name.
///
/// Inbound transfers replace a zone wholesale: the refresh collaborator
/// builds a fresh [`ZoneData`] and [`ZoneRegistry::insert`] swaps it in.
#[derive(Debug, Default)]
pub struct ZoneRegistry {
    zones: HashMap<String, Arc<ZoneData>>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, zone: ZoneData) {
        log::info!(target: "dnsengine", "zone {} loaded (serial {})", zone.name, zone.serial);
        self.zones.insert(zone.name.clone(), Arc::new(zone));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ZoneData>> {
        self.zones.get(name)
    }

    /// Deepest-first suffix search for the zone covering `qname`.
    ///
    /// For `a.b.c.example.` the suffixes `b.c.example.`, `c.example.`,
    /// `example.` and finally `.` are tested in that order; the first
    /// configured zone wins. The qname itself is not tested: an exact apex
    /// hit is dispatched before the suffix walk.
    pub fn find_zone(&self, qname: &str) -> Option<&Arc<ZoneData>> {
        let labels: Vec<&str> = qname.split('.').collect();
        for i in 1..labels.len().saturating_sub(1) {
            let suffix = labels[i..].join(".");
            if let Some(zone) = self.zones.get(&suffix) {
                return Some(zone);
            }
        }
        self.zones.get(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use domain::base::iana::Class;
    use domain::base::Ttl;
    use domain::rdata::{Aaaa, Ns, A};

    fn name(s: &str) -> StoredName {
        StoredName::from_str(s).unwrap()
    }

    fn a_rr(owner: &str, addr: [u8; 4]) -> StoredRecord {
        Record::new(
            name(owner),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::A(A::new(Ipv4Addr::from(addr))),
        )
    }

    fn ns_rr(owner: &str, target: &str) -> StoredRecord {
        Record::new(
            name(owner),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::Ns(Ns::new(name(target))),
        )
    }

    #[test]
    fn fqdn_normalizes() {
        assert_eq!(fqdn("Example.COM"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
        assert_eq!(fqdn("."), ".");
    }

    #[test]
    fn suffix_is_label_aligned() {
        assert!(is_suffix("example.com.", "example.com."));
        assert!(is_suffix("example.com.", "a.example.com."));
        assert!(!is_suffix("example.com.", "badexample.com."));
        assert!(is_suffix(".", "anything.at.all."));
    }

    #[test]
    fn map_and_slice_lookup_agree() {
        let mut map_zone = ZoneData::new("example.com.", ZoneKind::Map).unwrap();
        let mut slice_zone = ZoneData::new("example.com.", ZoneKind::Slice).unwrap();

        for zone in [&mut map_zone, &mut slice_zone] {
            zone.insert_rr(a_rr("www.example.com.", [192, 0, 2, 1]));
            zone.insert_rr(a_rr("mail.example.com.", [192, 0, 2, 2]));
        }

        for qname in ["www.example.com.", "mail.example.com.", "gone.example.com."] {
            assert_eq!(
                map_zone.find_owner(qname).is_some(),
                slice_zone.find_owner(qname).is_some(),
            );
        }
        assert!(map_zone.find_owner("www.example.com.").is_some());
    }

    #[test]
    fn xfr_zone_answers_nothing() {
        let mut zone = ZoneData::new("transit.example.", ZoneKind::Xfr).unwrap();
        zone.insert_rr(a_rr("www.transit.example.", [192, 0, 2, 3]));
        assert!(zone.find_owner("www.transit.example.").is_none());
    }

    #[test]
    fn glue_covers_in_zone_targets_only() {
        let mut zone = ZoneData::new("example.com.", ZoneKind::Map).unwrap();
        zone.insert_rr(ns_rr("example.com.", "ns1.example.com."));
        zone.insert_rr(ns_rr("example.com.", "ns.elsewhere.net."));
        zone.insert_rr(a_rr("ns1.example.com.", [192, 0, 2, 53]));
        zone.insert_rr(Record::new(
            name("ns1.example.com."),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::Aaaa(Aaaa::new("2001:db8::53".parse().unwrap())),
        ));

        let nsset = zone.ns_rrset().unwrap().clone();
        let glue = zone.find_glue(&nsset);
        assert_eq!(glue.len(), 2);
        assert!(glue
            .iter()
            .all(|rr| owner_key(rr.owner()) == "ns1.example.com."));
    }

    #[test]
    fn find_zone_prefers_deepest_suffix() {
        let mut registry = ZoneRegistry::new();
        registry.insert(ZoneData::new("example.", ZoneKind::Map).unwrap());
        registry.insert(ZoneData::new("c.example.", ZoneKind::Map).unwrap());

        let hit = registry.find_zone("a.b.c.example.").unwrap();
        assert_eq!(hit.name, "c.example.");

        let hit = registry.find_zone("other.example.").unwrap();
        assert_eq!(hit.name, "example.");

        assert!(registry.find_zone("something.unknown.").is_none());
    }

    #[test]
    fn find_zone_skips_the_qname_itself() {
        let mut registry = ZoneRegistry::new();
        registry.insert(ZoneData::new("c.example.", ZoneKind::Map).unwrap());

        // An exact apex hit is the dispatcher's job, not the suffix walk's.
        assert!(registry.find_zone("c.example.").is_none());
    }

    #[test]
    fn xfr_zones_mask_shallower_matches() {
        let mut registry = ZoneRegistry::new();
        registry.insert(ZoneData::new("example.", ZoneKind::Map).unwrap());
        registry.insert(ZoneData::new("x.example.", ZoneKind::Xfr).unwrap());

        let hit = registry.find_zone("a.x.example.").unwrap();
        assert_eq!(hit.kind(), ZoneKind::Xfr);
    }

    #[test]
    fn soa_refreshes_serial() {
        use domain::rdata::Soa;

        let mut zone = ZoneData::new("example.com.", ZoneKind::Map).unwrap();
        zone.insert_rr(Record::new(
            name("example.com."),
            Class::IN,
            Ttl::from_secs(3600),
            ZoneRecordData::Soa(Soa::new(
                name("ns1.example.com."),
                name("hostmaster.example.com."),
                Serial(77),
                Ttl::from_secs(3600),
                Ttl::from_secs(900),
                Ttl::from_secs(604800),
                Ttl::from_secs(300),
            )),
        ));
        assert_eq!(zone.serial, Serial(77));
        assert!(zone.soa().is_some());
    }
}
