//! The responders behind the dispatcher: the synthesized RPZ (SOA, AXFR,
//! IXFR, sub-names) and mirrored upstream zones (apex and below-apex).

use std::net::SocketAddr;

use domain::base::iana::Rcode;
use domain::base::{Message, ParsedName, Record, Rtype, Serial};
use domain::net::server::util::mk_builder_for_target;
use domain::rdata::{Soa, ZoneRecordData};

use super::{push_message, refused, set_axfr_header, MsgSender, Pop, Transport};
use crate::rpz::IxfrDelta;
use crate::zone::{is_suffix, owner_key, StoredRecord, ZoneData};

/// Build and send one complete response: answers, authority, additional.
/// A push failure abandons the exchange, it is not retried.
fn respond(
    msg: &Message<Vec<u8>>,
    rcode: Rcode,
    answers: Vec<StoredRecord>,
    authority: Vec<StoredRecord>,
    extra: Vec<StoredRecord>,
    sender: &MsgSender,
) {
    let Ok(mut answer) = mk_builder_for_target().start_answer(msg, rcode) else {
        return;
    };
    answer.header_mut().set_aa(true);
    for rr in answers {
        if answer.push(rr).is_err() {
            return;
        }
    }
    let mut authority_builder = answer.authority();
    for rr in authority {
        if authority_builder.push(rr).is_err() {
            return;
        }
    }
    let mut additional = authority_builder.additional();
    for rr in extra {
        if additional.push(rr).is_err() {
            return;
        }
    }
    push_message(additional, sender);
}

/// One RR of an AXFR/IXFR stream, as its own message.
fn send_xfr_rr(msg: &Message<Vec<u8>>, rr: StoredRecord, sender: &MsgSender) {
    let Ok(mut answer) = mk_builder_for_target().start_answer(msg, Rcode::NOERROR) else {
        return;
    };
    if answer.push(rr).is_err() {
        return;
    }
    let mut additional = answer.additional();
    set_axfr_header(msg, &mut additional);
    push_message(additional, sender);
}

/// The image SOA rewritten to carry `serial`, for IXFR delta framing.
fn soa_at(soa: &StoredRecord, serial: Serial) -> StoredRecord {
    let ZoneRecordData::Soa(data) = soa.data() else {
        return soa.clone();
    };
    Record::new(
        soa.owner().clone(),
        soa.class(),
        soa.ttl(),
        ZoneRecordData::Soa(Soa::new(
            data.mname().clone(),
            data.rname().clone(),
            serial,
            data.refresh(),
            data.retry(),
            data.expire(),
            data.minimum(),
        )),
    )
}

/// The downstream's own serial, from the authority SOA of its IXFR query.
fn request_serial(msg: &Message<Vec<u8>>) -> Option<Serial> {
    msg.authority()
        .ok()?
        .limit_to::<Soa<ParsedName<&[u8]>>>()
        .flatten()
        .next()
        .map(|record| record.data().serial())
}

/// Queries at the apex of the synthesized zone.
pub(super) fn rpz_apex(
    pop: &Pop,
    msg: &Message<Vec<u8>>,
    qtype: Rtype,
    peer: SocketAddr,
    transport: Transport,
    sender: &MsgSender,
) {
    match qtype {
        Rtype::SOA => {
            let image = pop.rpz.image();
            respond(
                msg,
                Rcode::NOERROR,
                vec![image.soa.clone()],
                image.ns.clone(),
                Vec::new(),
                sender,
            );
        }
        Rtype::AXFR => {
            if transport == Transport::Udp {
                // RFC 5936 §4.2: no AXFR over UDP; a lone truncated SOA
                // sends the client back over TCP.
                let image = pop.rpz.image();
                let Ok(mut answer) = mk_builder_for_target().start_answer(msg, Rcode::NOERROR)
                else {
                    return;
                };
                if answer.push(image.soa.clone()).is_err() {
                    return;
                }
                let mut additional = answer.additional();
                additional.header_mut().set_aa(true);
                additional.header_mut().set_tc(true);
                push_message(additional, sender);
                return;
            }
            axfr_out(pop, msg, sender);
        }
        Rtype::IXFR => ixfr_out(pop, msg, peer, sender),
        _ => {
            // every apex query we don't want to deal with
            let image = pop.rpz.image();
            respond(
                msg,
                Rcode::REFUSED,
                Vec::new(),
                image.ns.clone(),
                Vec::new(),
                sender,
            );
        }
    }
}

fn axfr_out(pop: &Pop, msg: &Message<Vec<u8>>, sender: &MsgSender) {
    let image = pop.rpz.image();
    log::info!(target: "dnsengine",
        "axfr out: zone {} serial {}, {} rules",
        pop.rpz.zone_name, image.serial, image.data.len());

    // RFC 5936: the SOA bookends the stream; everything in between may
    // come in any order.
    send_xfr_rr(msg, image.soa.clone(), sender);
    for ns in &image.ns {
        send_xfr_rr(msg, ns.clone(), sender);
    }
    for rule in image.data.values() {
        send_xfr_rr(msg, rule.rr.clone(), sender);
    }
    send_xfr_rr(msg, image.soa.clone(), sender);
}

fn ixfr_out(pop: &Pop, msg: &Message<Vec<u8>>, peer: SocketAddr, sender: &MsgSender) {
    let current = pop.rpz.current_serial();

    let Some(from) = request_serial(msg) else {
        log::debug!(target: "dnsengine",
            "ixfr request without authority soa, answering axfr");
        axfr_out(pop, msg, sender);
        remember(pop, peer, current);
        return;
    };

    if from == current {
        // Downstream is up to date: a single SOA says so.
        let image = pop.rpz.image();
        send_xfr_rr(msg, image.soa.clone(), sender);
        remember(pop, peer, current);
        return;
    }

    let image = pop.rpz.image();
    let mut state = pop.rpz.journal.lock().unwrap();
    let chain: Option<Vec<IxfrDelta>> = state
        .journal
        .walk(from)
        .map(|chain| chain.into_iter().cloned().collect());

    let Some(chain) = chain else {
        log::info!(target: "dnsengine",
            "ixfr from {} not in journal (current {}), downgrading to axfr",
            from, current);
        drop(state);
        axfr_out(pop, msg, sender);
        remember(pop, peer, current);
        return;
    };

    log::info!(target: "dnsengine",
        "ixfr out: {} deltas, serial {} -> {}", chain.len(), from, current);

    // RFC 1995 framing: SOA(current), then per delta SOA(old), deleted
    // RRs, SOA(new), added RRs, closed by SOA(current).
    send_xfr_rr(msg, image.soa.clone(), sender);
    for delta in &chain {
        send_xfr_rr(msg, soa_at(&image.soa, delta.from_serial), sender);
        for rule in &delta.removed {
            send_xfr_rr(msg, rule.rr.clone(), sender);
        }
        send_xfr_rr(msg, soa_at(&image.soa, delta.to_serial), sender);
        for rule in &delta.added {
            send_xfr_rr(msg, rule.rr.clone(), sender);
        }
    }
    send_xfr_rr(msg, image.soa.clone(), sender);

    state.downstreams.remember(peer.ip(), current);
}

fn remember(pop: &Pop, peer: SocketAddr, serial: Serial) {
    pop.rpz
        .journal
        .lock()
        .unwrap()
        .downstreams
        .remember(peer.ip(), serial);
}

/// Names strictly below the RPZ apex, answered from the image.
pub(super) fn rpz_subname(
    pop: &Pop,
    msg: &Message<Vec<u8>>,
    qname: &str,
    qtype: Rtype,
    sender: &MsgSender,
) {
    let image = pop.rpz.image();
    match image.data.get(qname) {
        Some(rule) => match qtype {
            Rtype::CNAME | Rtype::ANY => respond(
                msg,
                Rcode::NOERROR,
                vec![rule.rr.clone()],
                image.ns.clone(),
                Vec::new(),
                sender,
            ),
            _ => respond(
                msg,
                Rcode::NOERROR,
                Vec::new(),
                vec![image.soa.clone()],
                Vec::new(),
                sender,
            ),
        },
        None => respond(
            msg,
            Rcode::NXDOMAIN,
            Vec::new(),
            vec![image.soa.clone()],
            Vec::new(),
            sender,
        ),
    }
}

fn ns_and_glue(zone: &ZoneData) -> (Vec<StoredRecord>, Vec<StoredRecord>) {
    match zone.ns_rrset() {
        Some(set) => (set.rrs.clone(), zone.find_glue(set)),
        None => (Vec::new(), Vec::new()),
    }
}

/// Queries at the apex of a mirrored upstream zone: SOA only, everything
/// else is refused.
pub(super) fn mirror_apex(
    zone: &ZoneData,
    msg: &Message<Vec<u8>>,
    qtype: Rtype,
    sender: &MsgSender,
) {
    let (ns, glue) = ns_and_glue(zone);
    match qtype {
        Rtype::SOA => match zone.soa() {
            Some(soa) => respond(msg, Rcode::NOERROR, vec![soa.clone()], ns, glue, sender),
            None => refused(msg, sender),
        },
        _ => respond(msg, Rcode::REFUSED, Vec::new(), ns, Vec::new(), sender),
    }
}

/// Queries below the apex of a mirrored zone.
pub(super) fn mirror_query(
    zone: &ZoneData,
    msg: &Message<Vec<u8>>,
    qname: &str,
    qtype: Rtype,
    sender: &MsgSender,
) {
    let soa_authority: Vec<StoredRecord> = zone.soa().cloned().into_iter().collect();

    let owner = match zone.find_owner(qname) {
        Some(owner) if !owner.rrsets.is_empty() => owner,
        _ => {
            respond(
                msg,
                Rcode::NXDOMAIN,
                Vec::new(),
                soa_authority,
                Vec::new(),
                sender,
            );
            return;
        }
    };

    // A CNAME owner answers with the CNAME whatever was asked, chased
    // once when the target is in-zone. Checked before the exact match so
    // a CNAME next to DNSSEC types is still found.
    if let Some(cnames) = owner.get(Rtype::CNAME) {
        if cnames.rrs.len() > 1 {
            log::warn!(target: "dnsengine",
                "zone {}: illegal content: multiple CNAME RRs at {}", zone.name, qname);
        }
        let cname = cnames.rrs[0].clone();
        let mut answers = vec![cname.clone()];
        let mut authority = Vec::new();
        let mut extra = Vec::new();

        if let ZoneRecordData::Cname(data) = cname.data() {
            let target = owner_key(data.cname());
            if is_suffix(&zone.name, &target) {
                if let Some(set) = zone.find_owner(&target).and_then(|o| o.get(qtype)) {
                    answers.extend(set.rrs.iter().cloned());
                    let (ns, glue) = ns_and_glue(zone);
                    authority = ns;
                    extra = glue;
                }
            }
        }

        respond(msg, Rcode::NOERROR, answers, authority, extra, sender);
        return;
    }

    match qtype {
        Rtype::NS | Rtype::A | Rtype::AAAA | Rtype::MX | Rtype::TXT => match owner.get(qtype) {
            Some(set) => {
                let (ns, glue) = ns_and_glue(zone);
                respond(msg, Rcode::NOERROR, set.rrs.clone(), ns, glue, sender);
            }
            None => respond(
                msg,
                Rcode::NOERROR,
                Vec::new(),
                soa_authority,
                Vec::new(),
                sender,
            ),
        },
        _ => {
            // everything we don't want to deal with
            let (ns, glue) = ns_and_glue(zone);
            respond(msg, Rcode::REFUSED, Vec::new(), ns, glue, sender);
        }
    }
}
