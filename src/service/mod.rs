//! The DNS engine: one [`Service`] implementation dispatching every
//! inbound message to the right responder.
//!
//! NOTIFY is answered synchronously and turned into a refresh request;
//! queries are routed by qname to the RPZ responder, a mirror responder
//! or REFUSED; anything else is logged and dropped.

use core::future::Future;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use domain::base::iana::{Opcode, Rcode};
use domain::base::message_builder::AdditionalBuilder;
use domain::base::{Message, Rtype, StreamTarget};
use domain::net::server::message::Request;
use domain::net::server::service::{CallResult, Service, ServiceResult};
use domain::net::server::util::mk_builder_for_target;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::Stream;
use octseq::OctetsBuilder;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::merge::Merger;
use crate::refresh::{RefreshQueue, RpzRefresh};
use crate::rpz::RpzState;
use crate::source::{keep_rpz_rtype, RuleClassifier, SourceBackend, SourceRegistry};
use crate::zone::{fqdn, is_suffix, owner_key, ZoneKind, ZoneRegistry};

pub mod middleware;
mod responder;

pub type MsgSender = UnboundedSender<ServiceResult<Vec<u8>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Clone)]
pub struct Pop {
    pub rpz: Arc<RpzState>,
    pub merger: Arc<Merger>,
    pub zones: Arc<RwLock<ZoneRegistry>>,
    pub sources: Arc<RwLock<SourceRegistry>>,
    pub refresh: RefreshQueue,
    /// Upstream zones declared in config, for NOTIFY before the first
    /// transfer has landed in the zone registry.
    notify_zones: Arc<HashMap<String, ZoneKind>>,
}

impl Pop {
    /// Build the engine state from config: bootstrap image, source
    /// registry with one entry per configured source, and an initial
    /// refresh request for every xfr-fed source.
    pub fn new(config: &Config) -> Result<(Self, mpsc::Receiver<RpzRefresh>)> {
        let merger = Merger::new(&config.output.rpz, &config.policy)?;
        let rpz = Arc::new(RpzState::new(
            merger.zone_name().to_string(),
            merger.bootstrap_image(),
        ));

        let mut sources = SourceRegistry::new();
        let (refresh, refresh_rx) = RefreshQueue::new();
        let mut notify_zones = HashMap::new();

        for source in &config.sources {
            sources.add_source(source);
            if source.source == SourceBackend::Xfr {
                if let Some(zone) = &source.zone {
                    let zone = fqdn(zone);
                    notify_zones.insert(zone.clone(), ZoneKind::Rpz);
                    refresh.request(RpzRefresh {
                        name: zone,
                        upstream: source.upstream.clone(),
                        zone_kind: ZoneKind::Rpz,
                        keep: Some(keep_rpz_rtype),
                        classify: Some(Arc::new(RuleClassifier::new(&source.id, source.kind))),
                    });
                }
            }
        }

        let pop = Pop {
            rpz,
            merger: Arc::new(merger),
            zones: Arc::new(RwLock::new(ZoneRegistry::new())),
            sources: Arc::new(RwLock::new(sources)),
            refresh,
            notify_zones: Arc::new(notify_zones),
        };

        Ok((pop, refresh_rx))
    }

    /// One inbound message, start to finish. Every response goes through
    /// `sender`; a dropped message simply pushes nothing.
    pub fn handle(
        &self,
        msg: &Message<Vec<u8>>,
        peer: SocketAddr,
        transport: Transport,
        sender: &MsgSender,
    ) {
        let Ok(question) = msg.sole_question() else {
            log::debug!(target: "dnsengine", "malformed query from {}, dropping", peer);
            return;
        };
        let qname = owner_key(&question.qname());
        let qtype = question.qtype();

        match msg.header().opcode() {
            Opcode::NOTIFY => self.handle_notify(msg, &qname, sender),
            Opcode::QUERY => {
                log::debug!(target: "dnsengine",
                    "zone {} {} request from {}", qname, qtype, peer);
                self.handle_query(msg, &qname, qtype, peer, transport, sender);
            }
            opcode => {
                log::debug!(target: "dnsengine", "unable to handle msgs of type {}", opcode)
            }
        }
    }

    /// Reply NOERROR immediately; fetching is the collaborator's problem.
    fn handle_notify(&self, msg: &Message<Vec<u8>>, qname: &str, sender: &MsgSender) {
        log::info!(target: "dnsengine", "received NOTIFY for zone {}", qname);

        let builder = mk_builder_for_target();
        if let Ok(answer) = builder.start_answer(msg, Rcode::NOERROR) {
            push_message(answer.additional(), sender);
        }

        let known = self
            .zones
            .read()
            .unwrap()
            .get(qname)
            .map(|zone| zone.kind())
            .or_else(|| self.notify_zones.get(qname).copied());

        match known {
            Some(zone_kind) => {
                log::info!(target: "dnsengine",
                    "NOTIFY for known zone {}, requesting refresh", qname);
                self.refresh.request(RpzRefresh {
                    name: qname.to_string(),
                    upstream: None,
                    zone_kind,
                    keep: None,
                    classify: None,
                });
            }
            None => {
                log::debug!(target: "dnsengine", "NOTIFY for unknown zone {}, ignoring", qname)
            }
        }
    }

    fn handle_query(
        &self,
        msg: &Message<Vec<u8>>,
        qname: &str,
        qtype: Rtype,
        peer: SocketAddr,
        transport: Transport,
        sender: &MsgSender,
    ) {
        if qname == self.rpz.zone_name {
            responder::rpz_apex(self, msg, qtype, peer, transport, sender);
            return;
        }

        let apex_zone = self.zones.read().unwrap().get(qname).cloned();
        if let Some(zone) = apex_zone {
            responder::mirror_apex(&zone, msg, qtype, sender);
            return;
        }

        if is_suffix(&self.rpz.zone_name, qname) {
            responder::rpz_subname(self, msg, qname, qtype, sender);
            return;
        }

        let covering = self.zones.read().unwrap().find_zone(qname).cloned();
        match covering {
            None => {
                log::debug!(target: "dnsengine", "qname {} is not in a known zone", qname);
                refused(msg, sender);
            }
            Some(zone) if zone.kind() == ZoneKind::Xfr => {
                log::debug!(target: "dnsengine",
                    "qname {} is covered by transit-only zone {}", qname, zone.name);
                refused(msg, sender);
            }
            Some(zone) => responder::mirror_query(&zone, msg, qname, qtype, sender),
        }
    }
}

impl Service<Vec<u8>> for Pop {
    type Target = Vec<u8>;
    type Stream = Pin<Box<dyn Stream<Item = ServiceResult<Self::Target>> + Send>>;
    type Future = Pin<Box<dyn Future<Output = Self::Stream> + Send>>;

    fn call(&self, request: Request<Vec<u8>>) -> Self::Future {
        let pop = self.clone();

        Box::pin(async move {
            let transport = if request.transport_ctx().is_udp() {
                Transport::Udp
            } else {
                Transport::Tcp
            };

            let (sender, receiver) = unbounded();
            let msg = request.message().clone();
            pop.handle(msg.as_ref(), request.client_addr(), transport, &sender);

            Box::pin(receiver) as Self::Stream
        })
    }
}

/// Hand one finished message to the response stream. A closed stream
/// means the peer went away; the exchange is abandoned, not retried.
pub(crate) fn push_message(
    additional: AdditionalBuilder<StreamTarget<Vec<u8>>>,
    sender: &MsgSender,
) {
    if sender
        .unbounded_send(Ok(CallResult::new(additional)))
        .is_err()
    {
        log::info!(target: "dnsengine", "peer gone, abandoning exchange");
    }
}

pub(crate) fn refused(msg: &Message<Vec<u8>>, sender: &MsgSender) {
    let builder = mk_builder_for_target();
    if let Ok(answer) = builder.start_answer(msg, Rcode::REFUSED) {
        push_message(answer.additional(), sender);
    }
}

/// Header fixup for AXFR/IXFR stream messages, per RFC 5936 §2.2.1: copy
/// the request id, QR=1, OPCODE=QUERY, AA=1, TC=0, RD copied, RA/Z/AD/CD
/// clear.
pub(crate) fn set_axfr_header<Target>(
    msg: &Message<Vec<u8>>,
    additional: &mut AdditionalBuilder<Target>,
) where
    Target: AsMut<[u8]>,
    Target: OctetsBuilder,
{
    let header = additional.header_mut();
    header.set_id(msg.header().id());
    header.set_qr(true);
    header.set_opcode(Opcode::QUERY);
    header.set_aa(true);
    header.set_tc(false);
    header.set_rd(msg.header().rd());
    header.set_ra(false);
    header.set_z(false);
    header.set_ad(false);
    header.set_cd(false);
}
