use std::net::SocketAddr;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::rpz::Action;
use crate::source::{SourceBackend, SourceFormat, SourceKind};
use crate::zone::fqdn;

pub const BASE_CONFIG_FILE: &str = "/etc/rpzd/config.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub log: LogConfig,
    pub dnsengine: EngineConfig,
    pub output: OutputSection,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl TryFrom<&Vec<u8>> for Config {
    type Error = Error;

    fn try_from(value: &Vec<u8>) -> Result<Self> {
        let config: Config = serde_yaml::from_slice(value)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// All startup-time consistency checks. Anything that fails here is
    /// fatal; nothing below is re-checked at runtime.
    fn validate(&self) -> Result<()> {
        if self.dnsengine.addresses.is_empty() {
            return Err(Error::config("dnsengine.addresses must not be empty"));
        }
        if self.policy.greylist.numsources.limit == 0 {
            return Err(Error::config("policy.greylist.numsources.limit cannot be 0"));
        }
        if self.policy.greylist.numtapirtags.limit == 0 {
            return Err(Error::config(
                "policy.greylist.numtapirtags.limit cannot be 0",
            ));
        }

        for source in &self.sources {
            match source.source {
                SourceBackend::File => {
                    if source.filename.is_none() {
                        return Err(Error::config(format!(
                            "source {} of type file has undefined filename",
                            source.id
                        )));
                    }
                }
                SourceBackend::Xfr => {
                    if source.zone.is_none() {
                        return Err(Error::config(format!(
                            "source {}: upstream zone not specified",
                            source.id
                        )));
                    }
                    if source.upstream.is_none() {
                        return Err(Error::config(format!(
                            "source {}: upstream address not specified",
                            source.id
                        )));
                    }
                }
                SourceBackend::Mqtt => (),
            }

            if source.format == SourceFormat::Dawg && source.kind != SourceKind::Whitelist {
                return Err(Error::config(format!(
                    "source {}: dawg format is only defined for whitelists",
                    source.id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(deserialize_with = "de_level_filter")]
    pub level: log::LevelFilter,
    #[serde(default)]
    pub stderr: bool,
    #[serde(default = "default_true")]
    pub metrics: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Listener endpoints; each is served over both UDP and TCP.
    pub addresses: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSection {
    pub rpz: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Apex of the synthesized policy zone.
    pub zonename: String,
    pub mname: Option<String>,
    pub rname: Option<String>,
    #[serde(default)]
    pub ns: Vec<String>,
}

impl OutputConfig {
    pub fn zone_apex(&self) -> String {
        fqdn(&self.zonename)
    }

    pub fn soa_mname(&self) -> String {
        match &self.mname {
            Some(mname) => fqdn(mname),
            None => format!("ns1.{}", self.zone_apex()),
        }
    }

    pub fn soa_rname(&self) -> String {
        match &self.rname {
            Some(rname) => fqdn(rname),
            None => format!("hostmaster.{}", self.zone_apex()),
        }
    }

    pub fn ns_names(&self) -> Vec<String> {
        if self.ns.is_empty() {
            vec![format!("ns1.{}", self.zone_apex())]
        } else {
            self.ns.iter().map(|n| fqdn(n)).collect()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub whitelist: ListPolicy,
    pub blacklist: ListPolicy,
    pub greylist: GreylistConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListPolicy {
    #[serde(deserialize_with = "de_action")]
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GreylistConfig {
    pub numsources: Threshold,
    pub numtapirtags: Threshold,
    pub blacktapir: TagPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Threshold {
    pub limit: usize,
    #[serde(deserialize_with = "de_action")]
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagPolicy {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "de_action")]
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: SourceKind,
    pub source: SourceBackend,
    pub format: SourceFormat,
    pub filename: Option<String>,
    pub zone: Option<String>,
    pub upstream: Option<String>,
}

fn default_true() -> bool {
    true
}

fn de_action<'de, D>(deserializer: D) -> std::result::Result<Action, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn de_level_filter<'de, D>(deserializer: D) -> std::result::Result<log::LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: LevelFilter = Deserialize::deserialize(deserializer)?;
    match s {
        LevelFilter::Off => Ok(log::LevelFilter::Off),
        LevelFilter::Error => Ok(log::LevelFilter::Error),
        LevelFilter::Warn => Ok(log::LevelFilter::Warn),
        LevelFilter::Info => Ok(log::LevelFilter::Info),
        LevelFilter::Debug => Ok(log::LevelFilter::Debug),
        LevelFilter::Trace => Ok(log::LevelFilter::Trace),
    }
}

#[derive(Deserialize)]
enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
log:
  level: Info
dnsengine:
  addresses: ["127.0.0.1:5353"]
output:
  rpz:
    zonename: rpz.local
policy:
  whitelist:
    action: passthru
  blacklist:
    action: nxdomain
  greylist:
    numsources:
      limit: 2
      action: nxdomain
    numtapirtags:
      limit: 3
      action: nodata
    blacktapir:
      tags: [malware, phishing]
      action: drop
sources:
  - id: feed1
    name: Feed One
    description: an rpz feed
    kind: blacklist
    source: xfr
    format: domains
    zone: bad.example
    upstream: "198.51.100.1:53"
"#;

    #[test]
    fn parse_full_config() {
        let bytes = CONFIG.as_bytes().to_vec();
        let config = Config::try_from(&bytes).unwrap();

        assert_eq!(config.dnsengine.addresses.len(), 1);
        assert_eq!(config.output.rpz.zone_apex(), "rpz.local.");
        assert_eq!(config.output.rpz.soa_mname(), "ns1.rpz.local.");
        assert_eq!(config.output.rpz.ns_names(), vec!["ns1.rpz.local."]);
        assert_eq!(config.policy.blacklist.action, Action::Nxdomain);
        assert_eq!(config.policy.greylist.blacktapir.action, Action::Drop);
        assert_eq!(config.sources[0].kind, SourceKind::Blacklist);
        assert_eq!(config.sources[0].source, SourceBackend::Xfr);
    }

    #[test]
    fn unknown_action_is_fatal() {
        let bytes = CONFIG.replace("action: drop", "action: reject").into_bytes();
        assert!(Config::try_from(&bytes).is_err());
    }

    #[test]
    fn zero_greylist_limit_is_fatal() {
        let bytes = CONFIG.replace("limit: 2", "limit: 0").into_bytes();
        assert!(Config::try_from(&bytes).is_err());
    }

    #[test]
    fn dawg_requires_whitelist() {
        let bytes = CONFIG.replace("format: domains", "format: dawg").into_bytes();
        assert!(Config::try_from(&bytes).is_err());
    }

    #[test]
    fn xfr_source_requires_upstream() {
        let bytes = CONFIG
            .replace("    upstream: \"198.51.100.1:53\"\n", "")
            .into_bytes();
        assert!(Config::try_from(&bytes).is_err());
    }
}
