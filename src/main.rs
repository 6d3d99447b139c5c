//! Serves a response policy zone synthesized from threat-intel sources,
//! over localhost UDP and TCP.
//!
//! Try queries such as:
//!
//!   dig @127.0.0.1 -p 8053 SOA rpz.local
//!   dig @127.0.0.1 -p 8053 CNAME bad.example.rpz.local
//!
//! Zone transfers need TCP, e.g.:
//!
//!   dig @127.0.0.1 -p 8053 +tcp AXFR rpz.local
//!   dig @127.0.0.1 -p 8053 +tcp IXFR=41 rpz.local

use core::time::Duration;

use std::process::exit;
use std::sync::Arc;

use domain::net::server::buf::VecBufSource;
use domain::net::server::dgram::DgramServer;
use domain::net::server::middleware::edns::EdnsMiddlewareSvc;
use domain::net::server::middleware::mandatory::MandatoryMiddlewareSvc;
use domain::net::server::stream::StreamServer;
use tokio::net::{TcpListener, UdpSocket};

use crate::service::middleware::{self, MetricsMiddlewareSvc, Stats};
use crate::service::Pop;

mod config;
mod error;
mod logger;
mod merge;
mod refresh;
mod rpz;
mod service;
mod source;
mod zone;

/// How long in-flight exchanges get to finish after a stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Fetch the configuration
    let config_path = std::env::var("RPZD_CONFIG").unwrap_or(config::BASE_CONFIG_FILE.into());
    let bytes = match std::fs::read(&config_path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to read config file at path {}: {}", config_path, e);
            exit(1);
        }
    };
    let config = match config::Config::try_from(&bytes) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to parse config file at path {}: {}", config_path, e);
            exit(1);
        }
    };

    // Initialize the custom logger
    logger::Logger::new()
        .with_level(config.log.level)
        .with_stderr(config.log.stderr)
        .with_metrics(config.log.metrics)
        .init()
        .expect("Failed to initialize custom logger");

    // Build the engine state; this also enqueues the initial refresh for
    // every xfr-fed source.
    let (pop, refresh_rx) = match Pop::new(&config) {
        Ok(v) => v,
        Err(e) => {
            log::error!(target: "dnsengine", "failed to set up engine: {}", e);
            exit(1);
        }
    };

    let stats = Stats::new_shared();
    let svc = EdnsMiddlewareSvc::new(pop.clone());
    let svc = MandatoryMiddlewareSvc::new(svc);
    let svc = MetricsMiddlewareSvc::new(svc, stats.clone());

    // One listener pair per configured address; UDP gets a server per
    // core on a shared socket.
    let num_cores = std::thread::available_parallelism().unwrap().get();
    for addr in &config.dnsengine.addresses {
        let sock = match UdpSocket::bind(addr).await {
            Ok(s) => s,
            Err(e) => {
                log::error!(target: "dnsengine", "failed to bind {} (udp): {}", addr, e);
                exit(1);
            }
        };
        let sock = Arc::new(sock);
        for _i in 0..num_cores {
            let udp_srv = DgramServer::new(sock.clone(), VecBufSource, svc.clone());
            tokio::spawn(async move { udp_srv.run().await });
        }

        let sock = match TcpListener::bind(addr).await {
            Ok(s) => s,
            Err(e) => {
                log::error!(target: "dnsengine", "failed to bind {} (tcp): {}", addr, e);
                exit(1);
            }
        };
        let tcp_srv = StreamServer::new(sock, VecBufSource, svc.clone());
        tokio::spawn(async move { tcp_srv.run().await });

        log::info!(target: "dnsengine", "serving on {} (udp/tcp)", addr);
    }

    // The transfer collaborator consumes this queue.
    tokio::spawn(refresh::drain(refresh_rx));

    tokio::spawn(middleware::report(stats));

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!(target: "dnsengine", "stop signal received, draining"),
        Err(e) => log::error!(target: "dnsengine", "failed to wait for stop signal: {}", e),
    }
    tokio::time::sleep(SHUTDOWN_GRACE).await;
}
