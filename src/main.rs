//! PendingDNS server binary. Wires the shared store into the DNS, public
//! web and health-check roles and supervises them until shutdown.
//!
//! Exit codes: 0 clean, 1 panic, 2 failed critical task, 3 startup
//! failure, 51 invalid ACME contact address.

use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};

use pendingdns::prelude::*;
use pendingdns::web::{PublicState, TlsManager};
use pendingdns::{serve_http, serve_https, serve_tcp, serve_udp};

const EXIT_PANIC: u8 = 1;
const EXIT_TASK_FAILED: u8 = 2;
const EXIT_STARTUP: u8 = 3;
const EXIT_BAD_ACME_EMAIL: u8 = 51;

#[derive(Parser, Debug)]
#[command(name = "pendingdns", version, about = "API-driven authoritative DNS server")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // a panicking worker must not linger half-alive under the supervisor
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(i32::from(EXIT_PANIC));
    }));

    let args = Args::parse();
    let config = match args.config {
        Some(path) => match Config::from_file(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!("cannot load {}: {}", path, err);
                return ExitCode::from(EXIT_STARTUP);
            }
        },
        None => Config::default(),
    };

    if !config.acme_email_valid() {
        tracing::error!(
            "acme.email is not a valid contact address: {:?}",
            config.acme.email
        );
        return ExitCode::from(EXIT_BAD_ACME_EMAIL);
    }
    if let Err(err) = config.validate() {
        tracing::error!("invalid configuration: {}", err);
        return ExitCode::from(EXIT_STARTUP);
    }

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("install rustls crypto provider");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("cannot start runtime: {}", err);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    match runtime.block_on(run(Arc::new(config))) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("startup failed: {}", err);
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

async fn run(config: Arc<Config>) -> Result<ExitCode> {
    let store = Arc::new(RedisStore::connect(&config.redis.url).await?);
    let zones = Arc::new(ZoneStore::new(store.clone()));
    let resolver = Arc::new(CachedResolver::new(store.clone(), &config.resolver.ns));
    let certs = Arc::new(CertManager::new(
        store.clone(),
        zones.clone(),
        resolver.clone(),
        config.clone(),
    ));

    let mut tasks: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();

    // DNS role
    {
        let handler = Arc::new(DnsHandler::new(
            zones.clone(),
            resolver.clone(),
            config.clone(),
        ));
        let bind: SocketAddr = format!("{}:{}", config.dns.host, config.dns.port)
            .parse()
            .map_err(|_| DnsError::configuration("dns.host/dns.port do not form an address"))?;

        let udp = UdpSocket::bind(bind).await?;
        let udp_handler = handler.clone();
        tasks.spawn(async move { serve_udp(udp_handler, udp).await });

        let tcp = TcpListener::bind(bind).await?;
        tasks.spawn(async move { serve_tcp(handler, tcp).await });
    }

    // Public web role
    {
        let http_bind: SocketAddr =
            format!("{}:{}", config.public.http.host, config.public.http.port)
                .parse()
                .map_err(|_| DnsError::configuration("public.http does not form an address"))?;
        let http_state = PublicState::new(zones.clone(), config.clone(), false)?;
        let http_listener = TcpListener::bind(http_bind).await?;
        tasks.spawn(async move { serve_http(http_state, http_listener).await });

        let https_bind: SocketAddr =
            format!("{}:{}", config.public.https.host, config.public.https.port)
                .parse()
                .map_err(|_| DnsError::configuration("public.https does not form an address"))?;
        let https_state = PublicState::new(zones.clone(), config.clone(), true)?;
        let tls = Arc::new(TlsManager::new(
            store.clone(),
            zones.clone(),
            certs.clone(),
            &config,
        )?);
        let https_listener = TcpListener::bind(https_bind).await?;
        tasks.spawn(async move { serve_https(https_state, tls, https_listener).await });
    }

    // Health role
    if config.health.enabled {
        let checker = Arc::new(HealthChecker::new(store.clone(), config.health.clone())?);
        for handle in checker.spawn() {
            tasks.spawn(async move {
                handle.await.map_err(|e| DnsError::external(e.to_string()))
            });
        }
    }

    tracing::info!("pendingdns {} is up", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(ExitCode::SUCCESS)
        }
        finished = tasks.join_next() => {
            match finished {
                Some(Ok(Ok(()))) => {
                    tracing::error!("a critical task exited unexpectedly");
                    Ok(ExitCode::from(EXIT_TASK_FAILED))
                }
                Some(Ok(Err(err))) => {
                    tracing::error!("a critical task failed: {}", err);
                    Ok(ExitCode::from(EXIT_TASK_FAILED))
                }
                Some(Err(join_err)) => {
                    tracing::error!("a critical task aborted: {}", join_err);
                    Ok(ExitCode::from(EXIT_TASK_FAILED))
                }
                None => Ok(ExitCode::SUCCESS),
            }
        }
    }
}
