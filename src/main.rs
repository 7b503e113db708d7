use keyroute::binding_registry::BindingRegistry;
use keyroute::config::{parse_runtime_params, Config, ServiceDiscoveryConfig};
use keyroute::discovery::backend_for;
use keyroute::http_proxy::{run_http_gateway, run_https_gateway, GatewayContext};
use keyroute::poller::Poller;
use keyroute::resolution_cache::ResolutionCache;
use keyroute::resolver::Resolver;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn usage() -> ! {
    eprintln!("usage: keyroute --config <file> [-e name=value]...");
    process::exit(2);
}

fn parse_args() -> (String, Vec<String>) {
    let mut config_path = None;
    let mut params = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = Some(args.next().unwrap_or_else(|| usage())),
            "-e" => params.push(args.next().unwrap_or_else(|| usage())),
            _ => usage(),
        }
    }
    match config_path {
        Some(path) => (path, params),
        None => usage(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let (config_path, raw_params) = parse_args();
    let config = Config::from_file(&config_path)?;
    let params = parse_runtime_params(&raw_params)?;
    let sd_config = ServiceDiscoveryConfig::from_parts(&config.service_discovery, &params)?;

    let registry = Arc::new(BindingRegistry::build(&config.apis, &params)?);
    let cache = Arc::new(ResolutionCache::new(&registry));
    let resolver = Arc::new(Resolver::new(
        registry.clone(),
        cache.clone(),
        sd_config.kind(),
        sd_config.enabled,
    ));

    let poller_handle = if sd_config.enabled {
        let backend = backend_for(&sd_config);
        let poller = Poller::new(backend, registry, cache, sd_config.poll_interval());
        Some(poller.spawn())
    } else {
        log::info!("service discovery disabled; serving static endpoints");
        None
    };

    let ctx = Arc::new(GatewayContext::new(&config, resolver));
    let rate_burst = Duration::from_secs(config.rate_limit_burst_secs);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let mut servers = Vec::new();
    servers.push(tokio::spawn(run_http_gateway(
        http_addr,
        ctx.clone(),
        config.bearer_token.clone(),
        config.rate_limit_per_sec,
        rate_burst,
    )));

    if let Some(https) = &config.https {
        let https_addr = SocketAddr::from(([0, 0, 0, 0], https.port));
        servers.push(tokio::spawn(run_https_gateway(
            https_addr,
            ctx.clone(),
            https.cert_path.clone(),
            https.key_path.clone(),
            config.bearer_token.clone(),
            config.rate_limit_per_sec,
            rate_burst,
        )));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown signal received");
        }
        result = futures::future::select_all(&mut servers) => {
            let (outcome, _, _) = result;
            match outcome {
                Ok(Err(e)) => log::error!("gateway task failed: {}", e),
                Err(e) => log::error!("gateway task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    if let Some(handle) = poller_handle {
        handle.stop().await;
    }
    for server in servers {
        server.abort();
    }
    Ok(())
}
