//! Standalone GraphQLens proxy.
//!
//! Runs the interception proxy until Ctrl-C. Point a browser or HTTP client
//! at it and GraphQL calls matching a stored rule are answered with the
//! rule's response.
//!
//! Usage:
//! ```
//! cargo run --bin graphqlens_proxy -- --port 9090 --import rules.json --enable
//! ```

use graphqlens_core::api::{proxy_api, rules_api};
use graphqlens_core::proxy::ProxyConfig;

struct CliArgs {
    config: ProxyConfig,
    import: Option<String>,
    enable: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    let storage_path = args.config.storage_path.clone();
    proxy_api::init_core(Some(storage_path.clone())).map_err(anyhow::Error::msg)?;

    if let Some(file) = args.import {
        let count = rules_api::import_rules_file(storage_path.clone(), file.clone())
            .await
            .map_err(anyhow::Error::msg)?;
        tracing::info!("Imported {} rules from {}", count, file);
    }
    if let Some(enabled) = args.enable {
        rules_api::set_mocking_enabled(storage_path.clone(), enabled)
            .await
            .map_err(anyhow::Error::msg)?;
    }

    let payload = rules_api::get_rules(storage_path)
        .await
        .map_err(anyhow::Error::msg)?;
    tracing::info!(
        "{} rules loaded, mocking {}",
        payload.gql_rules.len(),
        if payload.gql_enabled { "enabled" } else { "disabled" }
    );

    proxy_api::start_proxy(args.config)
        .await
        .map_err(anyhow::Error::msg)?;
    let status = proxy_api::get_proxy_status();
    tracing::info!(
        "GraphQLens proxy v{} on {}:{}",
        proxy_api::get_version(),
        status.bind_address,
        status.port
    );

    tokio::signal::ctrl_c().await?;
    proxy_api::stop_proxy().await.map_err(anyhow::Error::msg)?;
    tracing::info!(
        "Served {} mocked requests",
        proxy_api::get_proxy_status().mocked_requests
    );
    Ok(())
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config = ProxyConfig::default();
    let mut import = None;
    let mut enable = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => match args.next().map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => config.port = port,
                _ => eprintln!("--port expects a number"),
            },
            "--bind" => {
                if let Some(addr) = args.next() {
                    config.bind_address = addr;
                }
            }
            "--storage-path" => {
                if let Some(path) = args.next() {
                    config.storage_path = path;
                }
            }
            "--tab-id" => match args.next().map(|t| t.parse::<u32>()) {
                Some(Ok(tab_id)) if tab_id != 0 => config.tab_id = tab_id,
                _ => eprintln!("--tab-id expects a non-zero number"),
            },
            "--bridge-timeout-ms" => match args.next().map(|t| t.parse::<u64>()) {
                Some(Ok(ms)) => config.bridge_timeout_ms = ms,
                _ => eprintln!("--bridge-timeout-ms expects a number"),
            },
            "--import" => import = args.next(),
            "--enable" => enable = Some(true),
            "--disable" => enable = Some(false),
            "--help" | "-h" => {
                eprintln!("GraphQLens proxy");
                eprintln!();
                eprintln!("Usage: graphqlens_proxy [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --port <PORT>              Port to listen on (default: 9090)");
                eprintln!("  --bind <ADDR>              Bind address (default: 127.0.0.1)");
                eprintln!("  --storage-path <PATH>      Directory for rules and logs");
                eprintln!("  --tab-id <ID>              Tab id proxied traffic belongs to (default: 1)");
                eprintln!("  --bridge-timeout-ms <MS>   Wait for rules before passing through (default: 250)");
                eprintln!("  --import <FILE>            Append rules from an exported JSON file");
                eprintln!("  --enable                   Turn mocking on");
                eprintln!("  --disable                  Turn mocking off");
                eprintln!("  --help, -h                 Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    CliArgs {
        config,
        import,
        enable,
    }
}
