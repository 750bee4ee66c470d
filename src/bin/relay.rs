use std::path::PathBuf;
use std::sync::Arc;

use forward_relay::config::Environment;
use forward_relay::dkim::DkimKeyPair;
use forward_relay::smtp::{serve, Relay};
use forward_relay::{log_error, log_info, set_verbose, tls, verbose, RelayConfig};

fn print_usage() {
    eprintln!("Usage: relay [OPTIONS] [CONFIG_DIR]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --sample-config    Print a sample relay.toml and exit");
    eprintln!("  --verbose          Enable verbose logging");
    eprintln!("  --help             Show this help message");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  CONFIG_DIR         Directory containing relay.toml (default: current directory)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  PORT               Override the listen port (default 25)");
    eprintln!("  SECURE             1/true for implicit TLS on accept");
    eprintln!("  RELAY_ENV          production | development | test");
    eprintln!("  VERBOSE            1 to enable verbose logging");
}

#[tokio::main]
async fn main() {
    let mut verbose_flag = false;
    let mut config_dir = PathBuf::from(".");

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" => {
                print_usage();
                return;
            }
            "--sample-config" => {
                println!("{}", RelayConfig::sample());
                return;
            }
            "--verbose" => verbose_flag = true,
            other if other.starts_with("--") => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                std::process::exit(2);
            }
            path => config_dir = PathBuf::from(path),
        }
    }

    if let Err(e) = forward_relay::config::init_config(&config_dir).await {
        log_error!("Failed to load configuration: {}", e);
        std::process::exit(1);
    }
    let config = forward_relay::config::get_config();

    let env_verbose = std::env::var("VERBOSE").map(|v| v == "1").unwrap_or(false);
    set_verbose(verbose_flag || env_verbose || config.environment == Environment::Development);

    log_info!("Starting relay as {}", config.ehlo_name());
    verbose!("  Environment: {:?}", config.environment);
    verbose!("  Exchanges: {}", config.exchanges.join(", "));
    verbose!("  Max message size: {} bytes", config.max_message_size);

    // DKIM signing identity: required in production, generated on demand in
    // development, optional in test
    let dkim = match (&config.dkim.private_key, config.environment) {
        (Some(path), _) => match DkimKeyPair::from_pem_file(path).await {
            Ok(keypair) => Some(keypair),
            Err(e) => {
                log_error!("Failed to load DKIM private key {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        (None, Environment::Production) => {
            log_error!("Production requires dkim.private_key in relay.toml");
            std::process::exit(1);
        }
        (None, Environment::Development) => {
            match DkimKeyPair::load_or_generate(&config_dir).await {
                Ok(keypair) => {
                    log_info!("Using development DKIM key under {:?}", config_dir);
                    Some(keypair)
                }
                Err(e) => {
                    log_error!("Failed to generate development DKIM key: {}", e);
                    std::process::exit(1);
                }
            }
        }
        (None, Environment::Test) => None,
    };
    if config.environment == Environment::Production && config.dkim.domain.is_none() {
        log_error!("Production requires dkim.domain in relay.toml");
        std::process::exit(1);
    }

    // TLS material: required in production, STARTTLS disabled without it
    let acceptor = match (&config.tls.cert, &config.tls.key) {
        (Some(cert), Some(key)) => {
            match tls::load_acceptor(cert, key, config.tls.ca.as_deref()).await {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    log_error!("Failed to load TLS material: {}", e);
                    std::process::exit(1);
                }
            }
        }
        _ if config.environment == Environment::Production => {
            log_error!("Production requires tls.cert and tls.key in relay.toml");
            std::process::exit(1);
        }
        _ => {
            log_info!("No TLS material configured, STARTTLS disabled");
            None
        }
    };

    let relay = match Relay::new(config.clone(), dkim, acceptor) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            log_error!("Failed to initialize relay: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(relay).await {
        log_error!("Relay terminated: {}", e);
        std::process::exit(1);
    }
}
