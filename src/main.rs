//! RRP coordinator entrypoint.
//!
//! Runs a coordination cycle over every configured chain, then sleeps for
//! `coordinator.cycle_interval_seconds` and starts over until SIGINT/SIGTERM.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG_FILE` path of the TOML configuration (`config.toml` by default)
//! - `PROVIDER_MNEMONIC` phrase the sponsor wallets derive from
//! - `RPC_URL_<CHAIN_ID>` per-chain RPC endpoint override
//! - `RUST_LOG` overrides `logging.level`

use dotenvy::dotenv;

use rrp_coordinator::adapter::HttpApiCaller;
use rrp_coordinator::config::CoordinatorConfig;
use rrp_coordinator::coordinator::start_coordinator;
use rrp_coordinator::from_env;
use rrp_coordinator::sig_down::SigDown;
use rrp_coordinator::telemetry::Telemetry;
use rrp_coordinator::wallet::WalletDeriver;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let config = CoordinatorConfig::from_env();
    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_logging(&config.as_ref().map(|c| c.logging.clone()).unwrap_or_default())
        .register();

    let config = match config {
        Ok(config) => {
            tracing::info!(chains = config.chains.len(), "Configuration loaded successfully");
            config
        }
        // A missing file already yields the defaults; anything else is a broken deployment
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if config.chains.is_empty() {
        tracing::warn!("No chains configured, cycles will be empty");
    }

    // Abort early on unusable key material or adapter settings
    let wallets = match from_env::provider_mnemonic().and_then(|m| WalletDeriver::from_mnemonic(&m)) {
        Ok(wallets) => wallets,
        Err(e) => {
            tracing::error!("Failed to load provider wallets: {}", e);
            std::process::exit(1);
        }
    };
    let api = match HttpApiCaller::try_new(&config.adapter) {
        Ok(api) => api,
        Err(e) => {
            tracing::error!("Failed to create API adapter client: {}", e);
            std::process::exit(1);
        }
    };

    let sig_down = SigDown::try_new()?;
    let cancellation_token = sig_down.cancellation_token();
    let mut interval = tokio::time::interval(config.coordinator.cycle_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let results = start_coordinator(&config, &wallets, &api).await;
                let failed = results.iter().filter(|r| r.is_err()).count();
                tracing::info!(chains = results.len(), failed, "Coordinator cycle completed");
                if config.coordinator.run_once {
                    break;
                }
            }
            _ = cancellation_token.cancelled() => {
                tracing::info!("Stopping coordinator");
                break;
            }
        }
    }

    Ok(())
}
