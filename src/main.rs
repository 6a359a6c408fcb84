//! Reconciler - scripted driver
//!
//! Wires a ledger adapter to the reconciliation engine and runs one scripted
//! session end to end:
//!
//! 1. connect as the service-provider account and authorize an investor
//! 2. connect as the investor and purchase tokens
//! 3. in simulation mode, reconnect as the provider and reclaim half of them
//!
//! Each connection reads the account's role first; a role that may not submit
//! the next operation ends the run before anything is sent.
//!
//! Every invalidation published along the way triggers a scoped re-read
//! through the ledger reader, so the log shows exactly which read-state each
//! confirmed write refreshed.

// Compiler warning configuration
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use reconciler::config::{Config, DisplayConfig};
use reconciler::error_decoder::ErrorDecoder;
use reconciler::errors::LedgerRejection;
use reconciler::ledger::simulated::SimulatedLedger;
use reconciler::ledger::{AccountRole, EventSource, LedgerReader, LedgerWriter, ReceiptSource};
use reconciler::logging::init_logging;
use reconciler::metrics;
use reconciler::types::format_units;
use reconciler::{
    abi::InterfaceDescription, Completion, CompletionCallback, ConfirmationReconciler,
    Invalidation, OperationKind, OperationState, OperationSubmitter, ReadKey, SubjectKey,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default local-node accounts
const DEFAULT_PROVIDER: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
const DEFAULT_INVESTOR: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

/// Delay before the in-memory ledger mines a submitted write
const SIMULATED_BLOCK_DELAY: Duration = Duration::from_millis(400);

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Operating mode (simulation or rpc)
    #[arg(short, long, default_value = "simulation")]
    mode: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Service-provider account that authorizes and reclaims
    #[arg(long, env = "RECONCILER_ACCOUNT", default_value = DEFAULT_PROVIDER)]
    account: String,

    /// Investor to authorize and purchase for
    #[arg(long, default_value = DEFAULT_INVESTOR)]
    investor: String,

    /// Purchase value in wei
    #[arg(long, default_value = "1000000000000000000")]
    amount: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Simulation,
    Rpc,
}

/// The four ledger seams plus the interface description they decode with
struct LedgerHandles {
    writer: Arc<dyn LedgerWriter>,
    reader: Arc<dyn LedgerReader>,
    events: Arc<dyn EventSource>,
    receipts: Arc<dyn ReceiptSource>,
    interface: InterfaceDescription,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.json_logs)?;

    info!("🚀 Starting reconciler");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    info!("📋 Loading configuration from: {}", args.config);
    let config = load_config(&args.config)?;

    let mode = parse_mode(&args.mode);
    info!("🎯 Operating Mode: {:?}", mode);

    let provider = SubjectKey::parse(&args.account).context("Invalid --account")?;
    let investor = SubjectKey::parse(&args.investor).context("Invalid --investor")?;

    let ledger = match mode {
        Mode::Simulation => simulated_ledger(&config, provider)?,
        Mode::Rpc => rpc_ledger(&config)?,
    };

    let decoder = ErrorDecoder::new(config.display.token_symbol.clone(), config.display.token_decimals);
    let reconciler = ConfirmationReconciler::new(
        ledger.events.clone(),
        ledger.receipts.clone(),
        Arc::new(ledger.interface),
        decoder,
        config.confirmation_timeout(),
    );
    info!(
        "⏱️ Confirmation timeout: {}s, retention: {}s",
        config.reconciler.confirmation_timeout_secs, config.reconciler.retention_secs
    );

    let pruner = reconciler.spawn_pruner(config.prune_interval(), config.retention());
    let refresher = spawn_refresher(&reconciler, ledger.reader.clone(), config.display.clone());
    let submitter = OperationSubmitter::new(ledger.writer.clone(), reconciler.clone(), config.contracts());

    info!("✅ All components initialized successfully");

    let script = ScriptedRun {
        submitter: &submitter,
        reader: ledger.reader.as_ref(),
        provider,
        investor,
        amount: &args.amount,
        with_reclaim: mode == Mode::Simulation,
    };

    tokio::select! {
        result = script.run() => match result {
            Ok(()) => info!("🏁 Scripted run finished"),
            Err(e) => error!("Scripted run failed: {:#}", e),
        },

        // Graceful shutdown signal
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Received shutdown signal");
        }
    }

    // Let the last invalidations be re-read before stopping the refresher
    tokio::time::sleep(Duration::from_millis(200)).await;
    pruner.abort();
    refresher.abort();

    log_statistics(&reconciler);
    info!("👋 Shutting down gracefully...");
    Ok(())
}

fn parse_mode(mode: &str) -> Mode {
    match mode {
        "rpc" => Mode::Rpc,
        "simulation" => Mode::Simulation,
        _ => {
            warn!("Unknown mode '{}', defaulting to simulation", mode);
            Mode::Simulation
        }
    }
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path).with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        Ok(Config::default())
    }
}

fn simulated_ledger(config: &Config, provider: SubjectKey) -> Result<LedgerHandles> {
    info!("🧪 Using in-memory ledger, provider {}", provider);
    let ledger = SimulatedLedger::new(config.contracts(), provider)
        .context("Failed to load bundled interface descriptions")?;
    ledger.set_auto_mine(Some(SIMULATED_BLOCK_DELAY));
    let ledger = Arc::new(ledger);
    Ok(LedgerHandles {
        interface: ledger.interface().clone(),
        writer: ledger.clone(),
        reader: ledger.clone(),
        events: ledger.clone(),
        receipts: ledger,
    })
}

#[cfg(feature = "rpc-ledger")]
fn rpc_ledger(config: &Config) -> Result<LedgerHandles> {
    use reconciler::ledger::rpc::RpcLedger;

    info!("🌐 Connecting to {}", config.ledger.rpc_url);
    let interface = config.load_interface()?;
    let ledger = RpcLedger::new(config.rpc_settings(), config.contracts(), interface.clone())
        .context("Failed to build HTTP client")?;
    let ledger = Arc::new(ledger);
    Ok(LedgerHandles {
        interface,
        writer: ledger.clone(),
        reader: ledger.clone(),
        events: ledger.clone(),
        receipts: ledger,
    })
}

#[cfg(not(feature = "rpc-ledger"))]
fn rpc_ledger(_config: &Config) -> Result<LedgerHandles> {
    bail!("rpc mode requires the `rpc-ledger` feature")
}

/// Re-read every invalidated key and log the fresh value
fn spawn_refresher(
    reconciler: &ConfirmationReconciler,
    reader: Arc<dyn LedgerReader>,
    display: DisplayConfig,
) -> JoinHandle<()> {
    let mut subscription = reconciler.invalidator().subscribe();
    tokio::spawn(async move {
        while let Some(Invalidation { key, cause }) = subscription.recv().await {
            match read_key(reader.as_ref(), &key, &display).await {
                Ok(value) => info!(cause = %cause, "🔄 {}", value),
                Err(e) => warn!(key = ?key, "Failed to re-read invalidated state: {}", e),
            }
        }
    })
}

async fn read_key(
    reader: &dyn LedgerReader,
    key: &ReadKey,
    display: &DisplayConfig,
) -> Result<String, LedgerRejection> {
    let units = |value| format!("{} {}", format_units(value, display.token_decimals), display.token_symbol);
    Ok(match key {
        ReadKey::Authorization(subject) => {
            format!("{} authorized: {}", subject, reader.is_authorized(subject).await?)
        }
        ReadKey::Balance(subject) => {
            format!("{} balance: {}", subject, units(reader.balance_of(subject).await?))
        }
        ReadKey::RecoveryPool => format!("recovery pool: {}", units(reader.recovery_pool_balance().await?)),
    })
}

struct ScriptedRun<'a> {
    submitter: &'a OperationSubmitter,
    reader: &'a dyn LedgerReader,
    provider: SubjectKey,
    investor: SubjectKey,
    amount: &'a str,
    with_reclaim: bool,
}

impl ScriptedRun<'_> {
    async fn run(&self) -> Result<()> {
        self.connect(self.provider, OperationKind::Authorize).await?;
        let state = self.submit_and_wait(OperationKind::Authorize, None).await?;
        if state != OperationState::Confirmed {
            bail!("Authorization ended {}", state);
        }

        self.connect(self.investor, OperationKind::Purchase).await?;
        self.submit_and_wait(OperationKind::Purchase, Some(self.amount)).await?;
        self.log_sale_status().await?;

        if !self.with_reclaim {
            return Ok(());
        }

        self.connect(self.provider, OperationKind::Reclaim).await?;
        let balance = self.reader.balance_of(&self.investor).await?;
        if balance.is_zero() {
            warn!("Investor holds no tokens, skipping reclaim");
            return Ok(());
        }
        let reclaim = (balance / 2u64).to_string();
        self.submit_and_wait(OperationKind::Reclaim, Some(&reclaim)).await?;
        Ok(())
    }

    /// Switch to `account` and check its role allows `next`
    async fn connect(&self, account: SubjectKey, next: OperationKind) -> Result<AccountRole> {
        self.submitter.reconciler().switch_context(Some(account));
        let role = self.reader.role_of_account(Some(&account)).await?;
        info!("🔑 Connected as {} ({})", account, role);
        if !role.permits(next) {
            bail!("{} is {} and may not submit {}", account, role, next);
        }
        Ok(role)
    }

    async fn log_sale_status(&self) -> Result<()> {
        let status = self.reader.sale_status().await?;
        if let Some(property) = &status.property {
            info!("🏢 {} ({})", property.name, property.location);
        }
        info!(
            oversubscribed = status.oversubscribed,
            "💰 Raised {} ETH, {} tokens issued",
            format_units(status.total_raised, 18),
            format_units(status.total_supply, 18)
        );
        Ok(())
    }

    async fn submit_and_wait(&self, kind: OperationKind, amount: Option<&str>) -> Result<OperationState> {
        let on_complete: CompletionCallback = Box::new(|completion: &Completion| {
            if completion.is_success() {
                info!(handle = %completion.handle, "✅ {} confirmed for {}", completion.kind, completion.subject);
            } else {
                warn!(
                    handle = %completion.handle,
                    "❌ {} {}: {}",
                    completion.kind,
                    completion.state,
                    completion.error_reason.as_deref().unwrap_or("no reason given")
                );
            }
        });

        let handle = self
            .submitter
            .submit(kind, &self.investor.to_string(), amount, Some(on_complete))
            .await
            .with_context(|| format!("{} was not submitted", kind))?;
        info!(handle = %handle, "📤 {} submitted", kind);

        let tracker = self.submitter.reconciler().tracker();
        let state = tracker.wait_terminal(&handle).await.unwrap_or(OperationState::Idle);
        tracker.acknowledge(&handle);
        Ok(state)
    }
}

fn log_statistics(reconciler: &ConfirmationReconciler) {
    let m = metrics::metrics();
    info!("📊 Statistics:");
    info!("   Confirmed: {}", m.operations_confirmed.get());
    info!("   Failed: {}", m.operations_failed.get());
    info!("   Timed out: {}", m.operations_timed_out.get());
    info!("   Duplicate signals ignored: {}", m.duplicate_signals_ignored.get());
    info!("   Still active: {}", reconciler.tracker().active_count());
    debug!("Metrics exposition:\n{}", m.gather_text());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("rpc"), Mode::Rpc);
        assert_eq!(parse_mode("simulation"), Mode::Simulation);
        assert_eq!(parse_mode("production"), Mode::Simulation);
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let config = load_config("/nonexistent/reconciler.toml").unwrap();
        assert_eq!(config.reconciler.confirmation_timeout_secs, 30);
    }

    #[test]
    fn test_default_accounts_parse() {
        assert!(SubjectKey::parse(DEFAULT_PROVIDER).is_ok());
        assert!(SubjectKey::parse(DEFAULT_INVESTOR).is_ok());
    }

    /// Simulated ledger granting the provider role to `granted`
    fn simulated_session(granted: SubjectKey) -> (Arc<dyn LedgerReader>, OperationSubmitter) {
        let config = Config::default();
        let ledger = simulated_ledger(&config, granted).unwrap();
        let reconciler = ConfirmationReconciler::new(
            ledger.events.clone(),
            ledger.receipts.clone(),
            Arc::new(ledger.interface),
            ErrorDecoder::default(),
            config.confirmation_timeout(),
        );
        let submitter = OperationSubmitter::new(ledger.writer.clone(), reconciler, config.contracts());
        (ledger.reader, submitter)
    }

    #[tokio::test]
    async fn test_scripted_run_against_simulated_ledger() {
        let provider = SubjectKey::parse(DEFAULT_PROVIDER).unwrap();
        let investor = SubjectKey::parse(DEFAULT_INVESTOR).unwrap();
        let (reader, submitter) = simulated_session(provider);

        let script = ScriptedRun {
            submitter: &submitter,
            reader: reader.as_ref(),
            provider,
            investor,
            amount: "1000000000000000000",
            with_reclaim: true,
        };
        script.run().await.unwrap();

        // 1 ETH buys 1000 tokens; half of them were reclaimed
        let half = primitive_types::U256::exp10(18) * 500u64;
        assert_eq!(reader.balance_of(&investor).await.unwrap(), half);
        assert_eq!(reader.recovery_pool_balance().await.unwrap(), half);
        assert_eq!(reader.sale_status().await.unwrap().total_supply, half * 2u64);
        assert_eq!(submitter.reconciler().tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn test_scripted_run_stops_without_provider_role() {
        let provider = SubjectKey::parse(DEFAULT_PROVIDER).unwrap();
        let investor = SubjectKey::parse(DEFAULT_INVESTOR).unwrap();
        let (reader, submitter) = simulated_session(provider);

        // The investor acts as provider but was never granted the role
        let script = ScriptedRun {
            submitter: &submitter,
            reader: reader.as_ref(),
            provider: investor,
            investor,
            amount: "1000000000000000000",
            with_reclaim: true,
        };
        let err = script.run().await.unwrap_err();
        assert!(err.to_string().contains("not whitelisted and may not submit"), "{}", err);
        assert!(submitter.reconciler().tracker().is_empty());
        assert!(!reader.is_authorized(&investor).await.unwrap());
    }
}
