use chrono::Utc;
use clap::{Parser, Subcommand};
use marketplace_escrow::application::currency::CurrencyConverter;
use marketplace_escrow::application::fees::FeeSchedule;
use marketplace_escrow::application::ledger::WalletLedger;
use marketplace_escrow::application::payout::{DestinationBook, PayoutOrchestrator};
use marketplace_escrow::application::registry::GatewayRegistry;
use marketplace_escrow::config::AppConfig;
use marketplace_escrow::domain::fees::FeeContext;
use marketplace_escrow::domain::gateway::PaymentMethod;
use marketplace_escrow::domain::money::Currency;
use marketplace_escrow::domain::ports::{DestinationStoreBox, EscrowStoreBox, WalletStoreBox};
use marketplace_escrow::infrastructure::config_source::StaticConfigSource;
use marketplace_escrow::infrastructure::gateways::{GatewayDeps, gateway_factory};
use marketplace_escrow::infrastructure::http::{HttpTransportBox, ReqwestTransport, RetryingTransport};
use marketplace_escrow::infrastructure::in_memory::{
    InMemoryDestinationStore, InMemoryEscrowStore, InMemoryWalletStore,
};
use marketplace_escrow::infrastructure::rates::HttpRateSource;
use marketplace_escrow::interfaces::csv::balance_writer::BalanceWriter;
use marketplace_escrow::interfaces::csv::ledger_reader::LedgerReader;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay ledger operations from a CSV file and print the balances.
    Replay {
        /// Input operations CSV file
        input: PathBuf,

        /// Path to persistent database (optional). If provided, uses RocksDB.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print the platform fee for an amount as JSON.
    Quote {
        #[arg(long)]
        amount: Decimal,
        #[arg(long)]
        currency: Currency,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    /// List the payment gateways and the cheapest one for a charge.
    Gateways {
        #[arg(long)]
        amount: Decimal,
        #[arg(long)]
        currency: Currency,
        #[arg(long, value_parser = parse_method)]
        method: Option<PaymentMethod>,
    },
}

fn parse_method(raw: &str) -> std::result::Result<PaymentMethod, String> {
    serde_json::from_value(json!(raw)).map_err(|_| format!("unknown payment method '{raw}'"))
}

struct Stores {
    escrow: EscrowStoreBox,
    wallets: WalletStoreBox,
    destinations: DestinationStoreBox,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            escrow: Arc::new(InMemoryEscrowStore::new()),
            wallets: Arc::new(InMemoryWalletStore::new()),
            destinations: Arc::new(InMemoryDestinationStore::new()),
        }
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use marketplace_escrow::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => {
            let store = RocksDBStore::open(path).into_diagnostic()?;
            Ok(Stores {
                escrow: Arc::new(store.clone()),
                wallets: Arc::new(store.clone()),
                destinations: Arc::new(store),
            })
        }
        None => Ok(Stores::in_memory()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Stores::in_memory())
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_path(path).into_diagnostic(),
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
    }
}

async fn replay(config: &AppConfig, input: PathBuf, db_path: Option<PathBuf>) -> Result<()> {
    let stores = open_stores(db_path)?;
    let ledger = Arc::new(WalletLedger::new(stores.wallets, config.wallet.clone()));
    let payouts = PayoutOrchestrator::new(
        ledger.clone(),
        Arc::new(DestinationBook::new(stores.destinations)),
        stores.escrow,
        HashMap::new(),
        config.payouts.clone(),
    );

    let file = File::open(input).into_diagnostic()?;
    for (line, op) in LedgerReader::new(file).operations().enumerate() {
        match op {
            Ok(op) => {
                if let Err(e) = op.apply(&ledger, &payouts).await {
                    warn!(line = line + 2, error = %e, "operation rejected");
                }
            }
            Err(e) => warn!(line = line + 2, error = %e, "unreadable operation"),
        }
    }

    let wallets = ledger.all_wallets().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_wallets(&wallets).into_diagnostic()?;
    Ok(())
}

async fn quote(
    config: &AppConfig,
    amount: Decimal,
    currency: Currency,
    category_id: Option<String>,
    user_id: Option<String>,
) -> Result<()> {
    let schedule = FeeSchedule::init(Arc::new(StaticConfigSource::from_config(config)))
        .await
        .into_diagnostic()?;
    let ctx = FeeContext {
        amount,
        currency,
        category_id,
        user_id,
    };
    let quote = schedule.quote(&ctx, Utc::now()).await.into_diagnostic()?;
    println!("{}", serde_json::to_string_pretty(&quote).into_diagnostic()?);
    Ok(())
}

async fn gateways(
    config: &AppConfig,
    amount: Decimal,
    currency: Currency,
    method: Option<PaymentMethod>,
) -> Result<()> {
    let transport = ReqwestTransport::new(config.http.timeout()).into_diagnostic()?;
    let transport: HttpTransportBox = Arc::new(RetryingTransport::from_settings(
        Arc::new(transport),
        &config.http,
    ));
    let converter = match &config.currency.rates_url {
        Some(url) => {
            let source = HttpRateSource::new(url.clone(), transport.clone());
            let converter = CurrencyConverter::new(&config.currency, Some(Arc::new(source)));
            converter.init().await.into_diagnostic()?;
            converter
        }
        None => CurrencyConverter::with_static_rates(&config.currency),
    };
    let deps = GatewayDeps {
        transport,
        converter: Arc::new(converter),
    };
    let registry = GatewayRegistry::init(
        Arc::new(StaticConfigSource::from_config(config)),
        gateway_factory(deps),
    )
    .await
    .into_diagnostic()?;

    let listed: Vec<_> = registry
        .all()
        .await
        .iter()
        .map(|g| {
            json!({
                "name": g.name(),
                "provider": g.config().provider,
                "configured": g.is_configured(),
                "supports_currency": g.is_currency_supported(&currency),
                "supports_method": method.as_ref().is_none_or(|m| g.supports_method(m)),
                "fee": g.calculate_gateway_fee(amount, &currency),
            })
        })
        .collect();
    let best = registry.best_for(amount, &currency, method.as_ref()).await;
    let report = json!({
        "gateways": listed,
        "best": best.as_ref().ok().map(|g| g.name().to_string()),
        "error": best.as_ref().err().map(ToString::to_string),
    });
    println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Replay { input, db_path } => replay(&config, input, db_path).await,
        Command::Quote {
            amount,
            currency,
            category,
            user,
        } => quote(&config, amount, currency, category, user).await,
        Command::Gateways {
            amount,
            currency,
            method,
        } => gateways(&config, amount, currency, method).await,
    }
}
