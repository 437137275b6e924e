use std::path::PathBuf;

use affiliate_engine::{
    config::EngineConfig,
    ledger::{CommissionRecord, MemoryStore, UserRecord},
    tiers::{Cents, CENTS_PER_USD},
    upgrade::resolve_price,
    Engine, EngineError, Tier,
};
use clap::{Parser, Subcommand};
use serde::Serialize;

//==================== CLI ====================//

#[derive(Parser)]
#[command(name = "affiliate", version, about = "Referral commission engine operator tool")]
struct Cli {
    /// JSON config file (state path, log level, package prices)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file, overrides the config
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a user, optionally holding a package
    AddUser {
        id: String,
        #[arg(long)]
        referrer: Option<String>,
        #[arg(long)]
        tier: Option<Tier>,
        #[arg(long)]
        inactive: bool,
    },
    /// Bind a user's referrer (one time only)
    SetReferrer { user: String, referrer: String },
    /// Pay commissions for a settled purchase
    Distribute {
        buyer: String,
        #[arg(long)]
        tier: Tier,
        #[arg(long)]
        event: String,
        /// Purchase price in USD (defaults to the tier price)
        #[arg(long, value_parser = parse_usd)]
        price: Option<Cents>,
        /// Commission base in USD (defaults to the price)
        #[arg(long, value_parser = parse_usd)]
        base: Option<Cents>,
    },
    /// Upgrade a user's package and pay on the price difference
    Upgrade {
        user: String,
        tier: String,
        #[arg(long)]
        event: String,
    },
    /// Preview commissions without writing anything
    Simulate {
        buyer: String,
        tier: String,
        #[arg(long)]
        upgrade: bool,
    },
    /// List commission records and the ledger root
    Ledger {
        #[arg(long)]
        beneficiary: Option<String>,
        #[arg(long)]
        event: Option<String>,
    },
}

//==================== helpers ====================//

fn parse_usd(s: &str) -> Result<Cents, String> {
    let s = s.trim().trim_start_matches('$');
    if s.is_empty() {
        return Err("empty amount".into());
    }
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if frac.len() > 2 {
        return Err(format!("{s}: at most two decimal places"));
    }
    let whole: Cents = whole.parse().map_err(|e| format!("{s}: {e}"))?;
    let frac: Cents = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<2}").parse().map_err(|e| format!("{s}: {e}"))?
    };
    whole
        .checked_mul(CENTS_PER_USD)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(|| format!("{s}: amount too large"))
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("error: {msg}");
    std::process::exit(2)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => fail(err),
    }
}

#[derive(Serialize)]
struct LedgerReport {
    root: String,
    records: Vec<CommissionRecord>,
}

//==================== main ====================//

fn main() {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => EngineConfig::load(path).unwrap_or_else(|e| fail(e)),
        None => EngineConfig::default(),
    };
    if let Some(state) = cli.state {
        cfg.state_path = state;
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();

    let store = cfg.open_store().unwrap_or_else(|e| fail(e));
    let engine = Engine::new(store);

    let mutated = match cli.command {
        Command::AddUser {
            id,
            referrer,
            tier,
            inactive,
        } => {
            let mut user = UserRecord::new(id.clone());
            if let Some(tier) = tier {
                user = user.with_package(tier, !inactive);
            }
            engine.store().insert_user(user).unwrap_or_else(|e| fail(e));
            if let Some(referrer) = referrer {
                let result = engine.set_referrer(&id, &referrer);
                print_json(&result);
                if let Some(err) = result.error {
                    // nothing saved: the user is not registered either
                    fail(format!("{id} not added: {err}"));
                }
            }
            true
        }
        Command::SetReferrer { user, referrer } => {
            let result = engine.set_referrer(&user, &referrer);
            print_json(&result);
            result.success
        }
        Command::Distribute {
            buyer,
            tier,
            event,
            price,
            base,
        } => {
            let price = match price {
                Some(p) => p,
                None => resolve_price(engine.store(), tier).unwrap_or_else(|e| fail(e)),
            };
            let result = engine.distribute_commissions(
                &buyer,
                price,
                base.unwrap_or(price),
                &event,
                tier,
            );
            print_json(&result);
            result.success
        }
        Command::Upgrade { user, tier, event } => {
            let result = engine.handle_package_upgrade(&user, &tier, &event);
            print_json(&result);
            result.is_upgrade
        }
        Command::Simulate {
            buyer,
            tier,
            upgrade,
        } => {
            let sim = engine
                .simulate_commissions(&buyer, &tier, upgrade)
                .unwrap_or_else(|e| fail(e));
            print_json(&sim);
            false
        }
        Command::Ledger { beneficiary, event } => {
            let records = match (beneficiary, event) {
                (Some(b), _) => engine.commissions_for(&b),
                (None, Some(e)) => engine.commissions_for_event(&e),
                (None, None) => engine
                    .store()
                    .snapshot()
                    .map(|s| s.commissions)
                    .map_err(EngineError::from),
            }
            .unwrap_or_else(|e| fail(e));
            let root = engine.store().ledger_root().unwrap_or_else(|e| fail(e));
            print_json(&LedgerReport {
                root: hex::encode(root),
                records,
            });
            false
        }
    };

    if mutated {
        save(engine.store(), &cfg);
    }
}

fn save(store: &MemoryStore, cfg: &EngineConfig) {
    if let Err(err) = store.save(&cfg.state_path) {
        fail(err);
    }
}
