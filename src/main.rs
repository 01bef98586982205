//! Autonomous trade-execution engine.
//!
//! Turns standing trading policies (DCA schedules, copy-trading
//! relationships) into on-chain transactions inside revocable, value- and
//! time-bounded session grants.

mod api;
mod copy_trading;
mod db;
mod dca;
mod execution;
mod models;
mod rate_limit;
mod runner;
mod session;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{ChainSubmitter, HttpChainSubmitter, HttpMarketData, SimulatedSubmitter};
use crate::copy_trading::{CopyEngine, NewCopyRelationship};
use crate::db::Database;
use crate::dca::{DcaConfig, DcaScheduler, DcaStrategyPatch, NewDcaStrategy};
use crate::execution::ExecutionStore;
use crate::models::{
    ActionClass, DcaFrequency, DcaGuards, DcaStatus, DcaStopConditions, LeaderSignal, SizingMode,
    SpendScope,
};
use crate::rate_limit::{RateLimiter, RateLimiterConfig};
use crate::runner::{Runner, RunnerConfig};
use crate::session::{NewSessionKey, ReserveDecision, SessionEnforcer, UsageMetadata};

/// Autonomous trade-execution engine CLI.
#[derive(Parser)]
#[command(name = "autopilot")]
#[command(about = "Run DCA and copy-trading policies inside session budgets", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(
        short,
        long,
        env = "AUTOPILOT_DATABASE_URL",
        default_value = "sqlite:./autopilot.db?mode=rwc"
    )]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Market-data service base URL
    #[arg(long, env = "AUTOPILOT_MARKET_URL", default_value = "http://localhost:8091")]
    market_url: String,

    /// Chain-submission service base URL
    #[arg(long, env = "AUTOPILOT_SUBMIT_URL", default_value = "http://localhost:8092")]
    submit_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine loop (scheduler, copy submission, cleanup, sweep)
    Run {
        /// Cycle interval in seconds
        #[arg(short, long, default_value = "30")]
        interval: u64,

        /// How long an execution may stay non-terminal (minutes)
        #[arg(long, default_value = "30")]
        timeout_minutes: i64,

        /// Dry run (log submissions instead of calling the chain service)
        #[arg(long)]
        dry_run: bool,

        /// Enable the global (wallet, action) rate limit
        #[arg(long)]
        rate_limit: bool,

        /// Rate-limit bucket capacity
        #[arg(long, default_value = "10")]
        rate_limit_capacity: u32,

        /// Rate-limit refill per minute
        #[arg(long, default_value = "2.0")]
        rate_limit_refill: f64,
    },

    /// Manage session keys
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Manage DCA strategies
    Dca {
        #[command(subcommand)]
        command: DcaCommands,
    },

    /// Manage copy-trading relationships
    Copy {
        #[command(subcommand)]
        command: CopyCommands,
    },

    /// Ingest one leader trade signal (event-ingester seam)
    Signal {
        /// Leader wallet address
        #[arg(long)]
        leader: String,

        /// Chain id
        #[arg(long, default_value = "8453")]
        chain: i64,

        /// Action (swap, transfer, approve, bridge)
        #[arg(long, default_value = "swap")]
        action: String,

        #[arg(long)]
        token_in: String,

        #[arg(long)]
        token_out: String,

        /// Observed USD value of the leader trade
        #[arg(long)]
        value: f64,

        /// Leader transaction hash
        #[arg(long)]
        tx_hash: String,
    },

    /// Approve an execution awaiting approval
    Approve {
        /// Execution record id
        record: String,

        /// Approver identity
        #[arg(short, long, default_value = "operator")]
        approver: String,
    },

    /// Reject-skip an execution awaiting approval
    Reject {
        /// Execution record id
        record: String,

        /// Reason shown on the record
        #[arg(short, long)]
        reason: String,
    },

    /// Report chain-submission results back into the engine
    Chain {
        #[command(subcommand)]
        command: ChainCommands,
    },

    /// Inspect an execution record
    Exec {
        #[command(subcommand)]
        command: ExecCommands,
    },

    /// Show engine status and statistics
    Status,
}

/// Inbound seam for the chain-submission service: the only path advancing
/// an executing record.
#[derive(Subcommand)]
enum ChainCommands {
    /// The transaction was broadcast
    Submitted {
        /// dca or copy
        kind: String,

        /// DcaExecution / CopyExecution id
        execution: String,

        #[arg(long)]
        tx_hash: String,
    },

    /// The transaction confirmed with fill actuals
    Confirmed {
        /// dca or copy
        kind: String,

        /// DcaExecution / CopyExecution id
        execution: String,

        /// USD actually spent / filled
        #[arg(long)]
        spent: f64,

        /// Tokens acquired (dca only)
        #[arg(long, default_value = "0")]
        tokens: f64,

        #[arg(long)]
        gas: Option<f64>,
    },

    /// The transaction failed or reverted
    Failed {
        /// dca or copy
        kind: String,

        /// DcaExecution / CopyExecution id
        execution: String,

        #[arg(long)]
        error: String,

        /// Transient failure; the owner stays active for retry
        #[arg(long)]
        recoverable: bool,
    },
}

#[derive(Subcommand)]
enum ExecCommands {
    /// Show a record with its history, steps, and decisions
    Show { record: String },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Create a session key
    Create {
        /// Wallet address the grant is scoped to
        wallet: String,

        /// Per-transaction value cap in USD
        #[arg(long)]
        per_tx: f64,

        /// Total value cap in USD
        #[arg(long)]
        total: f64,

        /// Optional transaction-count cap
        #[arg(long)]
        max_tx: Option<i64>,

        /// Grant lifetime in days
        #[arg(long, default_value = "30")]
        days: i64,

        /// Allowed chain ids (empty = unrestricted)
        #[arg(long)]
        chains: Vec<i64>,

        /// Allowed token addresses (empty = unrestricted)
        #[arg(long)]
        tokens: Vec<String>,
    },

    /// List session keys
    List {
        /// Filter by wallet
        #[arg(short, long)]
        wallet: Option<String>,
    },

    /// Revoke a session key
    Revoke {
        id: String,

        #[arg(short, long, default_value = "operator request")]
        reason: String,
    },

    /// Extend a session key by N days
    Extend {
        id: String,

        #[arg(long)]
        days: i64,
    },

    /// Check (read-only) whether a spend would be authorized
    Check {
        id: String,

        #[arg(long)]
        value: f64,

        #[arg(long)]
        chain: Option<i64>,

        #[arg(long)]
        token: Option<String>,
    },

    /// Record usage for an externally authorized spend
    RecordUsage {
        id: String,

        #[arg(long)]
        value: f64,

        #[arg(long)]
        tx_hash: Option<String>,
    },

    /// Show the usage log of a session
    Usage { id: String },

    /// Expire due sessions now
    Cleanup,

    /// Create a smart session (aggregate limit + capability set)
    SmartCreate {
        wallet: String,

        /// Aggregate spending limit in USD
        #[arg(long)]
        limit: f64,

        /// Granted actions (swap, transfer, approve, bridge)
        #[arg(long)]
        actions: Vec<String>,

        #[arg(long, default_value = "30")]
        days: i64,
    },

    /// Record a spend under a smart session
    SmartSpend {
        id: String,

        #[arg(long)]
        value: f64,

        #[arg(long, default_value = "swap")]
        action: String,
    },

    /// Revoke a smart session
    SmartRevoke { id: String },
}

#[derive(Subcommand)]
enum DcaCommands {
    /// Create a strategy (draft)
    Create {
        /// Owner wallet address
        wallet: String,

        /// Session key id funding the strategy
        #[arg(long)]
        session: Option<String>,

        #[arg(long, default_value = "8453")]
        chain: i64,

        #[arg(long, default_value = "USDC")]
        token_in: String,

        #[arg(long)]
        token_out: String,

        /// USD spent per execution
        #[arg(long)]
        amount: f64,

        /// hourly, daily, weekly, or monthly
        #[arg(long, default_value = "daily")]
        frequency: String,

        /// Skip ticks when gas is above this (USD)
        #[arg(long)]
        skip_gas_above: Option<f64>,

        /// Skip ticks when price is above this (USD)
        #[arg(long)]
        price_above: Option<f64>,

        /// Skip ticks when price is below this (USD)
        #[arg(long)]
        price_below: Option<f64>,

        /// Stop after this many completed purchases
        #[arg(long)]
        max_executions: Option<i64>,

        /// Stop after this much total spend (USD)
        #[arg(long)]
        max_spend: Option<f64>,
    },

    /// Attach a session key to a strategy
    AttachSession {
        id: String,

        session: String,
    },

    /// Update config (draft or paused only)
    Update {
        id: String,

        #[arg(long)]
        amount: Option<f64>,

        #[arg(long)]
        frequency: Option<String>,
    },

    /// Activate a draft strategy
    Activate { id: String },

    /// Pause an active strategy
    Pause { id: String },

    /// Resume a paused strategy
    Resume { id: String },

    /// Stop a strategy permanently
    Stop { id: String },

    /// List strategies
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show recent executions of a strategy
    History {
        id: String,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum CopyCommands {
    /// Follow a leader address
    Follow {
        /// Follower wallet address
        follower: String,

        /// Leader address to replicate
        leader: String,

        /// Session key id funding the copies
        #[arg(long)]
        session: Option<String>,

        /// percentage, fixed, or proportional
        #[arg(long, default_value = "percentage")]
        mode: String,

        /// Percent for percentage/proportional, USD for fixed
        #[arg(long, default_value = "10")]
        size: f64,

        #[arg(long, default_value = "5")]
        min_trade: f64,

        #[arg(long, default_value = "500")]
        max_trade: f64,

        /// Submission delay in seconds
        #[arg(long, default_value = "0")]
        delay: u32,

        #[arg(long)]
        max_daily_trades: Option<i64>,

        #[arg(long)]
        max_daily_volume: Option<f64>,

        /// Require operator approval for every copy
        #[arg(long)]
        manual: bool,
    },

    /// Pause a relationship
    Pause { id: String },

    /// Resume a paused relationship
    Resume { id: String },

    /// Deactivate a relationship
    Unfollow { id: String },

    /// Set a follower's portfolio value for proportional sizing
    SetPortfolio {
        wallet: String,

        value: f64,
    },

    /// List relationships
    List,

    /// Show recent executions of a relationship
    History {
        id: String,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

/// Engine bundle wired over one database and one submitter.
struct Engines<C> {
    sessions: Arc<SessionEnforcer>,
    executions: Arc<ExecutionStore>,
    dca: DcaScheduler<HttpMarketData, C>,
    copy: CopyEngine<C>,
}

fn build_engines<C: ChainSubmitter + Clone>(
    db: Arc<Database>,
    market: HttpMarketData,
    submitter: C,
    limits: RateLimiterConfig,
) -> Engines<C> {
    let executions = Arc::new(ExecutionStore::new(db.clone()));
    let sessions = Arc::new(SessionEnforcer::new(db.clone()));
    let limiter = Arc::new(RateLimiter::new(limits));

    let dca = DcaScheduler::new(
        db.clone(),
        executions.clone(),
        sessions.clone(),
        limiter.clone(),
        market,
        submitter.clone(),
        DcaConfig::default(),
    );
    let copy = CopyEngine::new(db, executions.clone(), sessions.clone(), limiter, submitter);

    Engines {
        sessions,
        executions,
        dca,
        copy,
    }
}

async fn run_loop<C: ChainSubmitter + Clone>(
    db: Arc<Database>,
    market: HttpMarketData,
    submitter: C,
    config: RunnerConfig,
    limits: RateLimiterConfig,
) -> Result<()> {
    let engines = build_engines(db, market, submitter, limits);
    let runner = Runner::new(
        engines.sessions,
        engines.executions,
        engines.dca,
        engines.copy,
        config,
    );
    runner.run().await
}

fn to_decimal(value: f64) -> Result<Decimal> {
    Decimal::try_from(value).context("value is not representable as a decimal")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Arc::new(Database::new(&cli.database).await?);
    let market = HttpMarketData::new(cli.market_url.clone())?;

    match cli.command {
        Commands::Run {
            interval,
            timeout_minutes,
            dry_run,
            rate_limit,
            rate_limit_capacity,
            rate_limit_refill,
        } => {
            let config = RunnerConfig {
                tick_interval_secs: interval,
                execution_timeout_minutes: timeout_minutes,
            };
            let limits = RateLimiterConfig {
                enabled: rate_limit,
                capacity: rate_limit_capacity,
                refill_per_minute: rate_limit_refill,
            };
            if dry_run {
                info!("Running in dry-run mode; submissions are simulated");
                run_loop(db, market, SimulatedSubmitter, config, limits).await?;
            } else {
                let submitter = HttpChainSubmitter::new(cli.submit_url.clone())?;
                run_loop(db, market, submitter, config, limits).await?;
            }
        }

        Commands::Session { command } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            handle_session_command(&engines, command).await?;
        }

        Commands::Dca { command } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            handle_dca_command(&engines, command).await?;
        }

        Commands::Copy { command } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            handle_copy_command(&engines, command).await?;
        }

        Commands::Signal {
            leader,
            chain,
            action,
            token_in,
            token_out,
            value,
            tx_hash,
        } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            let action = ActionClass::parse(&action)
                .with_context(|| format!("unknown action: {action}"))?;
            let signal = LeaderSignal {
                leader_address: leader,
                chain_id: chain,
                action,
                token_in,
                token_out,
                amount_in: None,
                amount_out: None,
                value_usd: to_decimal(value)?,
                tx_hash,
                observed_at: Utc::now(),
            };

            let executions = engines.copy.ingest_signal(&signal, Utc::now()).await?;
            println!("Replicated to {} relationship(s):", executions.len());
            for execution in executions {
                println!(
                    "  {}  {}  {}",
                    execution.id,
                    execution.status.as_str(),
                    execution
                        .skip_reason
                        .map(|r| r.as_str())
                        .unwrap_or("-")
                );
            }
        }

        Commands::Approve { record, approver } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            let execution = engines.copy.approve(&record, &approver).await?;
            println!("Approved: copy execution {} is now {}", execution.id, execution.status.as_str());
        }

        Commands::Reject { record, reason } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            let execution = engines.copy.reject(&record, &reason).await?;
            println!("Rejected: copy execution {} is now {}", execution.id, execution.status.as_str());
        }

        Commands::Chain { command } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            handle_chain_command(&engines, command).await?;
        }

        Commands::Exec { command } => {
            let engines = build_engines(db, market, SimulatedSubmitter, Default::default());
            handle_exec_command(&engines, command).await?;
        }

        Commands::Status => {
            print_status(&db).await?;
        }
    }

    Ok(())
}

async fn handle_chain_command(
    engines: &Engines<SimulatedSubmitter>,
    command: ChainCommands,
) -> Result<()> {
    let now = Utc::now();
    match command {
        ChainCommands::Submitted {
            kind,
            execution,
            tx_hash,
        } => {
            match kind.as_str() {
                "dca" => engines.dca.on_submitted(&execution, &tx_hash).await?,
                "copy" => engines.copy.on_submitted(&execution, &tx_hash).await?,
                other => anyhow::bail!("unknown execution kind: {other}"),
            }
            println!("Recorded submission of {execution}");
        }

        ChainCommands::Confirmed {
            kind,
            execution,
            spent,
            tokens,
            gas,
        } => {
            let gas = gas.map(to_decimal).transpose()?;
            match kind.as_str() {
                "dca" => {
                    engines
                        .dca
                        .on_confirmed(&execution, to_decimal(spent)?, to_decimal(tokens)?, gas, now)
                        .await?
                }
                "copy" => {
                    engines
                        .copy
                        .on_filled(&execution, to_decimal(spent)?, None, gas, None, now)
                        .await?
                }
                other => anyhow::bail!("unknown execution kind: {other}"),
            }
            println!("Recorded confirmation of {execution}");
        }

        ChainCommands::Failed {
            kind,
            execution,
            error,
            recoverable,
        } => {
            match kind.as_str() {
                "dca" => {
                    engines
                        .dca
                        .on_failed(&execution, &error, recoverable, now)
                        .await?
                }
                "copy" => {
                    engines
                        .copy
                        .on_failed(&execution, &error, recoverable, now)
                        .await?
                }
                other => anyhow::bail!("unknown execution kind: {other}"),
            }
            println!("Recorded failure of {execution}");
        }
    }

    Ok(())
}

async fn handle_exec_command(
    engines: &Engines<SimulatedSubmitter>,
    command: ExecCommands,
) -> Result<()> {
    match command {
        ExecCommands::Show { record } => {
            let execution = engines.executions.get(&record).await?;
            println!(
                "{}  {}  owner={}:{}  wallet={}",
                execution.id,
                execution.current_state,
                execution.owner_kind.as_str(),
                execution.owner_id,
                execution.wallet_address,
            );
            if let Some(error) = &execution.last_error {
                println!("  error: {error} (recoverable={})", execution.recoverable);
            }

            let steps = engines.executions.steps(&record).await?;
            println!("Steps:");
            for step in steps {
                println!(
                    "  #{} {} [{}] {}  tx={}",
                    step.ordinal,
                    step.action.as_str(),
                    step.status.as_str(),
                    step.description,
                    step.tx_hash.as_deref().unwrap_or("-"),
                );
            }

            let history = engines.executions.history(&record).await?;
            println!("History:");
            for transition in history {
                println!(
                    "  {} -> {}  ({})  {}",
                    transition.from_state,
                    transition.to_state,
                    transition.trigger,
                    transition.reason.as_deref().unwrap_or(""),
                );
            }

            let decisions = engines.executions.decisions(&record).await?;
            if !decisions.is_empty() {
                println!("Decisions:");
                for decision in decisions {
                    println!(
                        "  [{}] {}: {}",
                        decision.stage, decision.decision, decision.reasoning
                    );
                }
            }
        }
    }

    Ok(())
}

async fn handle_session_command(
    engines: &Engines<SimulatedSubmitter>,
    command: SessionCommands,
) -> Result<()> {
    match command {
        SessionCommands::Create {
            wallet,
            per_tx,
            total,
            max_tx,
            days,
            chains,
            tokens,
        } => {
            let key = engines
                .sessions
                .create(NewSessionKey {
                    wallet_address: wallet,
                    label: None,
                    max_value_per_tx_usd: to_decimal(per_tx)?,
                    max_total_value_usd: to_decimal(total)?,
                    max_transactions: max_tx,
                    allowed_chains: chains,
                    allowed_contracts: vec![],
                    allowed_tokens: tokens,
                    expires_at: Utc::now() + Duration::days(days),
                })
                .await?;
            println!("Created session key {}", key.id);
        }

        SessionCommands::List { wallet } => {
            let keys = engines.sessions.list(wallet.as_deref()).await?;
            println!("{} session key(s):", keys.len());
            for key in keys {
                println!(
                    "  {}  {}  wallet={}  used=${:.2}/${:.2}  remaining=${:.2}  expires={}",
                    key.id,
                    key.status,
                    key.wallet_address,
                    key.value_limits.total_value_used_usd,
                    key.value_limits.max_total_value_usd,
                    key.value_limits.remaining_usd(),
                    key.expires_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }

        SessionCommands::Revoke { id, reason } => {
            let key = engines.sessions.revoke(&id, &reason).await?;
            println!("Session {} is now {}", key.id, key.status);
        }

        SessionCommands::Extend { id, days } => {
            let key = engines.sessions.extend(&id, days).await?;
            println!("Session {} extended to {}", key.id, key.expires_at);
        }

        SessionCommands::Check {
            id,
            value,
            chain,
            token,
        } => {
            let scope = SpendScope {
                chain_id: chain,
                contract: None,
                token,
            };
            let verdict = engines
                .sessions
                .authorize(&id, Utc::now(), to_decimal(value)?, &scope)
                .await?;
            match verdict {
                Ok(()) => println!("Authorized: ${value:.2} fits session {id}"),
                Err(denied) => println!("Denied: {denied}"),
            }
        }

        SessionCommands::RecordUsage { id, value, tx_hash } => {
            let decision = engines
                .sessions
                .record_usage(
                    &id,
                    to_decimal(value)?,
                    UsageMetadata {
                        action: None,
                        chain_id: None,
                        tx_hash,
                    },
                )
                .await?;
            match decision {
                ReserveDecision::Reserved => println!("Usage recorded"),
                ReserveDecision::Denied(denied) => println!("Denied: {denied}"),
            }
        }

        SessionCommands::Usage { id } => {
            let entries = engines.sessions.usage(&id).await?;
            println!("{} usage entry(ies):", entries.len());
            for entry in entries {
                println!(
                    "  {}  ${:.2}  {}  tx={}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.value_usd,
                    entry.action,
                    entry.tx_hash.as_deref().unwrap_or("-"),
                );
            }
        }

        SessionCommands::Cleanup => {
            let expired = engines.sessions.cleanup_expired(Utc::now()).await?;
            println!("Expired {expired} session(s)");
        }

        SessionCommands::SmartCreate {
            wallet,
            limit,
            actions,
            days,
        } => {
            let actions = actions
                .iter()
                .map(|raw| {
                    ActionClass::parse(raw).with_context(|| format!("unknown action: {raw}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let session = engines
                .sessions
                .create_smart_session(
                    &wallet,
                    to_decimal(limit)?,
                    actions,
                    Utc::now() + Duration::days(days),
                )
                .await?;
            println!("Created smart session {}", session.id);
        }

        SessionCommands::SmartSpend { id, value, action } => {
            let action = ActionClass::parse(&action)
                .with_context(|| format!("unknown action: {action}"))?;
            let decision = engines
                .sessions
                .reserve_smart_session(&id, Utc::now(), to_decimal(value)?, action)
                .await?;
            match decision {
                ReserveDecision::Reserved => println!("Spend recorded"),
                ReserveDecision::Denied(denied) => println!("Denied: {denied}"),
            }
        }

        SessionCommands::SmartRevoke { id } => {
            let session = engines.sessions.revoke_smart_session(&id).await?;
            println!("Smart session {} is now {}", session.id, session.status);
        }
    }

    Ok(())
}

async fn handle_dca_command(
    engines: &Engines<SimulatedSubmitter>,
    command: DcaCommands,
) -> Result<()> {
    match command {
        DcaCommands::Create {
            wallet,
            session,
            chain,
            token_in,
            token_out,
            amount,
            frequency,
            skip_gas_above,
            price_above,
            price_below,
            max_executions,
            max_spend,
        } => {
            let frequency = DcaFrequency::parse(&frequency)
                .with_context(|| format!("unknown frequency: {frequency}"))?;
            let strategy = engines
                .dca
                .create(NewDcaStrategy {
                    owner_wallet: wallet,
                    session_id: session,
                    chain_id: chain,
                    token_in,
                    token_out,
                    amount_per_execution_usd: to_decimal(amount)?,
                    frequency,
                    guards: DcaGuards {
                        skip_if_gas_above_usd: skip_gas_above.map(to_decimal).transpose()?,
                        pause_if_price_above_usd: price_above.map(to_decimal).transpose()?,
                        pause_if_price_below_usd: price_below.map(to_decimal).transpose()?,
                        ..DcaGuards::default()
                    },
                    stop_conditions: DcaStopConditions {
                        max_total_spend_usd: max_spend.map(to_decimal).transpose()?,
                        max_executions,
                        end_date: None,
                    },
                })
                .await?;
            println!("Created DCA strategy {} (draft)", strategy.id);
        }

        DcaCommands::AttachSession { id, session } => {
            let strategy = engines.dca.attach_session(&id, &session).await?;
            println!(
                "Strategy {} now funded by session {}",
                strategy.id,
                strategy.session_id.as_deref().unwrap_or("-")
            );
        }

        DcaCommands::Update {
            id,
            amount,
            frequency,
        } => {
            let frequency = match frequency {
                Some(raw) => Some(
                    DcaFrequency::parse(&raw)
                        .with_context(|| format!("unknown frequency: {raw}"))?,
                ),
                None => None,
            };
            let strategy = engines
                .dca
                .update_config(
                    &id,
                    DcaStrategyPatch {
                        amount_per_execution_usd: amount.map(to_decimal).transpose()?,
                        frequency,
                        ..Default::default()
                    },
                )
                .await?;
            println!("Strategy {} updated", strategy.id);
        }

        DcaCommands::Activate { id } => {
            let strategy = engines.dca.activate(&id, Utc::now()).await?;
            println!("Strategy {} is now {}", strategy.id, strategy.status);
        }

        DcaCommands::Pause { id } => {
            let strategy = engines.dca.pause(&id).await?;
            println!("Strategy {} is now {}", strategy.id, strategy.status);
        }

        DcaCommands::Resume { id } => {
            let strategy = engines.dca.resume(&id, Utc::now()).await?;
            println!("Strategy {} is now {}", strategy.id, strategy.status);
        }

        DcaCommands::Stop { id } => {
            let strategy = engines.dca.stop(&id).await?;
            println!("Strategy {} is now {}", strategy.id, strategy.status);
        }

        DcaCommands::List { status } => {
            let status = match status {
                Some(raw) => Some(
                    DcaStatus::parse(&raw).with_context(|| format!("unknown status: {raw}"))?,
                ),
                None => None,
            };
            let strategies = engines.dca.list(status).await?;
            println!("{} strategy(ies):", strategies.len());
            for strategy in strategies {
                println!(
                    "  {}  {}  {}->{}  ${}/tick  done={}  spent=${:.2}  avg={}",
                    strategy.id,
                    strategy.status,
                    strategy.token_in,
                    strategy.token_out,
                    strategy.amount_per_execution_usd,
                    strategy.stats.successful_executions,
                    strategy.stats.total_amount_spent_usd,
                    strategy
                        .stats
                        .average_price_usd
                        .map(|p| format!("${p:.2}"))
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }

        DcaCommands::History { id, limit } => {
            let strategy = engines.dca.get(&id).await?;
            let executions = engines.dca.executions(&id, limit).await?;
            println!(
                "Strategy {} ({}): {} execution(s)",
                strategy.id,
                strategy.status,
                executions.len()
            );
            for execution in executions {
                println!(
                    "  #{}  {}  {}  {}",
                    execution.execution_number,
                    execution.status.as_str(),
                    execution
                        .skip_reason
                        .map(|r| r.as_str())
                        .unwrap_or("-"),
                    execution.error.as_deref().unwrap_or(""),
                );
            }
        }
    }

    Ok(())
}

async fn handle_copy_command(
    engines: &Engines<SimulatedSubmitter>,
    command: CopyCommands,
) -> Result<()> {
    match command {
        CopyCommands::Follow {
            follower,
            leader,
            session,
            mode,
            size,
            min_trade,
            max_trade,
            delay,
            max_daily_trades,
            max_daily_volume,
            manual,
        } => {
            let sizing_mode = SizingMode::parse(&mode)
                .with_context(|| format!("unknown sizing mode: {mode}"))?;
            let relationship = engines
                .copy
                .follow(NewCopyRelationship {
                    follower_wallet: follower,
                    leader_address: leader,
                    session_id: session,
                    sizing_mode,
                    size_value: to_decimal(size)?,
                    min_trade_usd: to_decimal(min_trade)?,
                    max_trade_usd: to_decimal(max_trade)?,
                    allowed_tokens: vec![],
                    blocked_tokens: vec![],
                    allowed_actions: vec![ActionClass::Swap],
                    delay_seconds: delay as i64,
                    max_delay_seconds: 300,
                    max_slippage_bps: 100,
                    max_daily_trades,
                    max_daily_volume_usd: max_daily_volume.map(to_decimal).transpose()?,
                    requires_approval: manual,
                })
                .await?;
            println!("Created copy relationship {}", relationship.id);
        }

        CopyCommands::Pause { id } => {
            engines.copy.pause(&id).await?;
            println!("Relationship {id} paused");
        }

        CopyCommands::Resume { id } => {
            engines.copy.resume(&id).await?;
            println!("Relationship {id} resumed");
        }

        CopyCommands::Unfollow { id } => {
            engines.copy.unfollow(&id).await?;
            println!("Relationship {id} deactivated");
        }

        CopyCommands::SetPortfolio { wallet, value } => {
            engines.copy.set_portfolio_value(&wallet, to_decimal(value)?).await;
            println!("Portfolio value for {wallet} set to ${value:.2}");
        }

        CopyCommands::List => {
            let relationships = engines.copy.list().await?;
            println!("{} relationship(s):", relationships.len());
            for rel in relationships {
                println!(
                    "  {}  {}{}  {}->{}  {} {}  today={}  lifetime={} (ok={} fail={} skip={})",
                    rel.id,
                    if rel.is_active { "active" } else { "inactive" },
                    if rel.is_paused { "/paused" } else { "" },
                    rel.follower_wallet,
                    rel.leader_address,
                    rel.sizing_mode.as_str(),
                    rel.size_value,
                    rel.daily_trade_count,
                    rel.total_trades,
                    rel.successful_trades,
                    rel.failed_trades,
                    rel.skipped_trades,
                );
            }
        }

        CopyCommands::History { id, limit } => {
            let relationship = engines.copy.get(&id).await?;
            let executions = engines.copy.executions(&id, limit).await?;
            println!(
                "Relationship {} ({} -> {}): {} execution(s)",
                relationship.id,
                relationship.follower_wallet,
                relationship.leader_address,
                executions.len()
            );
            for execution in executions {
                println!(
                    "  {}  {}  {}  leader_tx={}",
                    execution.id,
                    execution.status.as_str(),
                    execution
                        .skip_reason
                        .map(|r| r.as_str())
                        .unwrap_or("-"),
                    execution.leader_tx_hash,
                );
            }
        }
    }

    Ok(())
}

async fn print_status(db: &Database) -> Result<()> {
    println!("=== Engine Status ===");

    let sessions = db.count_sessions_by_status().await?;
    println!("Session keys:");
    for (status, count) in &sessions {
        println!("  {status:<12} {count}");
    }

    let strategies = db.count_dca_strategies_by_status().await?;
    println!("DCA strategies:");
    for (status, count) in &strategies {
        println!("  {status:<12} {count}");
    }

    let records = db.count_records_by_state().await?;
    println!("Execution records:");
    for (state, count) in &records {
        println!("  {state:<12} {count}");
    }

    let copies = db.count_copy_executions_by_status().await?;
    println!("Copy executions:");
    for (status, count) in &copies {
        println!("  {status:<12} {count}");
    }

    Ok(())
}
