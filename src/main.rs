//! fundledger - escrow, treasury and investment ledger

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fundledger::{
    auth::JwtValidator,
    config::Args,
    db::MongoClient,
    ledger::{ApprovalPolicy, Ledger, LedgerDeps},
    server,
    services::{
        ChainSettlement, HttpChainSettlement, InMemoryProfileService, InMemoryProjectService,
        MongoProfileService, MongoProjectService, ProfileService, ProjectService,
        SimulatedChainSettlement,
    },
    store::{LedgerStore, MemoryLedgerStore, MongoLedgerStore},
};

type Backends = (Arc<dyn LedgerStore>, Arc<dyn ProjectService>, Arc<dyn ProfileService>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("fundledger={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let capabilities = match args.capability_table() {
        Ok(table) => Arc::new(table),
        Err(e) => {
            error!("Configuration error: ROLE_CAPABILITIES: {}", e);
            std::process::exit(1);
        }
    };
    let approval_policy = ApprovalPolicy::new(args.milestone_approval_quorum, args.milestone_signer_list());

    info!("======================================");
    info!("  fundledger - escrow & treasury ledger");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {} / {}", args.mongodb_uri, args.mongodb_db);
    info!(
        "Settlement: {}",
        args.settlement.settlement_url.as_deref().unwrap_or("(simulated)")
    );
    info!(
        "Milestone approvals: {} of {}",
        approval_policy.quorum,
        if approval_policy.signers.is_empty() {
            "any approver".to_string()
        } else {
            format!("{} signer(s)", approval_policy.signers.len())
        }
    );
    info!("======================================");

    let jwt = match args.jwt_secret() {
        Some(secret) if args.jwt_secret.is_some() => {
            JwtValidator::new(secret, args.jwt_expiry_seconds).map_err(anyhow::Error::msg)?
        }
        _ => {
            warn!("Using the development JWT secret");
            JwtValidator::new_dev()
        }
    };

    let ((store, projects, profiles), store_kind) = match connect_mongo(&args).await {
        Ok(backends) => {
            info!("MongoDB connected successfully");
            (backends, "mongodb")
        }
        Err(e) if args.dev_mode => {
            warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
            let backends: Backends = (
                Arc::new(MemoryLedgerStore::new()),
                Arc::new(InMemoryProjectService::new()),
                Arc::new(InMemoryProfileService::permissive()),
            );
            (backends, "memory")
        }
        Err(e) => {
            error!("MongoDB connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let (chain, settlement_kind): (Arc<dyn ChainSettlement>, &'static str) =
        if args.dev_mode && args.settlement.settlement_url.is_none() {
            warn!("No SETTLEMENT_URL set (dev mode, settlement is simulated)");
            (Arc::new(SimulatedChainSettlement::new()), "simulated")
        } else {
            (Arc::new(HttpChainSettlement::from_args(&args.settlement)?), "gateway")
        };

    let ledger = Ledger::new(LedgerDeps {
        store,
        chain,
        projects,
        profiles,
        capabilities: Arc::clone(&capabilities),
        approval_policy,
    });

    let state = Arc::new(server::AppState::new(
        args,
        ledger,
        jwt,
        capabilities,
        store_kind,
        settlement_kind,
    ));

    server::run(state).await?;
    Ok(())
}

async fn connect_mongo(args: &Args) -> fundledger::Result<Backends> {
    let client = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    let store = MongoLedgerStore::new(client.clone(), args.mongodb_transactions).await?;
    let projects = MongoProjectService::new(&client).await?;
    let profiles = MongoProfileService::new(&client).await?;
    Ok((Arc::new(store), Arc::new(projects), Arc::new(profiles)))
}
