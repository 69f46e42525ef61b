//! portalctl - operator tool for a compliance portal store
//!
//! Usage:
//!   portalctl --db-path portal.db history form <form-id>
//!   portalctl pending-requests
//!   portalctl register-cm --user-id u1 --name "Asha Rao" --email asha@bank.example \
//!       --designation "Collection Manager" --product-tag "Personal Loan"
//!
//! Environment variables:
//!   PORTAL_DB_PATH - sled database path (default: portal.db)
//!   PORTAL_CM_PASSWORD - password for `register-cm` when --password is omitted
//!   RUST_LOG - log filter (default: info)

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use compliance_workflow::activity::EntityType;
use compliance_workflow::approval::Decision;
use compliance_workflow::directory::{Directory, NewCollectionManager};
use compliance_workflow::store::Store;
use compliance_workflow::WorkflowConfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "portalctl")]
#[command(about = "Inspect and administer a compliance portal store")]
#[command(version)]
struct Args {
    /// sled database path
    #[arg(long, env = "PORTAL_DB_PATH")]
    db_path: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Activity recorded against one entity, oldest first
    History {
        #[arg(value_enum)]
        entity: Entity,
        id: String,
    },
    /// Approval requests still waiting for an admin
    PendingRequests,
    /// Notifications queued for a user
    Notifications { user_id: String },
    /// Register a collection manager profile
    RegisterCm {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "Collection Manager")]
        designation: String,
        #[arg(long, env = "PORTAL_CM_PASSWORD", hide_env_values = true)]
        password: String,
        /// Products the manager may approve for; none means all
        #[arg(long = "product-tag")]
        product_tags: Vec<String>,
    },
    /// Add a user to the admin roster that receives request notifications
    RegisterAdmin { user_id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Entity {
    Form,
    Request,
    Session,
    Approval,
}

impl From<Entity> for EntityType {
    fn from(entity: Entity) -> Self {
        match entity {
            Entity::Form => EntityType::Form,
            Entity::Request => EntityType::ApprovalRequest,
            Entity::Session => EntityType::CmSession,
            Entity::Approval => EntityType::CmApproval,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = WorkflowConfig::from_env()?;
    if let Some(path) = args.db_path {
        config = config.with_db_path(path);
    }
    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;

    match args.command {
        Command::History { entity, id } => {
            for entry in store.history(entity.into(), &id)? {
                println!(
                    "{}  {:<20} {:<24} {}",
                    entry.created_at,
                    entry.action.as_str(),
                    entry.actor_id,
                    entry.description
                );
            }
        }
        Command::PendingRequests => {
            for request in store
                .approval_requests()?
                .into_iter()
                .filter(|r| r.decision == Decision::Pending)
            {
                println!(
                    "{}  {}  {:<22} form {} ({}) by {}: {}",
                    request.created_at,
                    request.id,
                    request.request_type.as_str(),
                    request.form_id,
                    request.form_type,
                    request.requester_id,
                    request.reason
                );
            }
        }
        Command::Notifications { user_id } => {
            for notification in store.notifications_for(&user_id)? {
                let marker = if notification.read { " " } else { "*" };
                println!(
                    "{marker} {}  {:<18} {}: {}",
                    notification.created_at,
                    notification.kind.as_str(),
                    notification.title,
                    notification.message
                );
            }
        }
        Command::RegisterCm {
            user_id,
            name,
            email,
            designation,
            password,
            product_tags,
        } => {
            let profile = Directory::new(store.clone()).register_collection_manager(
                NewCollectionManager {
                    user_id,
                    name,
                    email,
                    designation,
                    password,
                    product_tags,
                },
            )?;
            info!(profile_id = %profile.id, email = %profile.email, "registered collection manager");
            println!("{}", profile.id);
        }
        Command::RegisterAdmin { user_id } => {
            Directory::new(store.clone()).register_admin(&user_id)?;
            info!(%user_id, "registered admin");
        }
    }

    store.flush()?;
    Ok(())
}
