//! The CLI front end (spec §6): a thin wrapper over the registry and
//! store. Subcommands `add`, `list`, `update`, `drive`, `daemon`, and an
//! `acme` group for the standalone admin operations (`newreg`, `delreg`,
//! `agree`, `authz`, `validate`). Grounded in the teacher's deleted
//! `main.rs` clap-derive/tracing wiring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use acmemd::acme::account;
use acmemd::acme::transport::AcmeClient;
use acmemd::config::Settings;
use acmemd::daemon;
use acmemd::drive::DefaultRenewalPolicy;
use acmemd::error::AcmeMdError;
use acmemd::jws::KeyId;
use acmemd::model::ManagedDomain;
use acmemd::registry::{Field, Registry};
use acmemd::store::FsStore;

#[derive(Parser)]
#[command(name = "acmemd", about = "Drives ACME certificate issuance for managed domains")]
struct Cli {
    #[arg(long, env = "ACMEMD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declares a new managed domain.
    Add(AddArgs),
    /// Lists every managed domain known to the store.
    List,
    /// Updates selected fields of an existing managed domain.
    Update(UpdateArgs),
    /// Drives one MD (or every MD) through the ACME protocol.
    Drive(DriveArgs),
    /// Standalone ACME admin operations.
    #[command(subcommand)]
    Acme(AcmeCommand),
    /// Renews certificates that are due, once or on a recurring schedule.
    Daemon(DaemonArgs),
}

#[derive(Args)]
struct AddArgs {
    #[arg(long = "domain", required = true)]
    domains: Vec<String>,
    #[arg(long)]
    ca_url: Option<String>,
    #[arg(long = "contact")]
    contacts: Vec<String>,
    #[arg(long)]
    must_staple: bool,
}

#[derive(Args)]
struct UpdateArgs {
    name: String,
    #[arg(long = "domain")]
    domains: Vec<String>,
    #[arg(long)]
    ca_url: Option<String>,
    #[arg(long = "contact")]
    contacts: Vec<String>,
    #[arg(long)]
    agreement: Option<String>,
}

#[derive(Args)]
struct DriveArgs {
    name: Option<String>,
    #[arg(long)]
    all: bool,
}

#[derive(Args)]
struct DaemonArgs {
    /// Run a single renewal scan and exit instead of looping forever.
    #[arg(long)]
    once: bool,
}

#[derive(Subcommand)]
enum AcmeCommand {
    /// Registers a brand-new account with the CA.
    Newreg {
        #[arg(long)]
        ca_url: String,
        #[arg(long = "contact", required = true)]
        contacts: Vec<String>,
    },
    /// Marks an account disabled without deleting it.
    Delreg { id: String },
    /// Accepts the CA's terms of service for an account.
    Agree { id: String, tos: String },
    /// Registers a fresh authorization for one domain of an MD.
    Authz { name: String, domain: String },
    /// Validates a stored account against its CA.
    Validate { id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(AcmeMdError::InvalidArgument(String::new()).exit_code());
        }
    };
    if let Err(err) = settings.validate() {
        eprintln!("configuration error: {err}");
        std::process::exit(err.exit_code());
    }

    let store = match FsStore::open(&settings.store_dir).await {
        Ok(s) => s,
        Err(err) => {
            eprintln!("could not open store at {}: {err}", settings.store_dir.display());
            std::process::exit(err.exit_code());
        }
    };

    let exit_code = run(&cli.command, &store, &settings).await.map_or_else(
        |err| {
            eprintln!("error: {err}");
            err.exit_code()
        },
        |()| 0,
    );
    std::process::exit(exit_code);
}

async fn run(command: &Command, store: &FsStore, settings: &Settings) -> Result<(), AcmeMdError> {
    match command {
        Command::Add(args) => cmd_add(store, settings, args).await,
        Command::List => cmd_list(store).await,
        Command::Update(args) => cmd_update(store, args).await,
        Command::Drive(args) => cmd_drive(store, settings, args).await,
        Command::Acme(sub) => cmd_acme(store, settings, sub).await,
        Command::Daemon(args) => cmd_daemon(store, settings, args).await,
    }
}

async fn cmd_add(store: &FsStore, settings: &Settings, args: &AddArgs) -> Result<(), AcmeMdError> {
    let ca_url = args.ca_url.clone().unwrap_or_else(|| settings.default_ca_url.clone());
    let contacts = if args.contacts.is_empty() {
        settings.default_contacts.clone()
    } else {
        args.contacts.clone()
    };
    let mut md = ManagedDomain::new(args.domains.clone(), ca_url, contacts, args.must_staple)?;
    md.ca.agreement = settings.default_agreement.clone();

    let registry = Registry::new();
    registry.add(store, &md).await?;
    println!("added managed domain {}", md.name);
    Ok(())
}

async fn cmd_list(store: &FsStore) -> Result<(), AcmeMdError> {
    let registry = Registry::new();
    registry
        .iterate(store, |md| {
            println!("{}\t{:?}\t{}", md.name, md.state, md.domains.join(","));
            true
        })
        .await
}

async fn cmd_update(store: &FsStore, args: &UpdateArgs) -> Result<(), AcmeMdError> {
    let registry = Registry::new();
    let mut current = registry.get(store, &args.name).await?;
    let mut fields = Vec::new();

    if !args.domains.is_empty() {
        current.domains = args.domains.clone();
        fields.push(Field::Domains);
    }
    if let Some(ca_url) = &args.ca_url {
        current.ca.url = ca_url.clone();
        fields.push(Field::CaUrl);
    }
    if !args.contacts.is_empty() {
        current.contacts = args.contacts.clone();
        fields.push(Field::Contacts);
    }
    if let Some(agreement) = &args.agreement {
        current.ca.agreement = Some(agreement.clone());
        fields.push(Field::Agreement);
    }

    registry.update(store, &args.name, &current, &fields).await?;
    println!("updated {}", args.name);
    Ok(())
}

async fn cmd_drive(store: &FsStore, settings: &Settings, args: &DriveArgs) -> Result<(), AcmeMdError> {
    let registry = Registry::new();
    let default_agreement = settings.default_agreement.as_deref();

    let names = if args.all {
        let mut names = Vec::new();
        registry
            .iterate(store, |md| {
                names.push(md.name.clone());
                true
            })
            .await?;
        names
    } else {
        vec![args
            .name
            .clone()
            .ok_or_else(|| AcmeMdError::InvalidArgument("drive requires a name or --all".to_string()))?]
    };

    for name in names {
        let mut md = registry.get(store, &name).await?;
        registry.drive(store, &mut md, default_agreement).await?;
        println!("drove {name} to completion");
    }
    Ok(())
}

async fn cmd_acme(store: &FsStore, settings: &Settings, sub: &AcmeCommand) -> Result<(), AcmeMdError> {
    match sub {
        AcmeCommand::Newreg { ca_url, contacts } => {
            let mut acme = AcmeClient::new(ca_url.clone());
            acme.setup().await?;
            let account = account::register(store, &mut acme, contacts, settings.default_agreement.as_deref()).await?;
            println!("registered account {} ({})", account.id, account.url);
            Ok(())
        }
        AcmeCommand::Delreg { id } => {
            let (mut account, key) = account::load(store, id).await?;
            account::disable(store, &mut account, &key).await?;
            println!("disabled account {id}");
            Ok(())
        }
        AcmeCommand::Agree { id, tos } => {
            let (mut account, key) = account::load(store, id).await?;
            let mut acme = AcmeClient::new(account.ca_url.clone());
            acme.setup().await?;
            account::agree(store, &mut acme, &mut account, &key, tos).await?;
            println!("account {id} agreed to {tos}");
            Ok(())
        }
        AcmeCommand::Authz { name, domain } => {
            let registry = Registry::new();
            let md = registry.get(store, name).await?;
            let acct_id = md
                .ca
                .account
                .clone()
                .ok_or_else(|| AcmeMdError::InvalidArgument(format!("{name} has no chosen account yet")))?;
            let (_, key) = account::load(store, &acct_id).await?;
            let mut acme = AcmeClient::new(md.ca.url.clone());
            acme.setup().await?;
            let authz = acmemd::acme::authz::register(&mut acme, &key, &KeyId::Kid(acct_id), domain).await?;
            println!("registered authorization at {}", authz.location);
            Ok(())
        }
        AcmeCommand::Validate { id } => {
            let (account, key) = account::load(store, id).await?;
            let mut acme = AcmeClient::new(account.ca_url.clone());
            acme.setup().await?;
            account::validate(&mut acme, &account, &key).await?;
            println!("account {id} is valid");
            Ok(())
        }
    }
}

async fn cmd_daemon(store: &FsStore, settings: &Settings, args: &DaemonArgs) -> Result<(), AcmeMdError> {
    let registry = Registry::new();
    let policy = DefaultRenewalPolicy::from_days(settings.renew_within_days);
    let default_agreement = settings.default_agreement.clone();

    if args.once {
        let outcomes = daemon::run_once(store, &registry, &policy, default_agreement.as_deref()).await?;
        for (name, outcome) in &outcomes {
            match outcome {
                Ok(()) => println!("renewed {name}"),
                Err(err) => eprintln!("renewal failed for {name}: {err}"),
            }
        }
        Ok(())
    } else {
        let store: Arc<dyn acmemd::store::Store> = Arc::new(store.clone());
        let registry = Arc::new(registry);
        let policy: Arc<dyn acmemd::drive::RenewalPolicy> = Arc::new(policy);
        let interval = Duration::from_secs(settings.daemon_interval_secs);
        daemon::run_loop(store, registry, policy, default_agreement, interval).await
    }
}
