use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use tgpool_core::{
    config::Config,
    domain::{AccountId, AccountRecord, ChannelRef, Credential},
    join::{JoinConfig, JoinOrchestrator},
    manager::SessionManager,
    platform::types::GroupSpec,
    store::SessionStore,
    watcher::{CodePatterns, CodeWatcher, WatchOutcome, WatchRequest, TELEGRAM_SERVICE_SENDER},
};
use tgpool_telegram::TelegramPlatform;

#[derive(Parser, Debug)]
#[command(name = "tgpool", about = "Manage a pool of Telegram accounts", version)]
struct Cli {
    /// Registry file (overrides TGPOOL_REGISTRY)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Worker budget for batch operations (overrides TGPOOL_WORKERS)
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered accounts
    List,
    /// Register an account
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long)]
        app_id: String,
        #[arg(long)]
        app_secret: String,
        /// Session artifact (bot token for the Telegram adapter)
        #[arg(long)]
        session: String,
    },
    /// Remove an account and tear down its connection
    Remove { id: u64 },
    /// Rename an account
    Rename { id: u64, name: String },
    /// Probe account status (all accounts when no ids are given)
    Probe { ids: Vec<u64> },
    /// Join accounts to channels
    ///
    /// Adapters that cannot join on their own (bot accounts) need
    /// --check-only, which reports existing membership instead.
    Join {
        /// Account ids (all accounts when omitted)
        #[arg(long = "account")]
        accounts: Vec<u64>,
        /// Channel reference (@name, t.me link, invite link); repeatable
        #[arg(long = "channel")]
        channels: Vec<String>,
        /// File with one channel reference per line
        #[arg(long)]
        channels_file: Option<PathBuf>,
        /// Only report membership; required when the adapter cannot join
        #[arg(long)]
        check_only: bool,
    },
    /// Wait for a login code delivered to an account
    ///
    /// By default only the service account's messages count. Adapters that
    /// never receive those (bot accounts) need --sender or --any-sender.
    Watch {
        id: u64,
        /// Seconds to wait (overrides TGPOOL_WATCH_TIMEOUT_SECS)
        #[arg(long)]
        timeout: Option<u64>,
        /// Only accept codes from this sender id
        #[arg(long, conflicts_with = "any_sender")]
        sender: Option<String>,
        /// Accept codes from any sender
        #[arg(long)]
        any_sender: bool,
    },
    /// Export an invite link for a channel
    Invite { id: u64, channel: String },
    /// Create a supergroup owned by an account and print its invite link
    CreateGroup {
        id: u64,
        title: String,
        #[arg(long, default_value = "")]
        about: String,
        /// Hide earlier messages from members who join later
        #[arg(long)]
        hide_history: bool,
    },
    /// Check whether phone numbers belong to registered users
    CheckPhone {
        id: u64,
        #[arg(required = true)]
        phones: Vec<String>,
    },
    /// Write all account records as JSON (stdout when no path is given)
    Export { path: Option<PathBuf> },
    /// Import account records from a JSON export
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tgpool_core::logging::init("tgpool")?;

    let cli = Cli::parse();
    let mut cfg = Config::load()?;
    if let Some(path) = cli.registry {
        cfg.registry_path = path;
    }
    if let Some(workers) = cli.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        cfg.workers = workers;
    }

    let store = Arc::new(
        SessionStore::open(&cfg.registry_path)
            .with_context(|| format!("opening registry {}", cfg.registry_path.display()))?,
    );
    let platform = Arc::new(TelegramPlatform::new(cfg.poll_timeout));
    let manager = Arc::new(
        SessionManager::new(store.clone(), platform).with_call_timeout(cfg.call_timeout),
    );

    let shutdown = CancellationToken::new();
    let listener = manager.spawn_removal_listener(shutdown.child_token());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    let res = run(cli.command, &cfg, &manager, shutdown.clone()).await;

    shutdown.cancel();
    manager.shutdown().await;
    let _ = listener.await;
    res
}

async fn run(
    command: Command,
    cfg: &Config,
    manager: &Arc<SessionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    let store = manager.store();
    match command {
        Command::List => {
            for a in store.list().await {
                println!("{}\t{}\t{}\t{}", a.id, a.name, a.phone_number, a.status);
            }
        }
        Command::Add {
            name,
            phone,
            app_id,
            app_secret,
            session,
        } => {
            let account = store
                .add(&name, Credential::new(app_id, app_secret, session), &phone)
                .await?;
            println!("{}", account.id);
        }
        Command::Remove { id } => manager.remove_account(AccountId(id)).await?,
        Command::Rename { id, name } => store.update_name(AccountId(id), &name).await?,
        Command::Probe { ids } => {
            let ids = account_ids(store, ids).await;
            let mut results = manager.probe_many(ids, cfg.workers, shutdown).await;
            results.sort_by_key(|(id, _)| *id);
            for (id, res) in results {
                match res {
                    Ok(status) => println!("{id}\t{status}"),
                    Err(e) => println!("{id}\terror: {e}"),
                }
            }
        }
        Command::Join {
            accounts,
            channels,
            channels_file,
            check_only,
        } => {
            let caps = manager.capabilities();
            if !caps.joins_channels && !check_only {
                bail!(
                    "this platform adapter cannot join channels on its own; \
                     add the accounts through a channel admin and re-run with --check-only"
                );
            }
            let mut refs = Vec::new();
            for raw in &channels {
                match ChannelRef::parse(raw) {
                    Some(c) => refs.push(c),
                    None => bail!("invalid channel reference: {raw}"),
                }
            }
            if let Some(path) = channels_file {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                refs.extend(ChannelRef::parse_lines(&text));
            }
            if !caps.resolves_invites {
                if let Some(invite) = refs.iter().find(|c| matches!(c, ChannelRef::Invite(_))) {
                    bail!("this platform adapter cannot resolve invite links: {invite}");
                }
            }

            let ids = account_ids(store, accounts).await;
            let orchestrator = JoinOrchestrator::new(
                manager.clone(),
                JoinConfig {
                    workers: cfg.workers,
                },
            );
            let report = orchestrator.run_with_cancel(&ids, &refs, shutdown).await;
            for r in &report.results {
                let detail = r.detail.as_deref().unwrap_or("");
                println!("{}\t{}\t{}\t{detail}", r.account, r.channel, r.outcome.as_str());
            }
            if report.cancelled {
                bail!(
                    "join cancelled after {} of {} pairs",
                    report.len(),
                    report.total
                );
            }
        }
        Command::Watch {
            id,
            timeout,
            sender,
            any_sender,
        } => {
            let patterns = CodePatterns::new(cfg.code_patterns.as_slice())?;
            let mut request = WatchRequest::new(AccountId(id), patterns).with_timeout(
                timeout
                    .map(Duration::from_secs)
                    .unwrap_or(cfg.watch_timeout),
            );
            match (sender, any_sender) {
                (Some(sender), _) => request = request.only_from(sender),
                (None, true) => {}
                (None, false) if manager.capabilities().receives_login_codes => {
                    request = request.only_from(TELEGRAM_SERVICE_SENDER);
                }
                (None, false) => bail!(
                    "this platform adapter never receives service login codes; \
                     pass --sender or --any-sender to watch messages sent to the account"
                ),
            }

            let res = CodeWatcher::new(manager.clone())
                .watch(request, shutdown)
                .await;
            match res.outcome {
                WatchOutcome::Found { code, .. } => println!("{code}"),
                WatchOutcome::TimedOut => bail!("no login code received in time"),
                WatchOutcome::ConnectionError(e) => bail!("watch failed: {e}"),
                WatchOutcome::Cancelled => bail!("watch cancelled"),
            }
        }
        Command::Invite { id, channel } => {
            let Some(channel) = ChannelRef::parse(&channel) else {
                bail!("invalid channel reference: {channel}");
            };
            let link = manager.export_invite_link(AccountId(id), &channel).await?;
            println!("{link}");
        }
        Command::CreateGroup {
            id,
            title,
            about,
            hide_history,
        } => {
            let mut spec = GroupSpec::new(title, about);
            spec.history_visible = !hide_history;
            let group = manager.create_group(AccountId(id), &spec).await?;
            let link = group
                .invite_link
                .as_deref()
                .unwrap_or("(no permission to export an invite link)");
            println!("{}\t{}\t{link}", group.id, group.title);
        }
        Command::CheckPhone { id, phones } => {
            for (phone, res) in manager.check_phones(AccountId(id), &phones, &shutdown).await {
                match res {
                    Ok(true) => println!("{phone}\tregistered"),
                    Ok(false) => println!("{phone}\tnot registered"),
                    Err(e) => println!("{phone}\terror: {e}"),
                }
            }
        }
        Command::Export { path } => {
            let records: Vec<AccountRecord> =
                store.list().await.into_iter().map(Into::into).collect();
            let json = serde_json::to_string_pretty(&records)?;
            match path {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Command::Import { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let records: Vec<AccountRecord> = serde_json::from_str(&text)?;
            let mut imported = 0usize;
            for record in records {
                let id = record.id;
                match store.insert_record(record).await {
                    Ok(_) => imported += 1,
                    Err(e) => eprintln!("skipping account {id}: {e}"),
                }
            }
            println!("imported {imported} accounts");
        }
    }
    Ok(())
}

async fn account_ids(store: &SessionStore, ids: Vec<u64>) -> Vec<AccountId> {
    if ids.is_empty() {
        store.list().await.into_iter().map(|a| a.id).collect()
    } else {
        ids.into_iter().map(AccountId).collect()
    }
}
