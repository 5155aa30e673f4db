//! Telegram adapter (teloxide).
//!
//! This crate implements the `tgpool-core` `PlatformClient` port over the
//! Telegram Bot API. Each managed account is a bot: `Credential::session`
//! holds its token, and `app_id`/`app_secret` are only validated.
//!
//! Bots are narrower than user accounts, and `capabilities()` says so:
//! - `join_channel` reports membership an administrator already granted;
//!   it never joins.
//! - invite hashes cannot be resolved;
//! - service-account login codes are never delivered to bots, so a code watch
//!   only sees what users send or forward to the bot;
//! - group creation and phone checks are unavailable.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{Recipient, UpdateKind, UserId},
    ApiError, RequestError,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tgpool_core::{
    domain::{AccountId, ChannelRef, Credential},
    errors::Error,
    platform::{
        port::PlatformClient,
        types::{
            CreatedGroup, GroupSpec, Handle, HandleId, IncomingMessage, JoinResponse,
            MessageSubscription, PlatformCapabilities,
        },
    },
    Result,
};

const SUBSCRIPTION_BUFFER: usize = 64;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);

const BOT_CAPABILITIES: PlatformCapabilities = PlatformCapabilities {
    joins_channels: false,
    resolves_invites: false,
    receives_login_codes: false,
    creates_groups: false,
    checks_phones: false,
};

struct Session {
    account: AccountId,
    bot: Bot,
    me: UserId,
    cancel: CancellationToken,
}

pub struct TelegramPlatform {
    sessions: Mutex<HashMap<HandleId, Session>>,
    next_handle: AtomicU64,
    poll_timeout: Duration,
}

impl TelegramPlatform {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
            poll_timeout,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<HandleId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_handle_id(&self) -> HandleId {
        HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn session(&self, handle: &Handle) -> Result<(Bot, UserId, CancellationToken)> {
        self.sessions()
            .get(&handle.id)
            .map(|s| (s.bot.clone(), s.me, s.cancel.clone()))
            .ok_or_else(|| Error::Connection(format!("handle {} is disconnected", handle.id)))
    }
}

/// Bot API address for a channel. Invite hashes cannot be resolved by bots.
fn recipient(channel: &ChannelRef) -> Option<Recipient> {
    match channel {
        ChannelRef::Public(name) => Some(Recipient::ChannelUsername(format!("@{name}"))),
        ChannelRef::Invite(_) => None,
    }
}

fn map_err(account: AccountId, e: RequestError) -> Error {
    match e {
        RequestError::RetryAfter(retry_after) => Error::RateLimited { retry_after },
        RequestError::Api(ApiError::NotFound) => Error::AuthRequired(account),
        RequestError::Api(ApiError::ChatNotFound) => Error::TargetNotFound(e.to_string()),
        RequestError::Api(api) => {
            let msg = api.to_string();
            let lower = msg.to_ascii_lowercase();
            if lower.contains("not enough rights")
                || lower.contains("not an administrator")
                || lower.contains("forbidden")
            {
                Error::PermissionDenied(msg)
            } else {
                Error::External(format!("telegram error: {msg}"))
            }
        }
        RequestError::Network(e) => Error::Connection(format!("telegram network error: {e}")),
        other => Error::External(format!("telegram error: {other}")),
    }
}

#[async_trait]
impl PlatformClient for TelegramPlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        BOT_CAPABILITIES
    }

    async fn connect(&self, account: AccountId, credential: &Credential) -> Result<Handle> {
        credential.validate()?;
        let bot = Bot::new(credential.session.clone());
        let me = bot.get_me().await.map_err(|e| map_err(account, e))?;

        let id = self.next_handle_id();
        info!(
            account = %account,
            handle = %id,
            username = me.username(),
            "telegram session opened"
        );
        self.sessions().insert(
            id,
            Session {
                account,
                bot,
                me: me.id,
                cancel: CancellationToken::new(),
            },
        );
        Ok(Handle { id, account })
    }

    fn is_alive(&self, handle: &Handle) -> bool {
        self.sessions().contains_key(&handle.id)
    }

    async fn is_authorized(&self, handle: &Handle) -> Result<bool> {
        let (bot, _, _) = self.session(handle)?;
        match bot.get_me().await {
            Ok(_) => Ok(true),
            Err(RequestError::Api(ApiError::NotFound)) => Ok(false),
            Err(e) => Err(map_err(handle.account, e)),
        }
    }

    async fn join_channel(&self, handle: &Handle, channel: &ChannelRef) -> Result<JoinResponse> {
        let (bot, me, _) = self.session(handle)?;
        let Some(target) = recipient(channel) else {
            return Ok(JoinResponse::PermissionDenied);
        };

        let chat = match bot.get_chat(target).await {
            Ok(chat) => chat,
            Err(RequestError::Api(ApiError::ChatNotFound)) => return Ok(JoinResponse::NotFound),
            Err(RequestError::RetryAfter(retry_after)) => {
                return Ok(JoinResponse::RateLimited { retry_after })
            }
            Err(e) => return Err(map_err(handle.account, e)),
        };

        match bot.get_chat_member(chat.id, me).await {
            Ok(member) if member.kind.is_present() => Ok(JoinResponse::AlreadyMember),
            Ok(_) => Ok(JoinResponse::PermissionDenied),
            Err(RequestError::RetryAfter(retry_after)) => {
                Ok(JoinResponse::RateLimited { retry_after })
            }
            // Bots outside a chat are usually not allowed to look at its members.
            Err(RequestError::Api(_)) => Ok(JoinResponse::PermissionDenied),
            Err(e) => Err(map_err(handle.account, e)),
        }
    }

    async fn export_invite_link(&self, handle: &Handle, channel: &ChannelRef) -> Result<String> {
        let (bot, _, _) = self.session(handle)?;
        let Some(target) = recipient(channel) else {
            return Err(Error::PermissionDenied(format!(
                "{channel} is an invite link and cannot be resolved by a bot"
            )));
        };
        bot.export_chat_invite_link(target)
            .await
            .map_err(|e| map_err(handle.account, e))
    }

    async fn create_group(&self, _handle: &Handle, spec: &GroupSpec) -> Result<CreatedGroup> {
        Err(Error::Unsupported(format!(
            "bots cannot create groups ({:?})",
            spec.title
        )))
    }

    async fn is_registered(&self, _handle: &Handle, _phone: &str) -> Result<bool> {
        Err(Error::Unsupported(
            "bots cannot look up users by phone number".to_string(),
        ))
    }

    async fn subscribe_incoming(&self, handle: &Handle) -> Result<MessageSubscription> {
        let (bot, _, cancel) = self.session(handle)?;
        let (tx, sub) = MessageSubscription::channel(SUBSCRIPTION_BUFFER);
        let poll_secs = u32::try_from(self.poll_timeout.as_secs()).unwrap_or(u32::MAX);
        let account = handle.account;

        tokio::spawn(async move {
            let mut offset: i32 = 0;
            loop {
                let polled = tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tx.closed() => break,
                    res = bot.get_updates().offset(offset).timeout(poll_secs).send() => res,
                };

                let updates = match polled {
                    Ok(updates) => updates,
                    Err(RequestError::RetryAfter(d)) => {
                        sleep(d).await;
                        continue;
                    }
                    Err(RequestError::Api(ApiError::NotFound)) => {
                        warn!(account = %account, "token revoked, ending subscription");
                        break;
                    }
                    Err(e) => {
                        debug!(account = %account, "get_updates failed: {e}");
                        sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = offset.max(update.id + 1);
                    let UpdateKind::Message(msg) = update.kind else {
                        continue;
                    };
                    let Some(text) = msg.text() else {
                        continue;
                    };
                    let sender = msg
                        .from()
                        .map(|u| u.id.0.to_string())
                        .unwrap_or_default();
                    if tx.send(IncomingMessage::new(sender, text)).await.is_err() {
                        return;
                    }
                }
            }
            debug!(account = %account, "update loop stopped");
        });

        Ok(sub)
    }

    async fn disconnect(&self, handle: &Handle) -> Result<()> {
        let removed = self.sessions().remove(&handle.id);
        if let Some(session) = removed {
            session.cancel.cancel();
            info!(account = %session.account, handle = %handle.id, "telegram session closed");
        }
        Ok(())
    }
}
