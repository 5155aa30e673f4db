use std::{fmt, time::Duration};

use tokio::sync::mpsc;

use crate::domain::AccountId;

/// Opaque, platform-assigned connection id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// An open, authenticated connection for one account.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub id: HandleId,
    pub account: AccountId,
}

/// What an adapter can actually do, for feature gating by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// `join_channel` joins on its own instead of only reporting membership.
    pub joins_channels: bool,
    /// `ChannelRef::Invite` targets can be resolved.
    pub resolves_invites: bool,
    /// Login codes from the service account reach `subscribe_incoming`.
    pub receives_login_codes: bool,
    pub creates_groups: bool,
    pub checks_phones: bool,
}

impl PlatformCapabilities {
    /// A full user-account client.
    pub const USER: Self = Self {
        joins_channels: true,
        resolves_invites: true,
        receives_login_codes: true,
        creates_groups: true,
        checks_phones: true,
    };
}

/// Administrator rights the creating account grants itself on a new group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdminRights {
    pub post_messages: bool,
    pub invite_users: bool,
    pub add_admins: bool,
}

impl Default for AdminRights {
    fn default() -> Self {
        Self {
            post_messages: true,
            invite_users: true,
            add_admins: true,
        }
    }
}

/// Settings for a new supergroup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSpec {
    pub title: String,
    pub about: String,
    pub rights: AdminRights,
    /// Members who join later can read earlier messages.
    pub history_visible: bool,
}

impl GroupSpec {
    pub fn new(title: impl Into<String>, about: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            about: about.into(),
            rights: AdminRights::default(),
            history_visible: true,
        }
    }
}

/// A supergroup created by one of the pool's accounts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedGroup {
    /// Platform chat id.
    pub id: i64,
    pub title: String,
    /// `None` when the account may not export invites for the new group.
    pub invite_link: Option<String>,
}

/// Platform answer to a join request.
///
/// Transport failures are reported through `Err` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinResponse {
    Joined,
    AlreadyMember,
    PermissionDenied,
    NotFound,
    RateLimited { retry_after: Duration },
}

/// One inbound message as seen by the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Platform sender reference (user id or username), empty when unknown.
    pub sender: String,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// Lazy, unbounded sequence of inbound messages for one handle.
///
/// Ends (`recv` yields `None`) once the handle is disconnected. Not restartable:
/// a new subscription needs a new `subscribe_incoming` call.
#[derive(Debug)]
pub struct MessageSubscription {
    rx: mpsc::Receiver<IncomingMessage>,
}

impl MessageSubscription {
    pub fn new(rx: mpsc::Receiver<IncomingMessage>) -> Self {
        Self { rx }
    }

    /// Convenience for adapters: a bounded sender paired with its subscription.
    pub fn channel(buffer: usize) -> (mpsc::Sender<IncomingMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }

    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        self.rx.recv().await
    }
}
