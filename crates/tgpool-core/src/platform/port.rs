use async_trait::async_trait;

use crate::{
    domain::{AccountId, ChannelRef, Credential},
    platform::types::{
        CreatedGroup, GroupSpec, Handle, JoinResponse, MessageSubscription, PlatformCapabilities,
    },
    Result,
};

/// Hexagonal port for the messaging platform.
///
/// Implementations must never prompt for credentials: an account that needs an
/// interactive login surfaces as `Error::AuthRequired` (from `connect`) or as
/// `Ok(false)` from `is_authorized`.
///
/// Expected `connect` errors: `AuthRequired`, `RateLimited`, `Deactivated`,
/// `InvalidCredential`, `Connection`. Operations outside `capabilities()` fail
/// with `Unsupported`.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn capabilities(&self) -> PlatformCapabilities;

    async fn connect(&self, account: AccountId, credential: &Credential) -> Result<Handle>;

    /// Cheap local liveness check (no network round trip).
    fn is_alive(&self, handle: &Handle) -> bool;

    async fn is_authorized(&self, handle: &Handle) -> Result<bool>;

    async fn join_channel(&self, handle: &Handle, channel: &ChannelRef) -> Result<JoinResponse>;

    async fn export_invite_link(&self, handle: &Handle, channel: &ChannelRef) -> Result<String>;

    /// Create a supergroup, grant the account `spec.rights`, apply the history
    /// setting and export an invite link.
    async fn create_group(&self, handle: &Handle, spec: &GroupSpec) -> Result<CreatedGroup>;

    /// Whether `phone` (normalized `+<digits>`) belongs to a registered user.
    ///
    /// Must leave the account's contact list as it found it.
    async fn is_registered(&self, handle: &Handle, phone: &str) -> Result<bool>;

    async fn subscribe_incoming(&self, handle: &Handle) -> Result<MessageSubscription>;

    /// Idempotent. Ends every subscription opened on the handle.
    async fn disconnect(&self, handle: &Handle) -> Result<()>;
}
