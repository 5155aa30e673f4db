//! In-process `PlatformClient` used by tests and dry runs.
//!
//! Behaviour is scripted per account / channel, and every call is counted so
//! tests can assert on connects, disconnects and peak concurrency.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
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
const FIRST_GROUP_ID: i64 = -100_000_000_001;

/// How `connect` behaves for an account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Connects and reports authorized.
    #[default]
    Authorized,
    /// Connects, but `is_authorized` reports false.
    Unauthorized,
    /// `connect` itself fails with `AuthRequired`.
    AuthRequired,
    RateLimited(Duration),
    Deactivated,
    Unreachable,
}

/// Per-channel rule applied to every account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRule {
    Missing,
    Denied,
    /// Transport error on every call.
    Broken,
}

#[derive(Default)]
struct State {
    capabilities: Option<PlatformCapabilities>,
    connect_default: HashMap<AccountId, ConnectBehavior>,
    connect_script: HashMap<AccountId, VecDeque<ConnectBehavior>>,
    join_script: HashMap<(AccountId, ChannelRef), VecDeque<JoinResponse>>,
    channel_rules: HashMap<ChannelRef, ChannelRule>,
    message_script: HashMap<AccountId, Vec<(Duration, IncomingMessage)>>,
    registered_phones: HashSet<String>,
    phone_limits: HashMap<String, Duration>,
    group_invites_denied: bool,

    live: HashMap<HandleId, LiveHandle>,
    members: HashSet<(AccountId, ChannelRef)>,
    groups: Vec<(AccountId, GroupSpec, CreatedGroup)>,

    connects: HashMap<AccountId, usize>,
    disconnects: HashMap<AccountId, usize>,
    join_calls: usize,
    phone_checks: usize,
}

struct LiveHandle {
    account: AccountId,
    authorized: bool,
    subscribers: Vec<mpsc::Sender<IncomingMessage>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlightGuard<'a>(&'a InFlight);

impl<'a> InFlightGuard<'a> {
    fn enter(f: &'a InFlight) -> Self {
        let now = f.current.fetch_add(1, Ordering::SeqCst) + 1;
        f.peak.fetch_max(now, Ordering::SeqCst);
        Self(f)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable in-memory platform.
#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
    latency: Duration,
    next_handle: AtomicU64,
    in_flight: Arc<InFlight>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every network-like call sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Narrow what the platform claims to support. Everything is on by default.
    pub fn set_capabilities(&self, capabilities: PlatformCapabilities) {
        self.state().capabilities = Some(capabilities);
    }

    pub fn set_connect(&self, account: AccountId, behavior: ConnectBehavior) {
        self.state().connect_default.insert(account, behavior);
    }

    /// One-shot behaviours consumed before the default applies.
    pub fn script_connect(
        &self,
        account: AccountId,
        script: impl IntoIterator<Item = ConnectBehavior>,
    ) {
        self.state()
            .connect_script
            .entry(account)
            .or_default()
            .extend(script);
    }

    /// One-shot join responses for a pair, consumed before membership logic applies.
    pub fn script_join(
        &self,
        account: AccountId,
        channel: &ChannelRef,
        script: impl IntoIterator<Item = JoinResponse>,
    ) {
        self.state()
            .join_script
            .entry((account, channel.clone()))
            .or_default()
            .extend(script);
    }

    pub fn set_channel_rule(&self, channel: &ChannelRef, rule: ChannelRule) {
        self.state().channel_rules.insert(channel.clone(), rule);
    }

    pub fn add_member(&self, account: AccountId, channel: &ChannelRef) {
        self.state().members.insert((account, channel.clone()));
    }

    pub fn is_member(&self, account: AccountId, channel: &ChannelRef) -> bool {
        self.state().members.contains(&(account, channel.clone()))
    }

    pub fn register_phone(&self, phone: &str) {
        self.state().registered_phones.insert(phone.to_string());
    }

    /// The next check of `phone` fails with a rate limit.
    pub fn limit_phone_check(&self, phone: &str, retry_after: Duration) {
        self.state()
            .phone_limits
            .insert(phone.to_string(), retry_after);
    }

    /// Groups get created, but exporting their invite link is refused.
    pub fn deny_group_invites(&self) {
        self.state().group_invites_denied = true;
    }

    /// Groups created by `account`, oldest first.
    pub fn groups(&self, account: AccountId) -> Vec<(GroupSpec, CreatedGroup)> {
        self.state()
            .groups
            .iter()
            .filter(|(a, _, _)| *a == account)
            .map(|(_, spec, group)| (spec.clone(), group.clone()))
            .collect()
    }

    pub fn phone_checks(&self) -> usize {
        self.state().phone_checks
    }

    /// Messages delivered to every new subscription for `account`, each after
    /// its delay (relative to the previous message).
    pub fn script_messages(
        &self,
        account: AccountId,
        messages: impl IntoIterator<Item = (Duration, IncomingMessage)>,
    ) {
        self.state()
            .message_script
            .entry(account)
            .or_default()
            .extend(messages);
    }

    /// Deliver a message to the live subscriptions of `account`. Returns how
    /// many subscriptions received it.
    pub fn push_message(&self, account: AccountId, message: IncomingMessage) -> usize {
        let st = self.state();
        st.live
            .values()
            .filter(|h| h.account == account)
            .flat_map(|h| h.subscribers.iter())
            .filter(|tx| tx.try_send(message.clone()).is_ok())
            .count()
    }

    pub fn connects(&self, account: AccountId) -> usize {
        self.state().connects.get(&account).copied().unwrap_or(0)
    }

    /// Effective disconnects (repeat calls on a dead handle are not counted).
    pub fn disconnects(&self, account: AccountId) -> usize {
        self.state().disconnects.get(&account).copied().unwrap_or(0)
    }

    pub fn live_handles(&self, account: AccountId) -> usize {
        self.state()
            .live
            .values()
            .filter(|h| h.account == account)
            .count()
    }

    pub fn join_calls(&self) -> usize {
        self.state().join_calls
    }

    /// Highest number of simultaneously outstanding calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }

    fn next_connect_behavior(&self, account: AccountId) -> ConnectBehavior {
        let mut st = self.state();
        if let Some(b) = st.connect_script.get_mut(&account).and_then(|q| q.pop_front()) {
            return b;
        }
        st.connect_default.get(&account).copied().unwrap_or_default()
    }

    fn require(&self, supported: impl Fn(&PlatformCapabilities) -> bool, what: &str) -> Result<()> {
        if supported(&self.capabilities()) {
            Ok(())
        } else {
            Err(Error::Unsupported(what.to_string()))
        }
    }

    fn ensure_live(st: &State, handle: &Handle) -> Result<()> {
        if st.live.contains_key(&handle.id) {
            Ok(())
        } else {
            Err(Error::Connection(format!("handle {} is disconnected", handle.id)))
        }
    }
}

#[async_trait]
impl PlatformClient for MemoryPlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        self.state()
            .capabilities
            .unwrap_or(PlatformCapabilities::USER)
    }

    async fn connect(&self, account: AccountId, credential: &Credential) -> Result<Handle> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.simulate_latency().await;
        credential.validate()?;

        let authorized = match self.next_connect_behavior(account) {
            ConnectBehavior::Authorized => true,
            ConnectBehavior::Unauthorized => false,
            ConnectBehavior::AuthRequired => return Err(Error::AuthRequired(account)),
            ConnectBehavior::RateLimited(retry_after) => {
                return Err(Error::RateLimited { retry_after })
            }
            ConnectBehavior::Deactivated => return Err(Error::Deactivated(account)),
            ConnectBehavior::Unreachable => {
                return Err(Error::Connection("platform unreachable".to_string()))
            }
        };

        let id = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let mut st = self.state();
        st.live.insert(
            id,
            LiveHandle {
                account,
                authorized,
                subscribers: Vec::new(),
                cancel: CancellationToken::new(),
            },
        );
        *st.connects.entry(account).or_default() += 1;
        Ok(Handle { id, account })
    }

    fn is_alive(&self, handle: &Handle) -> bool {
        self.state().live.contains_key(&handle.id)
    }

    async fn is_authorized(&self, handle: &Handle) -> Result<bool> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.simulate_latency().await;
        let st = self.state();
        Self::ensure_live(&st, handle)?;
        Ok(st.live.get(&handle.id).is_some_and(|h| h.authorized))
    }

    async fn join_channel(&self, handle: &Handle, channel: &ChannelRef) -> Result<JoinResponse> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.simulate_latency().await;

        let mut st = self.state();
        st.join_calls += 1;
        Self::ensure_live(&st, handle)?;

        let key = (handle.account, channel.clone());
        let scripted = st.join_script.get_mut(&key).and_then(|q| q.pop_front());
        if let Some(resp) = scripted {
            if resp == JoinResponse::Joined {
                st.members.insert(key);
            }
            return Ok(resp);
        }

        match st.channel_rules.get(channel) {
            Some(ChannelRule::Missing) => return Ok(JoinResponse::NotFound),
            Some(ChannelRule::Denied) => return Ok(JoinResponse::PermissionDenied),
            Some(ChannelRule::Broken) => {
                return Err(Error::Connection(format!("join {channel} failed")))
            }
            None => {}
        }

        if st.members.insert(key) {
            Ok(JoinResponse::Joined)
        } else {
            Ok(JoinResponse::AlreadyMember)
        }
    }

    async fn export_invite_link(&self, handle: &Handle, channel: &ChannelRef) -> Result<String> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.simulate_latency().await;

        let st = self.state();
        Self::ensure_live(&st, handle)?;
        match st.channel_rules.get(channel) {
            Some(ChannelRule::Missing) => Err(Error::TargetNotFound(channel.to_string())),
            Some(ChannelRule::Denied) => Err(Error::PermissionDenied(format!(
                "no right to invite users to {channel}"
            ))),
            Some(ChannelRule::Broken) => Err(Error::Connection(format!(
                "export invite for {channel} failed"
            ))),
            None => {
                let slug = match channel {
                    ChannelRef::Public(name) | ChannelRef::Invite(name) => name,
                };
                Ok(format!("https://t.me/+{slug}{}", handle.account))
            }
        }
    }

    async fn create_group(&self, handle: &Handle, spec: &GroupSpec) -> Result<CreatedGroup> {
        self.require(|c| c.creates_groups, "group creation")?;
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.simulate_latency().await;

        let mut st = self.state();
        Self::ensure_live(&st, handle)?;
        let id = FIRST_GROUP_ID - st.groups.len() as i64;
        let invite_link = (!st.group_invites_denied).then(|| format!("https://t.me/+g{}", -id));
        let group = CreatedGroup {
            id,
            title: spec.title.clone(),
            invite_link,
        };
        st.groups.push((handle.account, spec.clone(), group.clone()));
        Ok(group)
    }

    async fn is_registered(&self, handle: &Handle, phone: &str) -> Result<bool> {
        self.require(|c| c.checks_phones, "phone registration check")?;
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.simulate_latency().await;

        let mut st = self.state();
        Self::ensure_live(&st, handle)?;
        st.phone_checks += 1;
        if let Some(retry_after) = st.phone_limits.remove(phone) {
            return Err(Error::RateLimited { retry_after });
        }
        Ok(st.registered_phones.contains(phone))
    }

    async fn subscribe_incoming(&self, handle: &Handle) -> Result<MessageSubscription> {
        let (tx, sub) = MessageSubscription::channel(SUBSCRIPTION_BUFFER);

        let (script, cancel) = {
            let mut st = self.state();
            Self::ensure_live(&st, handle)?;
            let script = st
                .message_script
                .get(&handle.account)
                .cloned()
                .unwrap_or_default();
            let live = st
                .live
                .get_mut(&handle.id)
                .ok_or_else(|| Error::Connection(format!("handle {} is disconnected", handle.id)))?;
            live.subscribers.push(tx.clone());
            (script, live.cancel.clone())
        };

        if !script.is_empty() {
            tokio::spawn(async move {
                for (delay, msg) in script {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                // Hold the sender until disconnect so the stream stays open.
                cancel.cancelled().await;
            });
        }

        Ok(sub)
    }

    async fn disconnect(&self, handle: &Handle) -> Result<()> {
        let mut st = self.state();
        if let Some(live) = st.live.remove(&handle.id) {
            live.cancel.cancel();
            *st.disconnects.entry(live.account).or_default() += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> Credential {
        Credential::new("1", "hash", "a.session")
    }

    fn chan(name: &str) -> ChannelRef {
        ChannelRef::Public(name.to_string())
    }

    #[tokio::test]
    async fn join_twice_yields_joined_then_already_member() {
        let p = MemoryPlatform::new();
        let h = p.connect(AccountId(1), &cred()).await.unwrap();
        let c = chan("x");

        assert_eq!(p.join_channel(&h, &c).await.unwrap(), JoinResponse::Joined);
        assert_eq!(
            p.join_channel(&h, &c).await.unwrap(),
            JoinResponse::AlreadyMember
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_ends_subscription() {
        let p = MemoryPlatform::new();
        let h = p.connect(AccountId(1), &cred()).await.unwrap();
        let mut sub = p.subscribe_incoming(&h).await.unwrap();

        assert_eq!(
            p.push_message(AccountId(1), IncomingMessage::new("777000", "hi")),
            1
        );
        assert_eq!(sub.recv().await.unwrap().text, "hi");

        p.disconnect(&h).await.unwrap();
        p.disconnect(&h).await.unwrap();
        assert_eq!(p.disconnects(AccountId(1)), 1);
        assert!(!p.is_alive(&h));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn scripted_connects_are_consumed_first() {
        let p = MemoryPlatform::new();
        let a = AccountId(3);
        p.script_connect(a, [ConnectBehavior::RateLimited(Duration::from_secs(2))]);

        let err = p.connect(a, &cred()).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(p.connect(a, &cred()).await.is_ok());
        assert_eq!(p.connects(a), 1);
    }

    #[tokio::test]
    async fn created_groups_get_sequential_ids_and_links() {
        let p = MemoryPlatform::new();
        let h = p.connect(AccountId(1), &cred()).await.unwrap();

        let first = p.create_group(&h, &GroupSpec::new("one", "")).await.unwrap();
        p.deny_group_invites();
        let second = p.create_group(&h, &GroupSpec::new("two", "")).await.unwrap();

        assert_eq!(first.id, FIRST_GROUP_ID);
        assert_eq!(second.id, FIRST_GROUP_ID - 1);
        assert!(first.invite_link.is_some());
        assert_eq!(second.invite_link, None);
        assert_eq!(p.groups(AccountId(1)).len(), 2);
        assert!(p.groups(AccountId(2)).is_empty());
    }

    #[tokio::test]
    async fn narrowed_capabilities_refuse_operations() {
        let p = MemoryPlatform::new();
        p.set_capabilities(PlatformCapabilities {
            checks_phones: false,
            ..PlatformCapabilities::USER
        });
        let h = p.connect(AccountId(1), &cred()).await.unwrap();

        assert!(matches!(
            p.is_registered(&h, "+15550001111").await,
            Err(Error::Unsupported(_))
        ));
        assert_eq!(p.phone_checks(), 0);
    }

    #[tokio::test]
    async fn calls_on_dead_handle_fail() {
        let p = MemoryPlatform::new();
        let h = p.connect(AccountId(1), &cred()).await.unwrap();
        p.disconnect(&h).await.unwrap();

        assert!(matches!(
            p.join_channel(&h, &chan("x")).await,
            Err(Error::Connection(_))
        ));
        assert!(p.subscribe_incoming(&h).await.is_err());
    }
}
