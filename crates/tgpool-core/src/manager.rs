//! Live connection cache over the session store.
//!
//! At most one live handle exists per account. Concurrent `acquire` calls for
//! the same account are serialized on a per-account slot lock, so only the
//! first caller connects and the rest reuse its handle.
//!
//! Platform calls made while refreshing a slot run in a detached task that
//! owns the slot lock. A caller that is cancelled mid-connect therefore never
//! strands a handle outside the cache: the task finishes, caches the handle
//! (or disconnects it on failure), and the next `release`/`shutdown` sees it.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast::error::RecvError, Mutex, OwnedMutexGuard},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DEFAULT_CALL_TIMEOUT,
    domain::{normalize_phone, AccountId, AccountStatus, ChannelRef, Credential},
    errors::Error,
    platform::{
        port::PlatformClient,
        types::{CreatedGroup, GroupSpec, Handle, PlatformCapabilities},
    },
    pool::run_bounded,
    store::SessionStore,
    Result,
};

type Slot = Arc<Mutex<Option<Handle>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AcquireMode {
    /// Regular use: accounts already known to need a login are refused.
    Use,
    /// Status check: always talks to the platform and re-checks authorization.
    Verify,
}

/// Everything a detached slot refresh needs.
#[derive(Clone)]
struct Link {
    client: Arc<dyn PlatformClient>,
    call_timeout: Duration,
}

impl Link {
    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(self.call_timeout)),
        }
    }

    /// Reuse or replace the slot's handle. Runs with the slot lock held, and
    /// leaves the slot either holding a live authorized handle or empty.
    async fn refresh(
        self,
        id: AccountId,
        credential: Credential,
        mut cached: OwnedMutexGuard<Option<Handle>>,
    ) -> Result<Handle> {
        if let Some(handle) = cached.take() {
            if self.client.is_alive(&handle) && self.ensure_authorized(&handle).await.is_ok() {
                *cached = Some(handle.clone());
                return Ok(handle);
            }
            debug!(account = %id, handle = %handle.id, "cached handle is stale, reconnecting");
            self.disconnect_quietly(&handle).await;
        }

        let handle = self.timed(self.client.connect(id, &credential)).await?;
        self.ensure_authorized(&handle).await?;

        info!(account = %id, handle = %handle.id, "connected");
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Disconnects the handle on any failure.
    async fn ensure_authorized(&self, handle: &Handle) -> Result<()> {
        match self.timed(self.client.is_authorized(handle)).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.disconnect_quietly(handle).await;
                Err(Error::AuthRequired(handle.account))
            }
            Err(e) => {
                self.disconnect_quietly(handle).await;
                Err(e)
            }
        }
    }

    async fn disconnect_quietly(&self, handle: &Handle) {
        if let Err(e) = self.timed(self.client.disconnect(handle)).await {
            warn!(account = %handle.account, handle = %handle.id, "disconnect failed: {e}");
        }
    }
}

pub struct SessionManager {
    store: Arc<SessionStore>,
    link: Link,
    slots: Mutex<HashMap<AccountId, Slot>>,
}

impl SessionManager {
    pub fn new(store: Arc<SessionStore>, client: Arc<dyn PlatformClient>) -> Self {
        Self {
            store,
            link: Link {
                client,
                call_timeout: DEFAULT_CALL_TIMEOUT,
            },
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Bound applied to every single platform call.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.link.call_timeout = call_timeout;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<dyn PlatformClient> {
        &self.link.client
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        self.link.client.capabilities()
    }

    pub fn call_timeout(&self) -> Duration {
        self.link.call_timeout
    }

    /// Run one platform call under the configured timeout.
    pub async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.link.timed(fut).await
    }

    /// Slot for a registered account. Unknown ids never get an entry.
    async fn slot(&self, id: AccountId) -> Result<Slot> {
        if let Some(slot) = self.existing_slot(id).await {
            return Ok(slot);
        }
        if !self.store.contains(id).await {
            return Err(Error::NotFound(id));
        }
        let mut slots = self.slots.lock().await;
        Ok(slots
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone())
    }

    async fn existing_slot(&self, id: AccountId) -> Option<Slot> {
        self.slots.lock().await.get(&id).cloned()
    }

    /// Drop the slot entry if it is still `slot`.
    async fn discard_slot(&self, id: AccountId, slot: &Slot) {
        let mut slots = self.slots.lock().await;
        if slots.get(&id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&id);
        }
    }

    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Return a live, authorized handle for the account, connecting if needed.
    ///
    /// Errors: `NotFound` for unknown accounts, `AuthRequired` when the account
    /// needs an interactive login, and whatever the platform reports otherwise.
    /// Failed acquires leave nothing cached. Dropping the returned future
    /// mid-connect leaves the new handle cached for `release` to find.
    pub async fn acquire(&self, id: AccountId) -> Result<Handle> {
        self.acquire_with(id, AcquireMode::Use).await
    }

    async fn acquire_with(&self, id: AccountId, mode: AcquireMode) -> Result<Handle> {
        let slot = self.slot(id).await?;
        let mut cached = slot.clone().lock_owned().await;

        // Checked under the slot lock so a removal that already happened is
        // never papered over by a stale cached handle.
        let account = match self.store.get(id).await {
            Ok(account) => account,
            Err(e) => {
                let stale = cached.take();
                drop(cached);
                self.discard_slot(id, &slot).await;
                if let Some(handle) = stale {
                    self.link.disconnect_quietly(&handle).await;
                }
                return Err(e);
            }
        };
        if mode == AcquireMode::Use {
            if account.status == AccountStatus::AuthRequired {
                return Err(Error::AuthRequired(id));
            }
            if let Some(handle) = &*cached {
                if self.link.client.is_alive(handle) {
                    return Ok(handle.clone());
                }
            }
        }

        let refresh = tokio::spawn(self.link.clone().refresh(id, account.credential, cached));
        match refresh.await {
            Ok(res) => res,
            Err(e) => Err(Error::External(format!(
                "connect task for account {id} failed: {e}"
            ))),
        }
    }

    /// Disconnect and drop the cached handle, if any. No-op otherwise.
    pub async fn release(&self, id: AccountId) {
        let Some(slot) = self.existing_slot(id).await else {
            return;
        };
        let handle = slot.lock().await.take();
        if let Some(handle) = handle {
            self.link.disconnect_quietly(&handle).await;
            info!(account = %id, handle = %handle.id, "released");
        }
    }

    /// Disconnect `handle` and evict it from the cache only if it is still the
    /// cached one. A newer handle cached by another task survives.
    pub async fn release_handle(&self, handle: &Handle) {
        let id = handle.account;
        let mut evicted = false;
        if let Some(slot) = self.existing_slot(id).await {
            let mut cached = slot.lock().await;
            if matches!(&*cached, Some(c) if c.id == handle.id) {
                *cached = None;
                evicted = true;
            }
        }
        self.link.disconnect_quietly(handle).await;
        if evicted {
            info!(account = %id, handle = %handle.id, "released");
        } else {
            debug!(account = %id, handle = %handle.id, "released stale handle");
        }
    }

    /// Release the account and forget its slot entirely.
    async fn forget(&self, id: AccountId) {
        self.release(id).await;
        self.slots.lock().await.remove(&id);
    }

    /// Release every cached handle.
    pub async fn shutdown(&self) {
        let ids: Vec<AccountId> = self.slots.lock().await.keys().copied().collect();
        for id in ids {
            self.forget(id).await;
        }
    }

    /// Remove the account from the store and tear down its handle.
    pub async fn remove_account(&self, id: AccountId) -> Result<()> {
        self.store.remove(id).await?;
        self.forget(id).await;
        Ok(())
    }

    /// Tear down handles for accounts removed directly through the store.
    pub fn spawn_removal_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut removals = self.store.subscribe_removals();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    msg = removals.recv() => match msg {
                        Ok(id) => manager.forget(id).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "removal notifications lagged, sweeping slots");
                            manager.sweep_removed().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    async fn sweep_removed(&self) {
        let ids: Vec<AccountId> = self.slots.lock().await.keys().copied().collect();
        for id in ids {
            if !self.store.contains(id).await {
                self.forget(id).await;
            }
        }
    }

    /// Connect and record the account's observed status in the store.
    ///
    /// A fresh check always supersedes the stored status, including
    /// `AuthRequired`.
    pub async fn probe_status(&self, id: AccountId) -> Result<AccountStatus> {
        let status = match self.acquire_with(id, AcquireMode::Verify).await {
            Ok(_) => AccountStatus::Active,
            Err(Error::NotFound(id)) => return Err(Error::NotFound(id)),
            Err(Error::AuthRequired(_)) => AccountStatus::AuthRequired,
            Err(Error::Deactivated(_)) => AccountStatus::Inactive,
            Err(e) => {
                warn!(account = %id, "status check failed: {e}");
                AccountStatus::Error
            }
        };
        self.store.update_status(id, status).await?;
        info!(account = %id, %status, "status updated");
        Ok(status)
    }

    /// Check many accounts with at most `workers` checks in flight.
    ///
    /// Results come back in completion order.
    pub async fn probe_many(
        self: &Arc<Self>,
        ids: Vec<AccountId>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Vec<(AccountId, Result<AccountStatus>)> {
        let manager = self.clone();
        let out = run_bounded(ids, workers, cancel, move |id| {
            let manager = manager.clone();
            async move { (id, manager.probe_status(id).await) }
        })
        .await;
        if out.cancelled {
            warn!(completed = out.results.len(), "status batch cancelled");
        }
        out.results
    }

    /// Run one call on the account's connection. Transport failures evict the
    /// handle the call used.
    async fn with_handle<T, F, Fut>(&self, id: AccountId, call: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn PlatformClient>, Handle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire(id).await?;
        let res = self
            .timed(call(self.link.client.clone(), handle.clone()))
            .await;
        if let Err(e @ (Error::Connection(_) | Error::Timeout(_))) = &res {
            debug!(account = %id, handle = %handle.id, "dropping handle after failed call: {e}");
            self.release_handle(&handle).await;
        }
        res
    }

    /// Export an invite link for `channel` using the account's connection.
    pub async fn export_invite_link(&self, id: AccountId, channel: &ChannelRef) -> Result<String> {
        self.with_handle(id, |client, handle| async move {
            client.export_invite_link(&handle, channel).await
        })
        .await
    }

    /// Create a supergroup owned by the account.
    pub async fn create_group(&self, id: AccountId, spec: &GroupSpec) -> Result<CreatedGroup> {
        if !self.capabilities().creates_groups {
            return Err(Error::Unsupported("group creation".to_string()));
        }
        let group = self
            .with_handle(id, |client, handle| async move {
                client.create_group(&handle, spec).await
            })
            .await?;
        info!(account = %id, group = group.id, title = %group.title, "group created");
        Ok(group)
    }

    /// Whether `phone` belongs to a registered platform user.
    pub async fn check_phone(&self, id: AccountId, phone: &str) -> Result<bool> {
        if !self.capabilities().checks_phones {
            return Err(Error::Unsupported("phone registration check".to_string()));
        }
        let phone = normalize_phone(phone)?;
        self.with_handle(id, |client, handle| async move {
            client.is_registered(&handle, &phone).await
        })
        .await
    }

    /// Check phones one after another on one account.
    ///
    /// A rate-limited check is reported as such, and the next one starts only
    /// after the requested wait.
    pub async fn check_phones(
        &self,
        id: AccountId,
        phones: &[String],
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<bool>)> {
        let mut out = Vec::with_capacity(phones.len());
        for phone in phones {
            if cancel.is_cancelled() {
                break;
            }
            let res = self.check_phone(id, phone).await;
            let wait = res.as_ref().err().and_then(Error::retry_after);
            out.push((phone.clone(), res));
            if let Some(wait) = wait {
                warn!(account = %id, wait_secs = wait.as_secs(), "phone checks rate limited");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = sleep(wait) => {}
                }
            }
        }
        out
    }
}
