//! Durable account registry.
//!
//! Mutations are applied to a copy of the registry, persisted, and only then
//! swapped in under a short write lock. Readers never see a half-written record
//! and never wait on disk I/O.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    domain::{Account, AccountId, AccountRecord, AccountStatus, Credential},
    errors::Error,
    Result,
};

const REMOVAL_CHANNEL_CAPACITY: usize = 64;

/// On-disk registry document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    next_id: u64,
    accounts: Vec<AccountRecord>,
}

#[derive(Clone, Debug)]
struct Registry {
    next_id: u64,
    accounts: Vec<Account>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            next_id: 1,
            accounts: Vec::new(),
        }
    }
}

impl Registry {
    fn position(&self, id: AccountId) -> Option<usize> {
        self.accounts.iter().position(|a| a.id == id)
    }

    fn get_mut(&mut self, id: AccountId) -> Result<&mut Account> {
        self.accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(Error::NotFound(id))
    }

    fn push(&mut self, account: Account) -> Result<()> {
        if self.position(account.id).is_some() {
            return Err(Error::Duplicate(account.id));
        }
        self.next_id = self.next_id.max(account.id.0 + 1);
        self.accounts.push(account);
        Ok(())
    }

    fn from_file(file: RegistryFile) -> Result<Self> {
        let mut reg = Registry {
            next_id: file.next_id.max(1),
            accounts: Vec::with_capacity(file.accounts.len()),
        };
        for rec in file.accounts {
            reg.push(rec.into())?;
        }
        Ok(reg)
    }

    fn to_file(&self) -> RegistryFile {
        RegistryFile {
            next_id: self.next_id,
            accounts: self.accounts.iter().cloned().map(Into::into).collect(),
        }
    }
}

/// Registry of managed accounts, optionally backed by a JSON file.
pub struct SessionStore {
    path: Option<PathBuf>,
    state: RwLock<Registry>,
    writer: Mutex<()>,
    removals: broadcast::Sender<AccountId>,
}

impl SessionStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_registry(None, Registry::default())
    }

    /// Open (or lazily create) the registry at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let registry = match load_registry_file(&path)? {
            Some(file) => Registry::from_file(file)?,
            None => Registry::default(),
        };
        info!(
            path = %path.display(),
            accounts = registry.accounts.len(),
            "opened account registry"
        );
        Ok(Self::with_registry(Some(path), registry))
    }

    fn with_registry(path: Option<PathBuf>, registry: Registry) -> Self {
        let (removals, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        Self {
            path,
            state: RwLock::new(registry),
            writer: Mutex::new(()),
            removals,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create a new account with a fresh id and `Unknown` status.
    ///
    /// Phone numbers are not required to be unique.
    pub async fn add(
        &self,
        name: &str,
        credential: Credential,
        phone_number: &str,
    ) -> Result<Account> {
        credential.validate()?;
        let account = self
            .mutate(|reg| {
                let account = Account {
                    id: AccountId(reg.next_id),
                    name: name.to_string(),
                    phone_number: phone_number.to_string(),
                    credential,
                    status: AccountStatus::Unknown,
                };
                reg.push(account.clone())?;
                Ok(account)
            })
            .await?;
        info!(account = %account.id, name = %account.name, "account added");
        Ok(account)
    }

    /// Re-create an account from an exported record, keeping its id and status.
    pub async fn insert_record(&self, record: AccountRecord) -> Result<Account> {
        record.credential.validate()?;
        let account: Account = record.into();
        let out = account.clone();
        self.mutate(move |reg| reg.push(account)).await?;
        debug!(account = %out.id, "account imported");
        Ok(out)
    }

    /// Remove an account. Subscribers of [`SessionStore::subscribe_removals`]
    /// are notified so live handles can be torn down.
    pub async fn remove(&self, id: AccountId) -> Result<()> {
        self.mutate(|reg| {
            let idx = reg.position(id).ok_or(Error::NotFound(id))?;
            reg.accounts.remove(idx);
            Ok(())
        })
        .await?;
        // No subscribers is fine.
        let _ = self.removals.send(id);
        info!(account = %id, "account removed");
        Ok(())
    }

    pub async fn update_name(&self, id: AccountId, name: &str) -> Result<()> {
        self.mutate(|reg| {
            reg.get_mut(id)?.name = name.to_string();
            Ok(())
        })
        .await
    }

    pub async fn update_status(&self, id: AccountId, status: AccountStatus) -> Result<()> {
        self.mutate(|reg| {
            reg.get_mut(id)?.status = status;
            Ok(())
        })
        .await?;
        debug!(account = %id, %status, "status updated");
        Ok(())
    }

    pub async fn get(&self, id: AccountId) -> Result<Account> {
        let st = self.state.read().await;
        st.accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    pub async fn contains(&self, id: AccountId) -> bool {
        self.state.read().await.position(id).is_some()
    }

    /// All accounts in insertion order.
    pub async fn list(&self) -> Vec<Account> {
        self.state.read().await.accounts.clone()
    }

    /// Secondary lookup used by operator front-ends that only show name + phone.
    pub async fn find_by_name_and_phone(&self, name: &str, phone_number: &str) -> Option<Account> {
        let st = self.state.read().await;
        st.accounts
            .iter()
            .find(|a| a.name == name && a.phone_number == phone_number)
            .cloned()
    }

    pub fn subscribe_removals(&self) -> broadcast::Receiver<AccountId> {
        self.removals.subscribe()
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let _writer = self.writer.lock().await;

        let mut next = self.state.read().await.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            save_registry_file(path, &next.to_file())?;
        }

        *self.state.write().await = next;
        Ok(out)
    }
}

fn load_registry_file(path: &Path) -> Result<Option<RegistryFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    let data: RegistryFile = serde_json::from_str(&txt)?;
    Ok(Some(data))
}

fn save_registry_file(path: &Path, data: &RegistryFile) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let txt = serde_json::to_string_pretty(data)?;

    // Write-then-rename so a crash never leaves a truncated registry behind.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, txt)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn tmp_registry(prefix: &str) -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let n = SEQ.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        std::env::temp_dir().join(format!("tgpool-{prefix}-{pid}-{n}/sessions.json"))
    }

    fn cred(n: u32) -> Credential {
        Credential::new(format!("{n}"), "hash", format!("acc{n}.session"))
    }

    #[tokio::test]
    async fn add_then_get_returns_input_with_unknown_status() {
        let store = SessionStore::in_memory();
        let added = store.add("alice", cred(1), "+15550001").await.unwrap();

        let got = store.get(added.id).await.unwrap();
        assert_eq!(got.name, "alice");
        assert_eq!(got.phone_number, "+15550001");
        assert_eq!(got.credential, cred(1));
        assert_eq!(got.status, AccountStatus::Unknown);
        assert_eq!(got, added);
    }

    #[tokio::test]
    async fn add_rejects_malformed_credential() {
        let store = SessionStore::in_memory();
        let err = store
            .add("bad", Credential::new("abc", "hash", "s"), "+1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn ids_are_never_reused_after_removal() {
        let store = SessionStore::in_memory();
        let a = store.add("a", cred(1), "+1").await.unwrap();
        let b = store.add("b", cred(2), "+2").await.unwrap();
        store.remove(b.id).await.unwrap();

        let c = store.add("c", cred(3), "+3").await.unwrap();
        assert_ne!(c.id, a.id);
        assert_ne!(c.id, b.id);
        assert!(c.id > b.id);
    }

    #[tokio::test]
    async fn list_keeps_insertion_order_and_allows_shared_phone() {
        let store = SessionStore::in_memory();
        for name in ["z", "a", "m"] {
            store.add(name, cred(1), "+15550000").await.unwrap();
        }
        let names: Vec<_> = store.list().await.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[tokio::test]
    async fn mutations_on_missing_id_fail_with_not_found() {
        let store = SessionStore::in_memory();
        let missing = AccountId(42);
        assert!(matches!(store.get(missing).await, Err(Error::NotFound(id)) if id == missing));
        assert!(matches!(store.remove(missing).await, Err(Error::NotFound(_))));
        assert!(matches!(
            store.update_name(missing, "x").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.update_status(missing, AccountStatus::Active).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_name_and_status() {
        let store = SessionStore::in_memory();
        let a = store.add("old", cred(1), "+1").await.unwrap();
        store.update_name(a.id, "new").await.unwrap();
        store
            .update_status(a.id, AccountStatus::AuthRequired)
            .await
            .unwrap();

        let got = store.get(a.id).await.unwrap();
        assert_eq!(got.name, "new");
        assert_eq!(got.status, AccountStatus::AuthRequired);
        assert_eq!(got.id, a.id);
    }

    #[tokio::test]
    async fn remove_then_get_fails() {
        let store = SessionStore::in_memory();
        let a = store.add("a", cred(1), "+1").await.unwrap();
        store.remove(a.id).await.unwrap();
        assert!(matches!(store.get(a.id).await, Err(Error::NotFound(_))));
        assert!(!store.contains(a.id).await);
    }

    #[tokio::test]
    async fn remove_is_broadcast() {
        let store = SessionStore::in_memory();
        let mut rx = store.subscribe_removals();
        let a = store.add("a", cred(1), "+1").await.unwrap();
        store.remove(a.id).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), a.id);
    }

    #[tokio::test]
    async fn insert_record_keeps_id_and_rejects_duplicates() {
        let store = SessionStore::in_memory();
        let rec = AccountRecord {
            id: AccountId(10),
            name: "imported".to_string(),
            phone_number: "+9".to_string(),
            credential: cred(9),
            status: AccountStatus::Active,
        };
        let acc = store.insert_record(rec.clone()).await.unwrap();
        assert_eq!(acc.id, AccountId(10));
        assert_eq!(acc.status, AccountStatus::Active);

        let err = store.insert_record(rec).await.unwrap_err();
        assert!(matches!(err, Error::Duplicate(AccountId(10))));

        // Fresh ids continue past imported ones.
        let next = store.add("n", cred(1), "+1").await.unwrap();
        assert_eq!(next.id, AccountId(11));
    }

    #[tokio::test]
    async fn find_by_name_and_phone() {
        let store = SessionStore::in_memory();
        store.add("a", cred(1), "+1").await.unwrap();
        let b = store.add("a", cred(2), "+2").await.unwrap();

        let found = store.find_by_name_and_phone("a", "+2").await.unwrap();
        assert_eq!(found.id, b.id);
        assert!(store.find_by_name_and_phone("a", "+3").await.is_none());
    }

    #[tokio::test]
    async fn registry_persists_across_reopen() {
        let path = tmp_registry("persist");
        let removed;
        {
            let store = SessionStore::open(&path).unwrap();
            let a = store.add("a", cred(1), "+1").await.unwrap();
            let b = store.add("b", cred(2), "+2").await.unwrap();
            store.update_status(a.id, AccountStatus::Active).await.unwrap();
            store.remove(b.id).await.unwrap();
            removed = b.id;
        }

        let store = SessionStore::open(&path).unwrap();
        let all = store.list().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "a");
        assert_eq!(all[0].status, AccountStatus::Active);

        // The id counter survives the restart too.
        let c = store.add("c", cred(3), "+3").await.unwrap();
        assert!(c.id > removed);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn open_missing_file_yields_empty_registry() {
        let path = tmp_registry("missing");
        let store = SessionStore::open(&path).unwrap();
        assert!(store.list().await.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn concurrent_updates_leave_consistent_records() {
        let store = Arc::new(SessionStore::in_memory());
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(store.add(&format!("acc{i}"), cred(i), "+1").await.unwrap().id);
        }

        let mut tasks = Vec::new();
        for (i, id) in ids.iter().copied().enumerate() {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..10 {
                    store
                        .update_name(id, &format!("acc{i}-r{round}"))
                        .await
                        .unwrap();
                    let _ = store.list().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        for (i, id) in ids.iter().enumerate() {
            assert_eq!(store.get(*id).await.unwrap().name, format!("acc{i}-r9"));
        }
    }
}
