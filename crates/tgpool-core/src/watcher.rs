//! Login-code watcher.
//!
//! Lifecycle: `Idle -> Connecting -> Watching -> {CodeFound | TimedOut |
//! ConnectionError | Cancelled}`. Cancellation is accepted from any
//! non-terminal state. Exactly one terminal state is reached, and the
//! account's handle is released on every exit path after connecting.

use std::{sync::Arc, time::Duration};

use regex::{Regex, RegexBuilder};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DEFAULT_WATCH_TIMEOUT,
    domain::AccountId,
    errors::Error,
    manager::SessionManager,
    platform::types::IncomingMessage,
    Result,
};

/// Built-in login-code patterns, most specific first.
pub const DEFAULT_CODE_PATTERNS: &[&str] = &[
    r"Web login code:\s*([A-Za-z0-9]+)",
    r"Your login code:\s*([A-Za-z0-9]+)",
    r"login code:\s*([A-Za-z0-9]+)",
    r"login code\D*(\d+)",
];

/// Sender id of the platform's service notifications account.
pub const TELEGRAM_SERVICE_SENDER: &str = "777000";

/// Ordered, case-insensitive extraction patterns. Group 1 is the code.
#[derive(Clone, Debug)]
pub struct CodePatterns {
    patterns: Vec<Regex>,
}

impl CodePatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(Error::Pattern("at least one pattern is required".to_string()));
        }

        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            let p = p.as_ref();
            let re = RegexBuilder::new(p).case_insensitive(true).build()?;
            // captures_len counts the implicit whole-match group.
            if re.captures_len() < 2 {
                return Err(Error::Pattern(format!("{p:?} has no capture group")));
            }
            compiled.push(re);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn defaults() -> Result<Self> {
        Self::new(DEFAULT_CODE_PATTERNS)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First pattern (in order) whose group 1 matches: `(index, code)`.
    pub fn extract(&self, text: &str) -> Option<(usize, String)> {
        self.patterns.iter().enumerate().find_map(|(idx, re)| {
            re.captures(text)
                .and_then(|caps| caps.get(1))
                .filter(|m| !m.as_str().is_empty())
                .map(|m| (idx, m.as_str().to_string()))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Connecting,
    Watching,
    CodeFound,
    TimedOut,
    ConnectionError,
    Cancelled,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WatchState::CodeFound
                | WatchState::TimedOut
                | WatchState::ConnectionError
                | WatchState::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    Found { code: String, pattern_index: usize },
    TimedOut,
    ConnectionError(String),
    Cancelled,
}

impl WatchOutcome {
    pub fn state(&self) -> WatchState {
        match self {
            WatchOutcome::Found { .. } => WatchState::CodeFound,
            WatchOutcome::TimedOut => WatchState::TimedOut,
            WatchOutcome::ConnectionError(_) => WatchState::ConnectionError,
            WatchOutcome::Cancelled => WatchState::Cancelled,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeWatchResult {
    pub account: AccountId,
    pub outcome: WatchOutcome,
}

impl CodeWatchResult {
    pub fn code(&self) -> Option<&str> {
        match &self.outcome {
            WatchOutcome::Found { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn matched_pattern(&self) -> Option<usize> {
        match &self.outcome {
            WatchOutcome::Found { pattern_index, .. } => Some(*pattern_index),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WatchRequest {
    pub account: AccountId,
    pub patterns: CodePatterns,
    pub timeout: Duration,
    /// Only messages from this sender are considered.
    pub sender_filter: Option<String>,
}

impl WatchRequest {
    pub fn new(account: AccountId, patterns: CodePatterns) -> Self {
        Self {
            account,
            patterns,
            timeout: DEFAULT_WATCH_TIMEOUT,
            sender_filter: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn only_from(mut self, sender: impl Into<String>) -> Self {
        self.sender_filter = Some(sender.into());
        self
    }

    fn accepts(&self, msg: &IncomingMessage) -> bool {
        self.sender_filter
            .as_deref()
            .map_or(true, |sender| msg.sender == sender)
    }
}

/// Handle to a watch running in the background.
pub struct WatchTicket {
    account: AccountId,
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    task: JoinHandle<CodeWatchResult>,
}

impl WatchTicket {
    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    /// Request cancellation. No effect once a terminal state was reached.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> CodeWatchResult {
        match self.task.await {
            Ok(res) => res,
            Err(e) => CodeWatchResult {
                account: self.account,
                outcome: WatchOutcome::ConnectionError(format!("watch task failed: {e}")),
            },
        }
    }
}

pub struct CodeWatcher {
    manager: Arc<SessionManager>,
}

impl CodeWatcher {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Watch inline until a terminal state is reached.
    pub async fn watch(
        &self,
        request: WatchRequest,
        cancel: CancellationToken,
    ) -> CodeWatchResult {
        let (state, _rx) = watch::channel(WatchState::Idle);
        run_watch(self.manager.clone(), request, cancel, state).await
    }

    /// Watch in a background task.
    pub fn spawn(&self, request: WatchRequest) -> WatchTicket {
        let account = request.account;
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(WatchState::Idle);
        let task = tokio::spawn(run_watch(
            self.manager.clone(),
            request,
            cancel.clone(),
            tx,
        ));
        WatchTicket {
            account,
            cancel,
            state: rx,
            task,
        }
    }
}

async fn run_watch(
    manager: Arc<SessionManager>,
    request: WatchRequest,
    cancel: CancellationToken,
    state: watch::Sender<WatchState>,
) -> CodeWatchResult {
    let account = request.account;
    let finish = |outcome: WatchOutcome| {
        state.send_replace(outcome.state());
        info!(account = %account, state = ?outcome.state(), "code watch finished");
        CodeWatchResult { account, outcome }
    };

    if cancel.is_cancelled() {
        return finish(WatchOutcome::Cancelled);
    }

    state.send_replace(WatchState::Connecting);
    let acquired = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        res = manager.acquire(account) => Some(res),
    };
    let handle = match acquired {
        None => {
            // A connect already under way still lands in the cache; this waits
            // for it and tears it down.
            manager.release(account).await;
            return finish(WatchOutcome::Cancelled);
        }
        Some(Err(e)) => {
            warn!(account = %account, "code watch could not connect: {e}");
            return finish(WatchOutcome::ConnectionError(e.to_string()));
        }
        Some(Ok(handle)) => handle,
    };

    let subscribed = manager
        .timed(manager.client().subscribe_incoming(&handle))
        .await;
    let mut messages = match subscribed {
        Ok(sub) => sub,
        Err(e) => {
            manager.release_handle(&handle).await;
            return finish(WatchOutcome::ConnectionError(e.to_string()));
        }
    };

    state.send_replace(WatchState::Watching);
    debug!(account = %account, timeout = ?request.timeout, "watching for login code");

    let deadline = sleep(request.timeout);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break WatchOutcome::Cancelled,
            msg = messages.recv() => {
                let Some(msg) = msg else {
                    break WatchOutcome::ConnectionError("message stream ended".to_string());
                };
                if !request.accepts(&msg) {
                    debug!(account = %account, sender = %msg.sender, "ignoring message");
                    continue;
                }
                if let Some((pattern_index, code)) = request.patterns.extract(&msg.text) {
                    break WatchOutcome::Found { code, pattern_index };
                }
                debug!(account = %account, "message did not match any code pattern");
            }
            () = &mut deadline => break WatchOutcome::TimedOut,
        }
    };

    drop(messages);
    manager.release_handle(&handle).await;
    finish(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::Credential,
        platform::{
            memory::{ConnectBehavior, MemoryPlatform},
            port::PlatformClient,
        },
        store::SessionStore,
    };

    async fn setup() -> (CodeWatcher, Arc<MemoryPlatform>, AccountId) {
        setup_with(MemoryPlatform::new()).await
    }

    async fn setup_with(
        platform: MemoryPlatform,
    ) -> (CodeWatcher, Arc<MemoryPlatform>, AccountId) {
        let store = Arc::new(SessionStore::in_memory());
        let id = store
            .add("alice", Credential::new("1", "hash", "a.session"), "+15550001")
            .await
            .unwrap()
            .id;
        let platform = Arc::new(platform);
        let manager = Arc::new(SessionManager::new(store, platform.clone()));
        (CodeWatcher::new(manager), platform, id)
    }

    fn msg(text: &str) -> IncomingMessage {
        IncomingMessage::new(TELEGRAM_SERVICE_SENDER, text)
    }

    #[test]
    fn patterns_require_a_capture_group() {
        assert!(matches!(
            CodePatterns::new(&[r"login code: \d+"]),
            Err(Error::Pattern(_))
        ));
        assert!(matches!(CodePatterns::new(&["(unclosed"]), Err(Error::Pattern(_))));
        assert!(matches!(
            CodePatterns::new::<&str>(&[]),
            Err(Error::Pattern(_))
        ));
        assert_eq!(CodePatterns::defaults().unwrap().len(), DEFAULT_CODE_PATTERNS.len());
    }

    #[test]
    fn earlier_pattern_wins_on_same_message() {
        let p = CodePatterns::defaults().unwrap();
        assert_eq!(
            p.extract("Web login code: AB12cd. Do not give this code to anyone"),
            Some((0, "AB12cd".to_string()))
        );
        assert_eq!(
            p.extract("your LOGIN CODE: 55512"),
            Some((1, "55512".to_string()))
        );
        assert_eq!(p.extract("Login code: 80441"), Some((2, "80441".to_string())));
        assert_eq!(
            p.extract("Your code for login code entry is 7731"),
            Some((3, "7731".to_string()))
        );
        assert_eq!(p.extract("nothing to see"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn second_pattern_match_reports_its_index() {
        let (watcher, platform, id) = setup().await;
        platform.script_messages(
            id,
            [
                (Duration::from_secs(1), msg("welcome aboard")),
                (Duration::from_secs(1), msg("beta: 222")),
                (Duration::from_secs(1), msg("alpha: 111")),
            ],
        );
        let patterns = CodePatterns::new(&[r"alpha:\s*(\d+)", r"beta:\s*(\d+)"]).unwrap();
        let req = WatchRequest::new(id, patterns).with_timeout(Duration::from_secs(60));

        let res = watcher.watch(req, CancellationToken::new()).await;

        assert_eq!(
            res.outcome,
            WatchOutcome::Found {
                code: "222".to_string(),
                pattern_index: 1
            }
        );
        assert_eq!(res.code(), Some("222"));
        assert_eq!(res.matched_pattern(), Some(1));
        assert_eq!(platform.disconnects(id), 1);
        assert_eq!(platform.live_handles(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_disconnects_once() {
        let (watcher, platform, id) = setup().await;
        let req = WatchRequest::new(id, CodePatterns::defaults().unwrap())
            .with_timeout(Duration::from_secs(5));

        let res = watcher.watch(req, CancellationToken::new()).await;

        assert_eq!(res.outcome, WatchOutcome::TimedOut);
        assert_eq!(platform.disconnects(id), 1);
        assert_eq!(platform.live_handles(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_watching() {
        let (watcher, platform, id) = setup().await;
        let ticket = watcher.spawn(
            WatchRequest::new(id, CodePatterns::defaults().unwrap())
                .with_timeout(Duration::from_secs(600)),
        );

        let mut states = ticket.subscribe_state();
        states
            .wait_for(|s| *s == WatchState::Watching)
            .await
            .unwrap();
        ticket.cancel();

        let res = ticket.join().await;
        assert_eq!(res.outcome, WatchOutcome::Cancelled);
        assert_eq!(*states.borrow(), WatchState::Cancelled);
        assert_eq!(platform.disconnects(id), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_connects() {
        let (watcher, platform, id) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = watcher
            .watch(WatchRequest::new(id, CodePatterns::defaults().unwrap()), cancel)
            .await;

        assert_eq!(res.outcome, WatchOutcome::Cancelled);
        assert_eq!(platform.connects(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_connecting_leaves_nothing_connected() {
        let (watcher, platform, id) =
            setup_with(MemoryPlatform::with_latency(Duration::from_millis(50))).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            // Connected, authorization check still pending.
            sleep(Duration::from_millis(75)).await;
            trigger.cancel();
        });

        let res = watcher
            .watch(WatchRequest::new(id, CodePatterns::defaults().unwrap()), cancel)
            .await;

        assert_eq!(res.outcome, WatchOutcome::Cancelled);
        assert_eq!(platform.connects(id), 1);
        assert_eq!(platform.disconnects(id), 1);
        assert_eq!(platform.live_handles(id), 0);
    }

    #[tokio::test]
    async fn finished_watch_leaves_a_newer_handle_alone() {
        let (watcher, platform, id) = setup().await;
        let ticket = watcher.spawn(
            WatchRequest::new(id, CodePatterns::defaults().unwrap())
                .with_timeout(Duration::from_secs(600)),
        );
        let mut states = ticket.subscribe_state();
        states
            .wait_for(|s| *s == WatchState::Watching)
            .await
            .unwrap();

        // The watch handle dies and another task reconnects the account.
        let old = watcher.manager().acquire(id).await.unwrap();
        platform.disconnect(&old).await.unwrap();
        let fresh = watcher.manager().acquire(id).await.unwrap();

        let res = ticket.join().await;
        assert!(matches!(res.outcome, WatchOutcome::ConnectionError(_)));
        assert!(platform.is_alive(&fresh));
        assert_eq!(platform.live_handles(id), 1);
    }

    #[tokio::test]
    async fn auth_failure_is_a_connection_error() {
        let (watcher, platform, id) = setup().await;
        platform.set_connect(id, ConnectBehavior::Unauthorized);

        let res = watcher
            .watch(
                WatchRequest::new(id, CodePatterns::defaults().unwrap()),
                CancellationToken::new(),
            )
            .await;

        match res.outcome {
            WatchOutcome::ConnectionError(msg) => assert!(msg.contains("authorization"), "{msg}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(platform.live_handles(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_filter_ignores_other_senders() {
        let (watcher, platform, id) = setup().await;
        platform.script_messages(
            id,
            [
                (
                    Duration::from_secs(1),
                    IncomingMessage::new("12345", "Login code: 11111"),
                ),
                (Duration::from_secs(1), msg("Login code: 22222")),
            ],
        );
        let req = WatchRequest::new(id, CodePatterns::defaults().unwrap())
            .with_timeout(Duration::from_secs(30))
            .only_from(TELEGRAM_SERVICE_SENDER);

        let res = watcher.watch(req, CancellationToken::new()).await;
        assert_eq!(res.code(), Some("22222"));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_ending_is_a_connection_error() {
        let (watcher, platform, id) = setup().await;
        let ticket = watcher.spawn(
            WatchRequest::new(id, CodePatterns::defaults().unwrap())
                .with_timeout(Duration::from_secs(600)),
        );
        let mut states = ticket.subscribe_state();
        states
            .wait_for(|s| *s == WatchState::Watching)
            .await
            .unwrap();

        // Connection dropped underneath the watcher.
        let handle = watcher.manager().acquire(id).await.unwrap();
        platform.disconnect(&handle).await.unwrap();

        let res = ticket.join().await;
        assert!(matches!(res.outcome, WatchOutcome::ConnectionError(_)));
        assert_eq!(platform.live_handles(id), 0);
    }
}
