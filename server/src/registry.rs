//! In-memory directory of registered accounts and online users.
//!
//! The two maps here are the only data touched by more than one session
//! task. Every access goes through a lock-guarded method; no lock is ever
//! held across a network call. Relaying to another session clones that
//! session's channel sender under the lock and sends after release.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tracing::debug;

use protocol::Command;

/// Handle for pushing relayed commands into another client's session.
pub type RelayTx = Sender<Command>;

pub type SharedRegistry = Arc<Registry>;

/// Registered account. Created on sign-up, immutable, lives for the
/// server process (no persistence by design).
#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub password: String,
}

/// One currently signed-in client. The `visible` and `busy` flags are
/// stored but not enforced anywhere yet.
pub struct OnlineUser {
    pub username: String,
    pub visible: bool,
    pub busy: bool,
    pub relay_tx: RelayTx,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted,
    UsernameTaken,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    AlreadyOnline,
    Rejected,
}

pub struct Registry {
    accounts: Mutex<HashMap<String, Account>>,
    // Vec rather than a map so listings come out in sign-in order
    online: Mutex<Vec<OnlineUser>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            accounts: Mutex::new(HashMap::new()),
            online: Mutex::new(Vec::new()),
        }
    }

    /// Claim a username. Exactly one of any set of concurrent callers for
    /// the same name wins; the rest get `UsernameTaken`.
    pub async fn register(&self, username: &str, password: &str) -> RegisterOutcome {
        let mut accounts = self.accounts.lock().await;

        if accounts.contains_key(username) {
            return RegisterOutcome::UsernameTaken;
        }

        accounts.insert(username.to_owned(), Account {
            username: username.to_owned(),
            password: password.to_owned(),
        });

        RegisterOutcome::Accepted
    }

    /// Check credentials for sign-in. The already-online check comes before
    /// the credential check, matching the reply the client expects.
    /// `Accepted` here is provisional; `attach` is the final arbiter of the
    /// one-session-per-username invariant.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome {
        {
            let online = self.online.lock().await;
            if online.iter().any(|u| u.username == username) {
                return AuthOutcome::AlreadyOnline;
            }
        }

        let accounts = self.accounts.lock().await;
        match accounts.get(username) {
            Some(account) if account.password == password => AuthOutcome::Accepted,
            _ => AuthOutcome::Rejected,
        }
    }

    /// Mark a user online. Returns false if another session claimed the
    /// username in the window since `authenticate`; the loser must be
    /// given a definitive reject, never a stale accept.
    pub async fn attach(&self, user: OnlineUser) -> bool {
        let mut online = self.online.lock().await;

        if online.iter().any(|u| u.username == user.username) {
            return false;
        }

        online.push(user);
        true
    }

    /// All online usernames in sign-in order, invisible users included.
    /// Visibility filtering is a presentation concern, not done here.
    pub async fn list_online(&self) -> Vec<String> {
        let online = self.online.lock().await;
        online.iter().map(|u| u.username.clone()).collect()
    }

    pub async fn lookup(&self, username: &str) -> Option<RelayTx> {
        let online = self.online.lock().await;
        online.iter()
            .find(|u| u.username == username)
            .map(|u| u.relay_tx.clone())
    }

    /// Idempotent; removing an absent name is a no-op.
    pub async fn remove(&self, username: &str) {
        let mut online = self.online.lock().await;
        let before = online.len();
        online.retain(|u| u.username != username);

        if online.len() < before {
            debug!("removed {} from online set", username);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn user(name: &str) -> OnlineUser {
        let (relay_tx, _relay_rx) = mpsc::channel(8);
        OnlineUser {
            username: name.to_owned(),
            visible: true,
            busy: false,
            relay_tx,
        }
    }

    #[tokio::test]
    async fn duplicate_registration_single_winner() {
        let registry = Arc::new(Registry::new());

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.register("alice", "pw").await }),
            tokio::spawn(async move { r2.register("alice", "pw2").await }),
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter()
                   .filter(|o| **o == RegisterOutcome::Accepted).count(), 1);
        assert_eq!(outcomes.iter()
                   .filter(|o| **o == RegisterOutcome::UsernameTaken).count(), 1);
    }

    #[tokio::test]
    async fn sign_in_while_online_is_already_online() {
        let registry = Registry::new();
        registry.register("alice", "pw").await;
        assert!(registry.attach(user("alice")).await);

        assert_eq!(registry.authenticate("alice", "pw").await, AuthOutcome::AlreadyOnline);
        assert_eq!(registry.list_online().await, vec!["alice".to_owned()]);
    }

    #[tokio::test]
    async fn bad_credentials_rejected() {
        let registry = Registry::new();
        registry.register("alice", "pw").await;

        assert_eq!(registry.authenticate("alice", "wrong").await, AuthOutcome::Rejected);
        assert_eq!(registry.authenticate("nobody", "pw").await, AuthOutcome::Rejected);
        assert_eq!(registry.authenticate("alice", "pw").await, AuthOutcome::Accepted);
    }

    #[tokio::test]
    async fn attach_refuses_second_session() {
        let registry = Registry::new();
        assert!(registry.attach(user("alice")).await);
        assert!(!registry.attach(user("alice")).await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new();
        registry.attach(user("alice")).await;

        registry.remove("alice").await;
        let once = registry.list_online().await;
        registry.remove("alice").await;

        assert_eq!(once, registry.list_online().await);
        assert!(once.is_empty());
    }

    #[tokio::test]
    async fn listing_preserves_sign_in_order() {
        let registry = Registry::new();
        for name in ["carol", "alice", "bob"] {
            registry.attach(user(name)).await;
        }

        assert_eq!(registry.list_online().await,
                   vec!["carol".to_owned(), "alice".to_owned(), "bob".to_owned()]);
    }

    #[tokio::test]
    async fn lookup_finds_only_online_users() {
        let registry = Registry::new();
        registry.attach(user("alice")).await;

        assert!(registry.lookup("alice").await.is_some());
        assert!(registry.lookup("bob").await.is_none());

        registry.remove("alice").await;
        assert!(registry.lookup("alice").await.is_none());
    }
}
