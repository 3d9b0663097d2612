//! VPN end-user accounts and the per-protocol access matrix

use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials;
use crate::error::{VpnError, VpnResult};
use crate::model::{Protocol, ProtocolAccess, VpnUser};
use crate::store::Store;
use crate::validation::{validate_email, validate_username};

/// Aggregate account counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub total: usize,
    pub enabled: usize,
    /// Accounts with a connection in the last 24 hours
    pub connected_24h: usize,
}

pub struct UserManager {
    store: Arc<dyn Store>,
    hash_cost: u32,
}

impl UserManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            hash_cost: credentials::DEFAULT_COST,
        }
    }

    /// Override the bcrypt cost for new hashes
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Create an enabled account with access to no protocol
    pub async fn create_user(&self, username: &str, email: &str, password: &str) -> VpnResult<VpnUser> {
        validate_username(username)?;
        validate_email(email)?;
        credentials::validate_password(password)?;

        if self.store.get_user_by_username(username).await?.is_some() {
            return Err(VpnError::Conflict(format!("User '{}' already exists", username)));
        }

        let user = VpnUser {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: credentials::hash_password(password, self.hash_cost)?,
            enabled: true,
            last_connection: None,
            created_at: Utc::now(),
        };
        self.store.insert_user(&user).await?;

        for protocol in Protocol::ALL {
            let row = ProtocolAccess {
                user_id: user.id.clone(),
                protocol,
                enabled: false,
            };
            if let Err(e) = self.store.upsert_access(&row).await {
                warn!("Rolling back user '{}': {}", username, e);
                if let Err(cleanup) = self.store.delete_user(&user.id).await {
                    warn!("Failed to remove partial user '{}': {}", username, cleanup);
                }
                return Err(e);
            }
        }

        info!("Created VPN user '{}' ({})", user.username, user.id);
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> VpnResult<VpnUser> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| VpnError::NotFound(format!("User {}", id)))
    }

    pub async fn get_user_by_username(&self, username: &str) -> VpnResult<VpnUser> {
        self.store
            .get_user_by_username(username)
            .await?
            .ok_or_else(|| VpnError::NotFound(format!("User '{}'", username)))
    }

    pub async fn list_users(&self) -> VpnResult<Vec<VpnUser>> {
        self.store.list_users().await
    }

    /// Case-insensitive substring match on username and email
    pub async fn search_users(&self, query: &str) -> VpnResult<Vec<VpnUser>> {
        let needle = query.to_lowercase();
        Ok(self
            .store
            .list_users()
            .await?
            .into_iter()
            .filter(|u| u.username.to_lowercase().contains(&needle) || u.email.to_lowercase().contains(&needle))
            .collect())
    }

    pub async fn set_user_enabled(&self, id: &str, enabled: bool) -> VpnResult<VpnUser> {
        let mut user = self.get_user(id).await?;
        user.enabled = enabled;
        self.store.update_user(&user).await?;
        info!("User '{}' {}", user.username, if enabled { "enabled" } else { "disabled" });
        Ok(user)
    }

    pub async fn update_email(&self, id: &str, email: &str) -> VpnResult<VpnUser> {
        validate_email(email)?;
        let mut user = self.get_user(id).await?;
        user.email = email.to_string();
        self.store.update_user(&user).await?;
        Ok(user)
    }

    pub async fn update_password(&self, id: &str, password: &str) -> VpnResult<()> {
        credentials::validate_password(password)?;
        let mut user = self.get_user(id).await?;
        user.password_hash = credentials::hash_password(password, self.hash_cost)?;
        self.store.update_user(&user).await
    }

    /// Check credentials. Unknown users, wrong passwords and disabled
    /// accounts are all `Unauthorized`.
    pub async fn verify_password(&self, username: &str, password: &str) -> VpnResult<VpnUser> {
        let Some(user) = self.store.get_user_by_username(username).await? else {
            return Err(VpnError::Unauthorized("Invalid username or password".to_string()));
        };
        if !credentials::verify_password(password, &user.password_hash)? {
            return Err(VpnError::Unauthorized("Invalid username or password".to_string()));
        }
        if !user.enabled {
            return Err(VpnError::Unauthorized(format!("User '{}' is disabled", username)));
        }
        Ok(user)
    }

    /// Upsert the given protocols; protocols without a row get one set to false
    pub async fn update_protocol_access(&self, user_id: &str, access: &BTreeMap<Protocol, bool>) -> VpnResult<()> {
        self.get_user(user_id).await?;
        let existing = self.get_protocol_access(user_id).await?;

        for protocol in Protocol::ALL {
            let enabled = match access.get(&protocol) {
                Some(enabled) => *enabled,
                None if existing.contains_key(&protocol) => continue,
                None => false,
            };
            self.store
                .upsert_access(&ProtocolAccess {
                    user_id: user_id.to_string(),
                    protocol,
                    enabled,
                })
                .await?;
        }
        Ok(())
    }

    /// Every protocol with a row for this user
    pub async fn get_protocol_access(&self, user_id: &str) -> VpnResult<BTreeMap<Protocol, bool>> {
        Ok(self
            .store
            .list_access(user_id)
            .await?
            .into_iter()
            .map(|row| (row.protocol, row.enabled))
            .collect())
    }

    /// A missing row means no access
    pub async fn has_protocol_access(&self, user_id: &str, protocol: Protocol) -> VpnResult<bool> {
        Ok(self
            .store
            .get_access(user_id, protocol)
            .await?
            .map(|row| row.enabled)
            .unwrap_or(false))
    }

    pub async fn update_last_connection(&self, id: &str) -> VpnResult<()> {
        let mut user = self.get_user(id).await?;
        user.last_connection = Some(Utc::now());
        self.store.update_user(&user).await
    }

    /// Remove the account and its access rows. Peers owned by the user are
    /// the caller's business.
    pub async fn delete_user(&self, id: &str) -> VpnResult<()> {
        if !self.store.delete_user(id).await? {
            return Err(VpnError::NotFound(format!("User {}", id)));
        }
        info!("Deleted VPN user {}", id);
        Ok(())
    }

    pub async fn user_stats(&self) -> VpnResult<UserStats> {
        let users = self.store.list_users().await?;
        let since = Utc::now() - Duration::hours(24);
        Ok(UserStats {
            total: users.len(),
            enabled: users.iter().filter(|u| u.enabled).count(),
            connected_24h: users
                .iter()
                .filter(|u| u.last_connection.map_or(false, |t| t > since))
                .count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> UserManager {
        UserManager::new(Arc::new(MemoryStore::new())).with_hash_cost(4)
    }

    #[tokio::test]
    async fn test_new_user_has_no_access() {
        let users = manager();
        let user = users.create_user("alice", "alice@example.com", "hunter2hunter2").await.unwrap();
        assert!(user.enabled);

        let access = users.get_protocol_access(&user.id).await.unwrap();
        assert_eq!(access.len(), 4);
        assert!(access.values().all(|enabled| !enabled));
        for protocol in Protocol::ALL {
            assert!(!users.has_protocol_access(&user.id, protocol).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let users = manager();
        users.create_user("alice", "a@example.com", "password1").await.unwrap();
        let err = users.create_user("alice", "b@example.com", "password2").await.unwrap_err();
        assert!(matches!(err, VpnError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let users = manager();
        assert!(users.create_user("bad name", "a@example.com", "password1").await.is_err());
        assert!(users.create_user("bob", "not-an-email", "password1").await.is_err());
        assert!(users.create_user("bob", "bob@example.com", "short").await.is_err());
        assert!(users.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_password() {
        let users = manager();
        let user = users.create_user("carol", "carol@example.com", "s3cret-pass").await.unwrap();

        assert_eq!(users.verify_password("carol", "s3cret-pass").await.unwrap().id, user.id);
        assert!(matches!(
            users.verify_password("carol", "wrong-pass").await.unwrap_err(),
            VpnError::Unauthorized(_)
        ));
        assert!(matches!(
            users.verify_password("nobody", "s3cret-pass").await.unwrap_err(),
            VpnError::Unauthorized(_)
        ));

        users.set_user_enabled(&user.id, false).await.unwrap();
        assert!(matches!(
            users.verify_password("carol", "s3cret-pass").await.unwrap_err(),
            VpnError::Unauthorized(_)
        ));

        users.set_user_enabled(&user.id, true).await.unwrap();
        users.update_password(&user.id, "new-password").await.unwrap();
        assert!(users.verify_password("carol", "s3cret-pass").await.is_err());
        assert!(users.verify_password("carol", "new-password").await.is_ok());
    }

    #[tokio::test]
    async fn test_update_protocol_access() {
        let store = Arc::new(MemoryStore::new());
        let users = UserManager::new(store.clone()).with_hash_cost(4);
        let user = users.create_user("dave", "dave@example.com", "password1").await.unwrap();

        let mut grant = BTreeMap::new();
        grant.insert(Protocol::WireGuard, true);
        users.update_protocol_access(&user.id, &grant).await.unwrap();
        assert!(users.has_protocol_access(&user.id, Protocol::WireGuard).await.unwrap());
        assert!(!users.has_protocol_access(&user.id, Protocol::OpenVpn).await.unwrap());

        // Unlisted protocols keep their current value
        grant.clear();
        grant.insert(Protocol::Pptp, true);
        users.update_protocol_access(&user.id, &grant).await.unwrap();
        assert!(users.has_protocol_access(&user.id, Protocol::WireGuard).await.unwrap());
        assert!(users.has_protocol_access(&user.id, Protocol::Pptp).await.unwrap());
        assert_eq!(store.list_access(&user.id).await.unwrap().len(), 4);

        assert!(matches!(
            users.update_protocol_access("missing", &grant).await.unwrap_err(),
            VpnError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_access_rows_are_filled() {
        let store = Arc::new(MemoryStore::new());
        let users = UserManager::new(store.clone()).with_hash_cost(4);
        let user = crate::store::fixtures::user("u-legacy", "legacy");
        store.insert_user(&user).await.unwrap();

        let mut grant = BTreeMap::new();
        grant.insert(Protocol::L2tp, true);
        users.update_protocol_access(&user.id, &grant).await.unwrap();

        let access = users.get_protocol_access(&user.id).await.unwrap();
        assert_eq!(access.len(), 4);
        assert_eq!(access.get(&Protocol::L2tp), Some(&true));
        assert_eq!(access.get(&Protocol::WireGuard), Some(&false));
    }

    #[tokio::test]
    async fn test_stats_and_delete() {
        let users = manager();
        let a = users.create_user("erin", "erin@example.com", "password1").await.unwrap();
        let b = users.create_user("frank", "frank@example.com", "password1").await.unwrap();
        users.set_user_enabled(&b.id, false).await.unwrap();
        users.update_last_connection(&a.id).await.unwrap();

        let stats = users.user_stats().await.unwrap();
        assert_eq!(stats, UserStats { total: 2, enabled: 1, connected_24h: 1 });

        assert_eq!(users.search_users("FRA").await.unwrap().len(), 1);

        users.delete_user(&b.id).await.unwrap();
        assert!(matches!(users.delete_user(&b.id).await.unwrap_err(), VpnError::NotFound(_)));
        assert!(users.get_protocol_access(&b.id).await.unwrap().is_empty());
    }
}
