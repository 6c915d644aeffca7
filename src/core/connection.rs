// Connection store seam and resolver
// 连接存储接口与连接解析

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ConnectionStatus, PlatformConnection, PlatformError, PlatformType};

/// Message returned for every unusable connection (missing, inactive, no token)
pub const INVALID_CONNECTION: &str = "Invalid connection or missing token";

/// Read/write access to stored platform connections
#[cfg_attr(any(test, feature = "test-export-mocks"), mockall::automock)]
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn find(&self, connection_id: &str) -> Result<Option<PlatformConnection>, PlatformError>;

    /// Active connection for an organization on a platform
    async fn find_active(
        &self,
        org_id: &str,
        platform: PlatformType,
    ) -> Result<Option<PlatformConnection>, PlatformError>;

    async fn save(&self, connection: &PlatformConnection) -> Result<(), PlatformError>;

    async fn list(&self) -> Result<Vec<PlatformConnection>, PlatformError>;

    async fn delete(&self, connection_id: &str) -> Result<bool, PlatformError>;
}

/// In-process store, used by tests and ad-hoc CLI runs
#[derive(Debug, Default)]
pub struct InMemoryConnectionStore {
    connections: RwLock<HashMap<String, PlatformConnection>>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(connections: impl IntoIterator<Item = PlatformConnection>) -> Self {
        let map = connections
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect::<HashMap<_, _>>();
        Self {
            connections: RwLock::new(map),
        }
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn find(&self, connection_id: &str) -> Result<Option<PlatformConnection>, PlatformError> {
        Ok(self.connections.read().await.get(connection_id).cloned())
    }

    async fn find_active(
        &self,
        org_id: &str,
        platform: PlatformType,
    ) -> Result<Option<PlatformConnection>, PlatformError> {
        let guard = self.connections.read().await;
        let mut matches: Vec<&PlatformConnection> = guard
            .values()
            .filter(|c| {
                c.org_id == org_id && c.platform == platform && c.status == ConnectionStatus::Active
            })
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches.first().map(|c| (*c).clone()))
    }

    async fn save(&self, connection: &PlatformConnection) -> Result<(), PlatformError> {
        self.connections
            .write()
            .await
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PlatformConnection>, PlatformError> {
        let mut all: Vec<_> = self.connections.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn delete(&self, connection_id: &str) -> Result<bool, PlatformError> {
        Ok(self.connections.write().await.remove(connection_id).is_some())
    }
}

/// Turns a connection id into a usable connection, or fails closed
#[derive(Clone)]
pub struct ConnectionResolver {
    store: Arc<dyn ConnectionStore>,
}

impl ConnectionResolver {
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    /// Only active connections with a non-blank token are returned
    pub async fn resolve(&self, connection_id: &str) -> Result<PlatformConnection, PlatformError> {
        let connection = match self.store.find(connection_id).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!("[Connection] lookup of {} failed: {}", connection_id, e);
                return Err(PlatformError::Connection(INVALID_CONNECTION.to_string()));
            }
        };
        match connection {
            Some(conn) if conn.is_usable() => Ok(conn),
            Some(conn) => {
                tracing::warn!(
                    "[Connection] {} is not usable (status={}, token_present={})",
                    connection_id,
                    conn.status.as_str(),
                    conn.token().is_some()
                );
                Err(PlatformError::Connection(INVALID_CONNECTION.to_string()))
            }
            None => {
                tracing::warn!("[Connection] {} not found", connection_id);
                Err(PlatformError::Connection(INVALID_CONNECTION.to_string()))
            }
        }
    }

    /// Active connection for org + platform; None when absent or tokenless
    pub async fn resolve_for_org(
        &self,
        org_id: &str,
        platform: PlatformType,
    ) -> Result<Option<PlatformConnection>, PlatformError> {
        let found = self.store.find_active(org_id, platform).await?;
        Ok(found.filter(PlatformConnection::is_usable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn conn(id: &str, token: Option<&str>, status: ConnectionStatus) -> PlatformConnection {
        PlatformConnection {
            id: id.into(),
            org_id: "org".into(),
            platform: PlatformType::Meta,
            access_token: token.map(str::to_string),
            account_id: Some("act_1".into()),
            credentials: Map::new(),
            status,
        }
    }

    #[tokio::test]
    async fn test_resolve_rejects_unusable_connections() {
        let store = InMemoryConnectionStore::with_connections([
            conn("ok", Some("tok"), ConnectionStatus::Active),
            conn("no-token", None, ConnectionStatus::Active),
            conn("inactive", Some("tok"), ConnectionStatus::Inactive),
        ]);
        let resolver = ConnectionResolver::new(Arc::new(store));

        assert_eq!(resolver.resolve("ok").await.unwrap().id, "ok");
        for id in ["no-token", "inactive", "missing"] {
            let err = resolver.resolve(id).await.unwrap_err();
            assert_eq!(err.to_string(), INVALID_CONNECTION);
        }
    }

    #[tokio::test]
    async fn test_resolve_uses_mock_store() {
        let mut store = MockConnectionStore::new();
        store
            .expect_find()
            .times(1)
            .returning(|_| Ok(None));
        let resolver = ConnectionResolver::new(Arc::new(store));
        assert!(resolver.resolve("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_fails_closed() {
        let mut store = MockConnectionStore::new();
        store
            .expect_find()
            .returning(|_| Err(PlatformError::Storage("database is locked".into())));
        let resolver = ConnectionResolver::new(Arc::new(store));
        let err = resolver.resolve("c1").await.unwrap_err();
        assert_eq!(err.to_string(), INVALID_CONNECTION);
    }

    #[tokio::test]
    async fn test_find_active_for_org() {
        let store = InMemoryConnectionStore::with_connections([
            conn("b", Some("tok"), ConnectionStatus::Active),
            conn("a", Some("tok"), ConnectionStatus::Inactive),
        ]);
        let found = store.find_active("org", PlatformType::Meta).await.unwrap();
        assert_eq!(found.unwrap().id, "b");
        assert!(store
            .find_active("org", PlatformType::Google)
            .await
            .unwrap()
            .is_none());
    }
}
