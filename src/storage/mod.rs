// Storage module - SQLite database operations
// 存储模块 - SQLite 数据库操作（平台连接表）

use async_trait::async_trait;
use rusqlite::{params, Connection, Result, Row};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::core::{
    ConnectionStatus, ConnectionStore, PlatformConnection, PlatformError, PlatformType,
};

/// Database manager for SQLite operations
/// 数据库管理器 - 统一存储所有平台连接
#[derive(Clone, Debug)]
pub struct DatabaseManager {
    /// Database file path
    pub db_path: PathBuf,
}

const SELECT_COLUMNS: &str =
    "id, org_id, platform, access_token, account_id, credentials, status";

impl DatabaseManager {
    /// Create a new database manager
    /// 创建新的数据库管理器
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    /// Get or create connection
    /// 获取或创建数据库连接
    fn get_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(&self.db_path)?;
        self.initialize_schema(&conn)?;
        Ok(conn)
    }

    /// Initialize database schema
    /// 初始化数据库模式
    fn initialize_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS platform_connections (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                access_token TEXT,
                account_id TEXT,
                credentials TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
        "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_connections_org_platform ON platform_connections (org_id, platform)",
            [],
        )?;

        Ok(())
    }

    // ============================================================================
    // 连接操作
    // ============================================================================

    /// Save (insert or replace) a connection
    /// 保存连接到数据库
    pub fn save_connection(&self, connection: &PlatformConnection) -> Result<(), rusqlite::Error> {
        let conn = self.get_connection()?;
        let credentials = Value::Object(connection.credentials.clone()).to_string();

        conn.execute(
            r#"
            INSERT OR REPLACE INTO platform_connections (
                id, org_id, platform, access_token, account_id, credentials, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
            params![
                connection.id,
                connection.org_id,
                connection.platform.as_str(),
                connection.access_token,
                connection.account_id,
                credentials,
                connection.status.as_str(),
            ],
        )?;

        Ok(())
    }

    /// Get connection by ID
    /// 根据 ID 获取连接
    pub fn get_connection_by_id(
        &self,
        connection_id: &str,
    ) -> Result<Option<PlatformConnection>, rusqlite::Error> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM platform_connections WHERE id = ?1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        match stmt.query_row([connection_id], Self::row_to_connection) {
            Ok(connection) => Ok(Some(connection)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get the active connection of an organization for a platform
    /// 获取组织在某平台上的有效连接
    pub fn get_active_connection(
        &self,
        org_id: &str,
        platform: PlatformType,
    ) -> Result<Option<PlatformConnection>, rusqlite::Error> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM platform_connections \
             WHERE org_id = ?1 AND platform = ?2 AND status = 'active' \
             ORDER BY created_at DESC, id ASC LIMIT 1",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        match stmt.query_row(params![org_id, platform.as_str()], Self::row_to_connection) {
            Ok(connection) => Ok(Some(connection)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get all connections
    /// 获取所有连接
    pub fn get_all_connections(&self) -> Result<Vec<PlatformConnection>, rusqlite::Error> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM platform_connections ORDER BY org_id, platform, id",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_connection)?;
        rows.collect()
    }

    /// Delete connection
    /// 删除连接
    pub fn delete_connection(&self, connection_id: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.get_connection()?;
        let affected = conn.execute(
            "DELETE FROM platform_connections WHERE id = ?1",
            [connection_id],
        )?;
        Ok(affected > 0)
    }

    // ============================================================================
    // 解析辅助
    // ============================================================================

    fn row_to_connection(row: &Row<'_>) -> Result<PlatformConnection> {
        let platform: String = row.get(2)?;
        let credentials: String = row.get(5)?;
        let status: String = row.get(6)?;
        Ok(PlatformConnection {
            id: row.get(0)?,
            org_id: row.get(1)?,
            platform: Self::parse_platform(&platform).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    format!("unknown platform '{}'", platform).into(),
                )
            })?,
            access_token: row.get(3)?,
            account_id: row.get(4)?,
            credentials: Self::parse_credentials(&credentials),
            status: Self::parse_status(&status),
        })
    }

    fn parse_platform(s: &str) -> Option<PlatformType> {
        PlatformType::parse(s)
    }

    fn parse_status(s: &str) -> ConnectionStatus {
        match s {
            "active" => ConnectionStatus::Active,
            _ => ConnectionStatus::Inactive,
        }
    }

    fn parse_credentials(s: &str) -> Map<String, Value> {
        match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[async_trait]
impl ConnectionStore for DatabaseManager {
    async fn find(&self, connection_id: &str) -> Result<Option<PlatformConnection>, PlatformError> {
        Ok(self.get_connection_by_id(connection_id)?)
    }

    async fn find_active(
        &self,
        org_id: &str,
        platform: PlatformType,
    ) -> Result<Option<PlatformConnection>, PlatformError> {
        Ok(self.get_active_connection(org_id, platform)?)
    }

    async fn save(&self, connection: &PlatformConnection) -> Result<(), PlatformError> {
        Ok(self.save_connection(connection)?)
    }

    async fn list(&self) -> Result<Vec<PlatformConnection>, PlatformError> {
        Ok(self.get_all_connections()?)
    }

    async fn delete(&self, connection_id: &str) -> Result<bool, PlatformError> {
        Ok(self.delete_connection(connection_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(id: &str, status: ConnectionStatus) -> PlatformConnection {
        let mut credentials = Map::new();
        credentials.insert("organization_id".into(), json!("urn:li:organization:9"));
        PlatformConnection {
            id: id.into(),
            org_id: "org-1".into(),
            platform: PlatformType::LinkedIn,
            access_token: Some("token".into()),
            account_id: Some("507".into()),
            credentials,
            status,
        }
    }

    #[test]
    fn test_save_and_load_connection() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("dispatch.db"));

        let conn = sample("c1", ConnectionStatus::Active);
        db.save_connection(&conn).unwrap();

        let loaded = db.get_connection_by_id("c1").unwrap().unwrap();
        assert_eq!(loaded, conn);
        assert!(db.get_connection_by_id("nope").unwrap().is_none());
    }

    #[test]
    fn test_active_lookup_skips_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("dispatch.db"));
        db.save_connection(&sample("old", ConnectionStatus::Inactive)).unwrap();

        assert!(db
            .get_active_connection("org-1", PlatformType::LinkedIn)
            .unwrap()
            .is_none());

        db.save_connection(&sample("new", ConnectionStatus::Active)).unwrap();
        let active = db
            .get_active_connection("org-1", PlatformType::LinkedIn)
            .unwrap()
            .unwrap();
        assert_eq!(active.id, "new");
    }

    #[tokio::test]
    async fn test_store_trait_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("nested").join("dispatch.db"));
        db.save(&sample("c1", ConnectionStatus::Active)).await.unwrap();
        assert_eq!(db.list().await.unwrap().len(), 1);
        assert!(db.delete("c1").await.unwrap());
        assert!(!db.delete("c1").await.unwrap());
    }
}
