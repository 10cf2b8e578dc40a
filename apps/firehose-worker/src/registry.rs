use crate::model::{now_millis, Tenant};
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;

const UNKNOWN_TENANT_NAME: &str = "Unknown";

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub tenant_id: String,
    pub display_name: Option<String>,
    pub api_key: Option<String>,
    pub active: Option<bool>,
}

/// Read-only projection of stored intent; says nothing about live connection health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    pub active: bool,
    pub name: String,
    pub credential_configured: bool,
}

#[derive(sqlx::FromRow)]
struct TenantRow {
    id: String,
    name: Option<String>,
    api_key: String,
    is_active: i64,
    last_seen: Option<i64>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id,
            display_name: row.name.unwrap_or_else(|| UNKNOWN_TENANT_NAME.to_string()),
            api_key: row.api_key,
            is_active: row.is_active != 0,
            last_seen: row.last_seen.unwrap_or(0),
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent upsert. A blank credential never replaces a stored one.
    pub async fn register(&self, registration: &Registration) -> Result<Tenant> {
        let tenant_id = registration.tenant_id.trim();
        anyhow::ensure!(!tenant_id.is_empty(), "tenant id is required");

        let display_name = registration
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let api_key = registration
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let active = registration.active.unwrap_or(true);

        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, api_key, is_active, last_seen)
            VALUES (?1, COALESCE(?2, ?6), COALESCE(?3, ''), ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(?2, tenants.name, ?6),
                api_key = COALESCE(?3, tenants.api_key),
                is_active = ?4,
                last_seen = ?5
            "#,
        )
        .bind(tenant_id)
        .bind(display_name)
        .bind(api_key)
        .bind(active)
        .bind(now_millis())
        .bind(UNKNOWN_TENANT_NAME)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to register tenant {tenant_id}"))?;

        let tenant = self
            .get(tenant_id)
            .await?
            .with_context(|| format!("tenant {tenant_id} missing after upsert"))?;
        if !tenant.has_credential() {
            tracing::warn!(tenant = %tenant.id, "tenant registered without an API key; it cannot stream");
        } else {
            tracing::info!(tenant = %tenant.id, active = tenant.is_active, "tenant registered");
        }
        Ok(tenant)
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(
            "SELECT id, name, api_key, is_active, last_seen FROM tenants WHERE id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load tenant")?;
        Ok(row.map(Tenant::from))
    }

    pub async fn list(&self) -> Result<Vec<Tenant>> {
        let rows: Vec<TenantRow> = sqlx::query_as(
            "SELECT id, name, api_key, is_active, last_seen FROM tenants ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list tenants")?;
        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    pub async fn list_active(&self) -> Result<Vec<Tenant>> {
        let rows: Vec<TenantRow> = sqlx::query_as(
            "SELECT id, name, api_key, is_active, last_seen FROM tenants WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active tenants")?;
        Ok(rows.into_iter().map(Tenant::from).collect())
    }

    pub async fn status(&self, tenant_id: &str) -> Result<TenantStatus> {
        Ok(match self.get(tenant_id).await? {
            Some(tenant) => TenantStatus {
                active: tenant.is_active,
                credential_configured: tenant.has_credential(),
                name: tenant.display_name,
            },
            None => TenantStatus {
                active: false,
                name: UNKNOWN_TENANT_NAME.to_string(),
                credential_configured: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn registration(id: &str, name: Option<&str>, key: Option<&str>) -> Registration {
        Registration {
            tenant_id: id.to_string(),
            display_name: name.map(str::to_string),
            api_key: key.map(str::to_string),
            active: None,
        }
    }

    #[tokio::test]
    async fn register_creates_active_tenant() {
        let (_dir, pool) = test_pool().await;
        let registry = Registry::new(pool);

        let tenant = registry
            .register(&registration("t1", Some("Acme"), Some("key-1")))
            .await
            .expect("register");
        assert_eq!(tenant.display_name, "Acme");
        assert_eq!(tenant.api_key, "key-1");
        assert!(tenant.is_active);
        assert!(tenant.last_seen > 0);

        let active = registry.list_active().await.expect("list");
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn empty_credential_never_erases_existing_key() {
        let (_dir, pool) = test_pool().await;
        let registry = Registry::new(pool);

        registry
            .register(&registration("t1", Some("Acme"), Some("key-1")))
            .await
            .expect("register");
        let tenant = registry
            .register(&registration("t1", Some("Acme Corp"), Some("  ")))
            .await
            .expect("re-register");
        assert_eq!(tenant.api_key, "key-1");
        assert_eq!(tenant.display_name, "Acme Corp");

        let tenant = registry
            .register(&registration("t1", None, None))
            .await
            .expect("re-register");
        assert_eq!(tenant.api_key, "key-1");
        assert_eq!(tenant.display_name, "Acme Corp");

        let tenant = registry
            .register(&registration("t1", None, Some("key-2")))
            .await
            .expect("rotate");
        assert_eq!(tenant.api_key, "key-2");
    }

    #[tokio::test]
    async fn deactivation_removes_tenant_from_active_set() {
        let (_dir, pool) = test_pool().await;
        let registry = Registry::new(pool);
        registry
            .register(&registration("t1", None, Some("k")))
            .await
            .expect("register");
        registry
            .register(&Registration {
                active: Some(false),
                ..registration("t1", None, None)
            })
            .await
            .expect("deactivate");

        assert!(registry.list_active().await.expect("list").is_empty());
        let status = registry.status("t1").await.expect("status");
        assert!(!status.active);
        assert!(status.credential_configured);
        assert_eq!(status.name, "Unknown");
    }

    #[tokio::test]
    async fn status_of_unknown_tenant_is_inactive() {
        let (_dir, pool) = test_pool().await;
        let registry = Registry::new(pool);
        let status = registry.status("missing").await.expect("status");
        assert_eq!(
            status,
            TenantStatus {
                active: false,
                name: "Unknown".to_string(),
                credential_configured: false,
            }
        );
    }

    #[tokio::test]
    async fn tenant_without_key_is_flagged_in_status() {
        let (_dir, pool) = test_pool().await;
        let registry = Registry::new(pool);
        registry
            .register(&registration("t2", Some("NoKey"), None))
            .await
            .expect("register");
        let status = registry.status("t2").await.expect("status");
        assert!(status.active);
        assert!(!status.credential_configured);
    }

    #[tokio::test]
    async fn blank_tenant_id_is_rejected() {
        let (_dir, pool) = test_pool().await;
        let registry = Registry::new(pool);
        assert!(registry.register(&registration("  ", None, None)).await.is_err());
    }
}
