//! Vault-backed credential retrieval.
//!
//! AppRole login plus KV v2 reads. Connection setup treats every failure
//! here as non-fatal: the config layer falls back to plain environment
//! variables when Vault is unreachable or the secrets are missing.

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use serde_json::Value;
use tracing::info;

const DEFAULT_DB_SECRET_PATH: &str = "secret/data/deployment-tracker/int/default/database";
const DEFAULT_S3_SECRET_PATH: &str = "secret/data/deployment-tracker/int/default/s3";

#[derive(Debug, Clone)]
pub struct DatabaseCredentials {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl DatabaseCredentials {
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStoreCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: String,
}

impl VaultClient {
    /// Authenticate with AppRole and return a ready client.
    pub async fn approle_login(addr: &str, role_id: &str, secret_id: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("build vault http client")?;
        let url = format!("{}/v1/auth/approle/login", addr.trim_end_matches('/'));
        let body = serde_json::json!({ "role_id": role_id, "secret_id": secret_id });
        let resp = http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("vault approle login request")?
            .error_for_status()
            .context("vault approle login rejected")?;
        let doc: Value = resp.json().await.context("vault approle login body")?;
        let token = doc["auth"]["client_token"]
            .as_str()
            .ok_or_else(|| anyhow!("vault login response missing auth.client_token"))?
            .to_string();
        info!("authenticated with vault via approle");
        Ok(Self { http, addr: addr.trim_end_matches('/').to_string(), token })
    }

    async fn read_kv(&self, path: &str) -> anyhow::Result<HashMap<String, String>> {
        let url = format!("{}/v1/{}", self.addr, path.trim_start_matches('/'));
        let resp = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("vault read {path}"))?
            .error_for_status()
            .with_context(|| format!("vault read {path} rejected"))?;
        let doc: Value = resp.json().await.context("vault secret body")?;
        let data = doc["data"]["data"]
            .as_object()
            .ok_or_else(|| anyhow!("vault secret at {path} has no data.data object"))?;
        Ok(data
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect())
    }

    pub async fn database_credentials(&self) -> anyhow::Result<DatabaseCredentials> {
        let path = std::env::var("DT_VAULT_DB_PATH")
            .unwrap_or_else(|_| DEFAULT_DB_SECRET_PATH.to_string());
        let map = self.read_kv(&path).await?;
        let get = |k: &str| {
            map.get(k)
                .cloned()
                .ok_or_else(|| anyhow!("vault database secret missing {k}"))
        };
        Ok(DatabaseCredentials {
            user: get("PGUSER")?,
            password: get("PGPASSWORD")?,
            host: get("PGHOST")?,
            port: map
                .get("PGPORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5432),
            database: get("PGDATABASE")?,
        })
    }

    pub async fn object_store_credentials(&self) -> anyhow::Result<ObjectStoreCredentials> {
        let path = std::env::var("DT_VAULT_S3_PATH")
            .unwrap_or_else(|_| DEFAULT_S3_SECRET_PATH.to_string());
        let map = self.read_kv(&path).await?;
        let get = |k: &str| {
            map.get(k)
                .cloned()
                .ok_or_else(|| anyhow!("vault object-store secret missing {k}"))
        };
        Ok(ObjectStoreCredentials {
            access_key: get("S3_ACCESS_KEY")?,
            secret_key: get("S3_SECRET_KEY")?,
            endpoint: map.get("S3_ENDPOINT").cloned(),
            region: map.get("S3_REGION").cloned(),
        })
    }
}
