//! Per-user API clients.
//!
//! A tenant acts through the ServiceAccount recorded on its `User` object.
//! Kubeconfigs built for a tenant are persisted under the configured
//! directory, so a restart does not need to rebuild them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::crd::user::USER_NAMESPACE;
use crate::crd::User;
use crate::metrics;
use crate::{Error, Result};

const CLUSTER_NAME: &str = "default-cluster";
const CONTEXT_NAME: &str = "default-context";

/// Lookup of console users by the name of their `User` object.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `spec.userName` of the User object called `name`, if it exists.
    async fn user_name(&self, name: &str) -> Result<Option<String>>;
}

pub struct ClusterUsers {
    client: Client,
}

impl ClusterUsers {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UserDirectory for ClusterUsers {
    async fn user_name(&self, name: &str) -> Result<Option<String>> {
        let users: Api<User> = Api::namespaced(self.client.clone(), USER_NAMESPACE);
        Ok(users
            .get_opt(name)
            .await?
            .map(|u| u.spec.user_name)
            .filter(|n| !n.is_empty()))
    }
}

/// Credentials and coordinates needed to reach the cluster as a tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantAccess {
    pub server: String,
    pub ca: Vec<u8>,
    pub token: String,
    pub service_account: String,
    pub namespace: String,
}

/// Kubeconfig document with a single cluster, context and user.
pub fn build_kubeconfig(access: &TenantAccess) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": CLUSTER_NAME,
            "cluster": {
                "server": access.server,
                "certificate-authority-data": STANDARD.encode(&access.ca),
            }
        }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": {
                "cluster": CLUSTER_NAME,
                "namespace": access.namespace,
                "user": access.service_account,
            }
        }],
        "users": [{
            "name": access.service_account,
            "user": { "token": access.token }
        }],
        "current-context": CONTEXT_NAME,
    })
}

fn kubeconfig_path(dir: &Path, user: &str) -> Result<PathBuf> {
    if user.is_empty() || user.contains('/') || user.starts_with('.') {
        return Err(Error::Validation(format!("invalid user name {:?}", user)));
    }
    Ok(dir.join(user))
}

async fn read_kubeconfig(dir: &Path, user: &str) -> Result<Option<Kubeconfig>> {
    let path = kubeconfig_path(dir, user)?;
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match Kubeconfig::from_yaml(&text) {
        Ok(kc) => Ok(Some(kc)),
        Err(e) => {
            warn!("Ignoring unreadable kubeconfig {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

async fn write_kubeconfig(dir: &Path, user: &str, document: &Value) -> Result<()> {
    let path = kubeconfig_path(dir, user)?;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, serde_yaml::to_string(document)?).await?;
    info!("Saved kubeconfig of {} to {}", user, path.display());
    Ok(())
}

/// Clients keyed by console user name.
pub struct ClientCache {
    client: Client,
    kubeconfig_dir: PathBuf,
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientCache {
    pub fn new(client: Client, kubeconfig_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            kubeconfig_dir: kubeconfig_dir.into(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, user: &str) -> Option<Client> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user)
            .cloned()
    }

    pub async fn client_for_user(&self, user: &str) -> Result<Client> {
        if let Some(client) = self.cached(user) {
            return Ok(client);
        }
        metrics::record_tenant_cache_miss();

        let kubeconfig = match read_kubeconfig(&self.kubeconfig_dir, user).await? {
            Some(kc) => {
                debug!("Using persisted kubeconfig of {}", user);
                kc
            }
            None => {
                let access = self.resolve_access(user).await?;
                let document = build_kubeconfig(&access);
                write_kubeconfig(&self.kubeconfig_dir, user, &document).await?;
                serde_json::from_value::<Kubeconfig>(document)?
            }
        };

        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::Config(format!("kubeconfig of {}: {}", user, e)))?;
        let client = Client::try_from(config)?;

        // A concurrent miss for the same user may have won; either client is valid.
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.to_string(), client.clone());
        Ok(client)
    }

    /// Forgets the client of `user` and its persisted kubeconfig.
    pub async fn evict(&self, user: &str) -> Result<()> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user);
        let path = kubeconfig_path(&self.kubeconfig_dir, user)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_access(&self, user: &str) -> Result<TenantAccess> {
        let users: Api<User> = Api::namespaced(self.client.clone(), USER_NAMESPACE);
        let found = users
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .find(|u| u.spec.user_name == user)
            .ok_or_else(|| Error::UserNotProvisioned(format!("{} has no User object", user)))?;

        let account = found.spec.k8s_service_account;
        let accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &account.namespace);
        let secret_name = accounts
            .get_opt(&account.name)
            .await?
            .and_then(|sa| sa.secrets)
            .and_then(|secrets| secrets.into_iter().next())
            .and_then(|r| r.name)
            .ok_or_else(|| {
                Error::UserNotProvisioned(format!(
                    "service account {}/{} of {} has no token secret",
                    account.namespace, account.name, user
                ))
            })?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &account.namespace);
        let data = secrets.get(&secret_name).await?.data.unwrap_or_default();
        let token = data
            .get("token")
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .ok_or_else(|| {
                Error::UserNotProvisioned(format!("secret {} has no token", secret_name))
            })?;
        let ca = data.get("ca.crt").map(|b| b.0.clone()).unwrap_or_default();

        let services: Api<Service> = Api::namespaced(self.client.clone(), "default");
        let spec = services.get("kubernetes").await?.spec.unwrap_or_default();
        let port = spec.ports.unwrap_or_default().into_iter().next();
        let scheme = port
            .as_ref()
            .and_then(|p| p.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "https".to_string());
        let server = format!(
            "{}://{}:{}",
            scheme,
            spec.cluster_ip.unwrap_or_default(),
            port.map_or(443, |p| p.port)
        );

        let namespace = account
            .role_bindings
            .first()
            .map(|rb| rb.namespace.clone())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| account.namespace.clone());

        Ok(TenantAccess {
            server,
            ca,
            token,
            service_account: account.name,
            namespace,
        })
    }
}
