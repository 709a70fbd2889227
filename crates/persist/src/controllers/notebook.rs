use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info, warn};

use super::dispatcher::{Handler, ObjectKey};
use crate::convert;
use crate::convert::notebook::USER_NAME_LABEL;
use crate::crd::Notebook;
use crate::store::ObjectStorageBackend;
use crate::tenant::UserDirectory;
use crate::Result;

pub const KIND: &str = "Notebook";
const KUBECONFIG_ENV: &str = "BASE64CONFIG";

/// Name of the first user in the kubeconfig handed to the notebook's first
/// init container.
pub fn kubeconfig_user(notebook: &Notebook) -> Option<String> {
    let init = notebook.spec.template.spec.init_containers.as_ref()?.first()?;
    let encoded = init
        .env
        .iter()
        .flatten()
        .find(|e| e.name == KUBECONFIG_ENV)
        .and_then(|e| e.value.as_deref())
        .filter(|v| !v.is_empty())?;

    let raw = match STANDARD.decode(encoded) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("Notebook kubeconfig is not base64: {}", e);
            return None;
        }
    };
    let document: serde_yaml::Value = match serde_yaml::from_slice(&raw) {
        Ok(document) => document,
        Err(e) => {
            debug!("Notebook kubeconfig is not YAML: {}", e);
            return None;
        }
    };

    document
        .get("users")?
        .get(0)?
        .get("name")?
        .as_str()
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

pub struct NotebookHandler {
    store: Arc<dyn ObjectStorageBackend>,
    users: Arc<dyn UserDirectory>,
}

impl NotebookHandler {
    pub fn new(store: Arc<dyn ObjectStorageBackend>, users: Arc<dyn UserDirectory>) -> Self {
        Self { store, users }
    }

    /// Console user owning the notebook. Lookup failures are not fatal.
    async fn owner(&self, notebook: &Notebook) -> Option<String> {
        let account = kubeconfig_user(notebook)?;
        match self.users.user_name(&account).await {
            Ok(user) => user,
            Err(e) => {
                warn!("Failed to look up user {}: {}", account, e);
                None
            }
        }
    }
}

#[async_trait]
impl Handler for NotebookHandler {
    type Object = Notebook;

    fn kind(&self) -> &str {
        KIND
    }

    fn composite_keys(&self) -> bool {
        false
    }

    async fn sync(&self, key: &ObjectKey, live: Option<Notebook>) -> Result<()> {
        let Some(mut notebook) = live else {
            info!("Notebook {}/{} deleted", key.namespace, key.name);
            return self.store.delete_notebook(&key.namespace, &key.name).await;
        };

        if let Some(user) = self.owner(&notebook).await {
            notebook
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(USER_NAME_LABEL.to_string(), user);
        }

        let record = convert::notebook::convert(&notebook)?;
        self.store.write_notebook(record).await
    }
}
