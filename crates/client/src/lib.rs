//! Dynamic object CRUD against one cluster.
//!
//! Controllers address objects by `(namespace, name)` and never touch the
//! kube API surface directly; this wrapper fixes the error taxonomy they
//! reason about: not-found and conflict are signals, not failures.

#![forbid(unsafe_code)]

use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use serde_json::Value;

use flotilla_core::QualifiedName;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("server timeout: {0}")]
    Timeout(String),
    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    pub fn from_kube(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => ClientError::NotFound,
                409 => ClientError::Conflict(resp.message.clone()),
                408 | 429 | 504 => ClientError::Timeout(resp.message.clone()),
                _ => ClientError::Api(err),
            },
            _ => ClientError::Api(err),
        }
    }
}

/// Deletion propagation requested of the member API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    Foreground,
    Background,
    Orphan,
}

impl DeletePolicy {
    /// Parse the `kubefed.io/delete-options` JSON document.
    pub fn from_delete_options(opts: &Value) -> Option<Self> {
        match opts.get("propagationPolicy").and_then(Value::as_str) {
            Some("Foreground") => Some(Self::Foreground),
            Some("Background") => Some(Self::Background),
            Some("Orphan") => Some(Self::Orphan),
            Some(other) => {
                tracing::warn!(policy = %other, "unknown propagation policy in delete options");
                None
            }
            None => None,
        }
    }

    fn as_kube(self) -> PropagationPolicy {
        match self {
            Self::Foreground => PropagationPolicy::Foreground,
            Self::Background => PropagationPolicy::Background,
            Self::Orphan => PropagationPolicy::Orphan,
        }
    }
}

/// CRUD over one kind in one cluster, typed by an `ApiResource`.
#[derive(Clone)]
pub struct ResourceClient {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl ResourceClient {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced }
    }

    pub fn kind(&self) -> &str {
        &self.ar.kind
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.ar
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        if self.namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
                None => Api::all_with(self.client.clone(), &self.ar),
            }
        } else {
            Api::all_with(self.client.clone(), &self.ar)
        }
    }

    /// `Ok(None)` when the object does not exist.
    pub async fn get(&self, key: &QualifiedName) -> Result<Option<DynamicObject>, ClientError> {
        self.api(key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(ClientError::from_kube)
    }

    pub async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let ns = obj.metadata.namespace.clone();
        self.api(ns.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(ClientError::from_kube)
    }

    /// Full replace; the server rejects a stale `resourceVersion` with a
    /// conflict.
    pub async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let ns = obj.metadata.namespace.clone();
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.api(ns.as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(ClientError::from_kube)
    }

    pub async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let ns = obj.metadata.namespace.clone();
        let name = obj.metadata.name.clone().unwrap_or_default();
        let data = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
        self.api(ns.as_deref())
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(ClientError::from_kube)
    }

    pub async fn patch_merge(
        &self,
        key: &QualifiedName,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError> {
        self.api(key.namespace.as_deref())
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(ClientError::from_kube)
    }

    pub async fn patch_status_merge(
        &self,
        key: &QualifiedName,
        patch: &Value,
    ) -> Result<DynamicObject, ClientError> {
        self.api(key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(ClientError::from_kube)
    }

    /// Deleting an already-absent object succeeds.
    pub async fn delete(
        &self,
        key: &QualifiedName,
        policy: Option<DeletePolicy>,
    ) -> Result<(), ClientError> {
        let mut params = DeleteParams::default();
        if let Some(p) = policy {
            params.propagation_policy = Some(p.as_kube());
        }
        match self.api(key.namespace.as_deref()).delete(&key.name, &params).await {
            Ok(_) => Ok(()),
            Err(err) => match ClientError::from_kube(err) {
                ClientError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, ClientError> {
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(ClientError::from_kube)?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("code {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn classification_of_api_errors() {
        assert!(ClientError::from_kube(api_err(404)).is_not_found());
        assert!(ClientError::from_kube(api_err(409)).is_conflict());
        assert!(ClientError::from_kube(api_err(504)).is_timeout());
        assert!(matches!(ClientError::from_kube(api_err(500)), ClientError::Api(_)));
    }

    #[test]
    fn delete_policy_from_options() {
        let opts = serde_json::json!({"propagationPolicy": "Orphan"});
        assert_eq!(DeletePolicy::from_delete_options(&opts), Some(DeletePolicy::Orphan));
        let opts = serde_json::json!({"propagationPolicy": "Sideways"});
        assert_eq!(DeletePolicy::from_delete_options(&opts), None);
        assert_eq!(DeletePolicy::from_delete_options(&serde_json::json!({})), None);
    }
}
