use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};

use super::{is_controlled_by, Object, ObjectStore, Owner, Propagation, StoreError};

/// [`ObjectStore`] backed by the cluster API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// The whole object as a status update body. Its resourceVersion makes the
/// write fail with a conflict when the object changed since it was read, and
/// fields left out of the status are cleared on the server.
fn status_replacement<K: Object>(object: &K) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(object).map_err(StoreError::Serialization)
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 404 => StoreError::NotFound,
            kube::Error::Api(response) if response.code == 409 => {
                if response.reason == "AlreadyExists" {
                    StoreError::AlreadyExists
                } else {
                    StoreError::Conflict
                }
            }
            _ => StoreError::Api(error),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        Ok(self.api::<K>(namespace).get(name).await?)
    }

    async fn list_owned<K: Object>(
        &self,
        namespace: &str,
        owner: Owner<'_>,
    ) -> Result<Vec<K>, StoreError> {
        Ok(self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await?
            .into_iter()
            .filter(|object| is_controlled_by(object.meta(), owner))
            .collect())
    }

    async fn create<K: Object>(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        Ok(self
            .api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let namespace = object.namespace().unwrap_or_default();
        Ok(self
            .api::<K>(&namespace)
            .replace_status(
                &object.name_any(),
                &PostParams::default(),
                status_replacement(object)?,
            )
            .await?)
    }

    async fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<(), StoreError> {
        let params = match propagation {
            Propagation::Default => DeleteParams::default(),
            Propagation::Background => DeleteParams::background(),
        };
        self.api::<K>(namespace).delete(name, &params).await?;
        Ok(())
    }
}
