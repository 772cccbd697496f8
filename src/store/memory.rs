//! In-memory [`ObjectStore`] used by the controller tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::Value;

use super::{is_controlled_by, Object, ObjectStore, Owner, Propagation, StoreError};
use crate::clock::Clock;

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    created: Vec<(String, String)>,
    deleted: Vec<(String, String)>,
    status_writes: usize,
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

fn key<K: Object>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn decode<K: Object>(value: &Value) -> K {
    serde_json::from_value(value.clone()).expect("stored objects decode")
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Stores `object` as-is, overwriting whatever was there. Stands in for
    /// other actors (kubelet, job controller, users) changing the cluster.
    pub fn put<K: Object>(&self, object: K) -> K {
        let mut state = self.state.lock().unwrap();
        let mut object = object;
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        state.next_version += 1;
        let meta = object.meta_mut();
        meta.resource_version = Some(state.next_version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", state.next_version));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(self.clock.now()));
        }
        let value = serde_json::to_value(&object).expect("objects encode");
        state.objects.insert(key::<K>(&namespace, &name), value);
        object
    }

    pub fn fetch<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state.objects.get(&key::<K>(namespace, name)).map(decode)
    }

    pub fn all<K: Object>(&self, namespace: &str) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Names of every object of kind `K` ever created through the store.
    pub fn created<K: Object>(&self) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock().unwrap();
        state
            .created
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn deleted<K: Object>(&self) -> Vec<String> {
        let kind = K::kind(&()).to_string();
        let state = self.state.lock().unwrap();
        state
            .deleted
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.fetch(namespace, name).ok_or(StoreError::NotFound)
    }

    async fn list_owned<K: Object>(
        &self,
        namespace: &str,
        owner: Owner<'_>,
    ) -> Result<Vec<K>, StoreError> {
        Ok(self
            .all::<K>(namespace)
            .into_iter()
            .filter(|object| is_controlled_by(object.meta(), owner))
            .collect())
    }

    async fn create<K: Object>(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        let name = object.name_any();
        {
            let mut state = self.state.lock().unwrap();
            if state.objects.contains_key(&key::<K>(namespace, &name)) {
                return Err(StoreError::AlreadyExists);
            }
            state.created.push((K::kind(&()).to_string(), name));
        }
        let mut object = object.clone();
        object.meta_mut().namespace = Some(namespace.to_string());
        object.meta_mut().uid = None;
        object.meta_mut().creation_timestamp = None;
        Ok(self.put(object))
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K, StoreError> {
        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let mut value = {
            let mut state = self.state.lock().unwrap();
            let current = state
                .objects
                .get(&key::<K>(&namespace, &name))
                .ok_or(StoreError::NotFound)?
                .clone();
            if current["metadata"]["resourceVersion"].as_str()
                != object.resource_version().as_deref()
            {
                return Err(StoreError::Conflict);
            }
            state.status_writes += 1;
            current
        };
        let update = serde_json::to_value(object).map_err(StoreError::Serialization)?;
        value["status"] = update["status"].clone();
        let stored: K = serde_json::from_value(value).map_err(StoreError::Serialization)?;
        Ok(self.put(stored))
    }

    async fn delete<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        _propagation: Propagation,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.objects.remove(&key::<K>(namespace, name)) {
            Some(_) => {
                state.deleted.push((K::kind(&()).to_string(), name.to_string()));
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}
