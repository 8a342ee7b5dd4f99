/**
 * IDENTITY RESOLVER - Identifiant terrain → identité interne
 *
 * RÔLE : Résout chaque identifiant externe (patient, tag, bracelet) vers une
 * identité interne, en la créant à la volée si elle n'existe pas encore.
 *
 * CONCURRENCE :
 * - cache lecture/écriture pour le chemin chaud
 * - verrou asynchrone par identifiant externe : un seul créateur à la fois
 * - le store fait un upsert sur une contrainte unique en dernier recours
 *
 * Le resolver garde aussi la date de dernière mise à jour de chaque identité,
 * lue par le heartbeat.
 */

use crate::models::Identity;
use crate::store::{PersistenceError, SharedStore};
use crate::keyed_lock::KeyedLock;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub patient_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
}

pub struct IdentityResolver {
    store: SharedStore,
    /// external_id -> identité
    cache: RwLock<HashMap<String, Identity>>,
    /// external_id -> dernier enregistrement vu (epoch secondes)
    last_update: RwLock<HashMap<String, i64>>,
    key_locks: KeyedLock<String>,
    provisioned: AtomicU64,
}

impl IdentityResolver {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            last_update: RwLock::new(HashMap::new()),
            key_locks: KeyedLock::new(),
            provisioned: AtomicU64::new(0),
        }
    }

    /// Charge les identités déjà connues du store
    pub async fn warm(&self) -> Result<usize, PersistenceError> {
        let identities = self.store.list_identities().await?;
        let count = identities.len();
        let mut cache = self.cache.write();
        for identity in identities {
            cache.insert(identity.external_id.clone(), identity);
        }
        Ok(count)
    }

    pub async fn resolve_or_create(
        &self,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<Identity, PersistenceError> {
        if let Some(identity) = self.cached(external_id) {
            return Ok(identity);
        }
        self.key_locks
            .run(external_id.to_string(), self.load_or_create(external_id, display_name_hint))
            .await
    }

    async fn load_or_create(
        &self,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<Identity, PersistenceError> {
        // un autre message a pu créer l'identité pendant l'attente
        if let Some(identity) = self.cached(external_id) {
            return Ok(identity);
        }

        let identity = match self.store.find_identity_by_external_id(external_id).await? {
            Some(existing) => existing,
            None => {
                let name = display_name_hint
                    .map(str::to_string)
                    .unwrap_or_else(|| placeholder_name(external_id));
                let created = self.store.create_identity(external_id, &name).await?;
                self.provisioned.fetch_add(1, Ordering::Relaxed);
                info!("[identity] auto-provisioned {} as {}", external_id, created.internal_id);
                created
            }
        };

        self.cache.write().insert(external_id.to_string(), identity.clone());
        Ok(identity)
    }

    /// Met à jour le marqueur de fraîcheur (jamais en arrière)
    pub fn touch(&self, external_id: &str, timestamp: i64) {
        let mut last = self.last_update.write();
        let entry = last.entry(external_id.to_string()).or_insert(timestamp);
        if *entry < timestamp {
            *entry = timestamp;
        }
    }

    pub fn identity_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Nombre d'identités créées par ce processus
    pub fn provisioned(&self) -> u64 {
        self.provisioned.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<IdentitySummary> {
        let cache = self.cache.read();
        let last = self.last_update.read();
        let mut list: Vec<IdentitySummary> = cache
            .values()
            .map(|identity| IdentitySummary {
                patient_id: identity.external_id.clone(),
                display_name: identity.display_name.clone(),
                last_update: last.get(&identity.external_id).copied(),
            })
            .collect();
        list.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        list
    }

    fn cached(&self, external_id: &str) -> Option<Identity> {
        self.cache.read().get(external_id).cloned()
    }
}

pub fn placeholder_name(external_id: &str) -> String {
    format!("Patient {external_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_references_create_exactly_once() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let resolver = Arc::new(IdentityResolver::new(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver.resolve_or_create("device_unknown_4242", None).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().internal_id);
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(resolver.provisioned(), 1);
        assert_eq!(resolver.key_locks.len(), 0);
        assert_eq!(store.list_identities().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_resolvers_sharing_sqlite_converge() {
        // deux resolvers = pas de verrou commun, seule la contrainte unique protège
        let store: SharedStore = Arc::new(SqliteStore::in_memory().unwrap());
        let a = Arc::new(IdentityResolver::new(store.clone()));
        let b = Arc::new(IdentityResolver::new(store.clone()));
        let (ia, ib) = tokio::join!(
            a.resolve_or_create("p-shared", Some("Shared")),
            b.resolve_or_create("p-shared", Some("Other")),
        );
        assert_eq!(ia.unwrap().internal_id, ib.unwrap().internal_id);
        assert_eq!(store.list_identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn placeholder_and_hint() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let resolver = IdentityResolver::new(store);
        let hinted = resolver.resolve_or_create("device_001", Some("Tag 6ea")).await.unwrap();
        assert_eq!(hinted.display_name, "Tag 6ea");
        let plain = resolver.resolve_or_create("p7", None).await.unwrap();
        assert_eq!(plain.display_name, "Patient p7");
        // premier nom conservé
        let again = resolver.resolve_or_create("device_001", Some("Renamed")).await.unwrap();
        assert_eq!(again.display_name, "Tag 6ea");
    }

    #[tokio::test]
    async fn warm_and_snapshot() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        store.create_identity("p1", "Alice").await.unwrap();
        store.create_identity("p2", "Bob").await.unwrap();
        let resolver = IdentityResolver::new(store);
        assert_eq!(resolver.warm().await.unwrap(), 2);
        resolver.touch("p1", 50);
        resolver.touch("p1", 40);
        let snap = resolver.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].last_update, Some(50));
        assert_eq!(snap[1].last_update, None);
        assert_eq!(resolver.provisioned(), 0);
    }
}
