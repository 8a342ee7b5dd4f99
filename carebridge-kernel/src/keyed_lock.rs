/**
 * KEYED LOCK - Sérialisation check-then-create par clé
 *
 * Une clé n'occupe la table que pendant qu'une tâche la tient ou l'attend :
 * le dernier détenteur retire l'entrée en sortant, y compris si son futur
 * est abandonné en cours de route.
 */

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

type Slot = Arc<tokio::sync::Mutex<()>>;

pub struct KeyedLock<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Exécute `work` seul pour cette clé
    pub async fn run<F, T>(&self, key: K, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = self.slots.lock().entry(key.clone()).or_default().clone();
        let _release = Release {
            owner: self,
            key,
            slot: slot.clone(),
        };
        let _guard = slot.lock().await;
        work.await
    }

    /// Clés actuellement tenues ou attendues
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

struct Release<'a, K: Eq + Hash> {
    owner: &'a KeyedLock<K>,
    key: K,
    slot: Slot,
}

impl<K: Eq + Hash> Drop for Release<'_, K> {
    fn drop(&mut self) {
        let mut slots = self.owner.slots.lock();
        // table + `run` + ce garde : personne d'autre n'attend
        if Arc::strong_count(&self.slot) <= 3 {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn entries_are_dropped_after_use() {
        let locks = KeyedLock::new();
        for i in 0..1000 {
            locks.run(format!("type-{i}"), async {}).await;
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_work_releases_its_key() {
        let locks = KeyedLock::new();
        let stalled = locks.run("k".to_string(), std::future::pending::<()>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), stalled).await;
        assert!(timed_out.is_err());
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_runs_one_at_a_time() {
        let locks = Arc::new(KeyedLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let (locks, inside, peak) = (locks.clone(), inside.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                locks
                    .run("p1".to_string(), async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }
}
