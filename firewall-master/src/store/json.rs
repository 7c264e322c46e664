/**
 * TABLE JSON - Stockage d'une table en fichier JSON
 *
 * FONCTIONNEMENT :
 * - Cache mémoire des lignes (pour perf) + compteur d'ids
 * - Chargé une fois à l'ouverture, fichier réécrit (pretty) après chaque mutation
 * - Sans chemin : table purement en mémoire (tests, mode démo)
 */

use super::{Entity, Predicate, Table};
use crate::error::StoreError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

struct Rows<T> {
    rows: Vec<T>,
    next_id: u64,
}

pub struct JsonTable<T: Entity> {
    storage_path: Option<PathBuf>,
    cache: Mutex<Rows<T>>,
}

impl<T: Entity> JsonTable<T> {
    pub fn in_memory() -> Self {
        Self {
            storage_path: None,
            cache: Mutex::new(Rows { rows: Vec::new(), next_id: 1 }),
        }
    }

    /// Ouvre (ou crée) la table persistée dans `storage_path`
    pub fn open<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let path = storage_path.into();
        if !path.exists() {
            fs::write(&path, "[]")?;
        }
        let content = fs::read_to_string(&path)?;
        let rows: Vec<T> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&content)?
        };
        let next_id = rows.iter().filter_map(|r| r.id()).max().unwrap_or(0) + 1;
        debug!("[store] {} rows loaded from {:?}", rows.len(), path);
        Ok(Self {
            storage_path: Some(path),
            cache: Mutex::new(Rows { rows, next_id }),
        })
    }

    /// Sauvegarde le cache vers le fichier JSON (appelé verrou tenu)
    fn save_to_disk(&self, rows: &[T]) -> Result<(), StoreError> {
        if let Some(path) = &self.storage_path {
            let json = serde_json::to_string_pretty(rows)?;
            fs::write(path, json)?;
        }
        Ok(())
    }
}

impl<T: Entity> Table<T> for JsonTable<T> {
    fn get(&self, id: u64) -> Result<Option<T>, StoreError> {
        let cache = self.cache.lock();
        Ok(cache.rows.iter().find(|r| r.id() == Some(id)).cloned())
    }

    fn find(&self, key: &T::Key) -> Result<Option<T>, StoreError> {
        let cache = self.cache.lock();
        Ok(cache.rows.iter().find(|r| &r.natural_key() == key).cloned())
    }

    fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.cache.lock().rows.clone())
    }

    fn upsert_by_key(&self, rows: Vec<T>) -> Result<Vec<T>, StoreError> {
        let mut cache = self.cache.lock();
        let mut index: HashMap<T::Key, usize> = cache
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.natural_key(), i))
            .collect();

        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            let key = row.natural_key();
            match index.get(&key) {
                Some(&i) => {
                    // la ligne existante garde son id
                    if let Some(id) = cache.rows[i].id() {
                        row.set_id(id);
                    }
                    cache.rows[i] = row.clone();
                }
                None if row.id().is_some_and(|id| cache.rows.iter().any(|r| r.id() == Some(id))) => {
                    // clé naturelle modifiée sur une ligne existante : remplacement par id
                    let i = cache.rows.iter().position(|r| r.id() == row.id()).unwrap_or_default();
                    index.remove(&cache.rows[i].natural_key());
                    index.insert(key, i);
                    cache.rows[i] = row.clone();
                }
                None => {
                    let id = cache.next_id;
                    cache.next_id += 1;
                    row.set_id(id);
                    index.insert(key, cache.rows.len());
                    cache.rows.push(row.clone());
                }
            }
            stored.push(row);
        }
        self.save_to_disk(&cache.rows)?;
        Ok(stored)
    }

    fn delete_where(&self, pred: Predicate<'_, T>) -> Result<usize, StoreError> {
        let mut cache = self.cache.lock();
        let before = cache.rows.len();
        cache.rows.retain(|r| !pred(r));
        let removed = before - cache.rows.len();
        if removed > 0 {
            self.save_to_disk(&cache.rows)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleUsageLink;
    use tempfile::TempDir;

    fn link(rule_id: u64, fact_id: u64) -> RuleUsageLink {
        RuleUsageLink { id: None, rule_id, fact_id }
    }

    #[test]
    fn test_upsert_assigns_ids_and_keeps_them() {
        let table = JsonTable::<RuleUsageLink>::in_memory();
        let first = table.upsert_by_key(vec![link(1, 10), link(1, 11)]).unwrap();
        assert_eq!(first[0].id, Some(1));
        assert_eq!(first[1].id, Some(2));

        let again = table.upsert_by_key(vec![link(1, 11), link(2, 10)]).unwrap();
        assert_eq!(again[0].id, Some(2));
        assert_eq!(again[1].id, Some(3));
        assert_eq!(table.list().unwrap().len(), 3);
        assert!(table.find(&(2, 10)).unwrap().is_some());
        assert_eq!(table.get(3).unwrap().unwrap().rule_id, 2);
    }

    #[test]
    fn test_changed_key_with_known_id_replaces_row() {
        let table = JsonTable::<RuleUsageLink>::in_memory();
        let stored = table.upsert_by_key(vec![link(1, 10)]).unwrap();
        let moved = RuleUsageLink { id: stored[0].id, rule_id: 1, fact_id: 20 };
        table.upsert_by_key(vec![moved]).unwrap();
        let rows = table.list().unwrap();
        assert_eq!(rows, vec![RuleUsageLink { id: Some(1), rule_id: 1, fact_id: 20 }]);
        assert!(table.find(&(1, 10)).unwrap().is_none());
    }

    #[test]
    fn test_delete_where_and_delete_all() {
        let table = JsonTable::<RuleUsageLink>::in_memory();
        table.upsert_by_key(vec![link(1, 10), link(1, 11), link(2, 12)]).unwrap();
        assert_eq!(table.delete_where(&|l: &RuleUsageLink| l.rule_id == 1).unwrap(), 2);
        assert_eq!(table.list_where(&|l: &RuleUsageLink| l.rule_id == 2).unwrap().len(), 1);
        assert_eq!(table.delete_all().unwrap(), 1);
        assert!(table.list().unwrap().is_empty());
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.json");
        {
            let table = JsonTable::<RuleUsageLink>::open(&path).unwrap();
            table.upsert_by_key(vec![link(7, 70)]).unwrap();
        }
        let reopened = JsonTable::<RuleUsageLink>::open(&path).unwrap();
        let rows = reopened.list().unwrap();
        assert_eq!(rows, vec![RuleUsageLink { id: Some(1), rule_id: 7, fact_id: 70 }]);
        // les ids continuent après le rechargement
        let next = reopened.upsert_by_key(vec![link(8, 80)]).unwrap();
        assert_eq!(next[0].id, Some(2));
    }
}
