use parking_lot::RwLock;
use std::sync::Arc;

/// État partagé lu en concurrence (API, moniteurs), écrit par une seule tâche propriétaire.
pub type Shared<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}
