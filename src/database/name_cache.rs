//! Statement Name Cache
//!
//! Existence-only record of statement names, shared by every queue of a
//! database. Unlike `StatementCache` it holds no engine handles and may be
//! read and written from any thread.

use parking_lot::Mutex;

use super::CacheError;

#[derive(Debug)]
struct NameTable {
    names: Vec<String>,
    capacity: usize,
}

/// Thread-safe set of statement names with insertion order
#[derive(Debug)]
pub struct NameCache {
    table: Mutex<NameTable>,
}

impl NameCache {
    pub fn new(initial_capacity: usize) -> Self {
        let capacity = initial_capacity.max(1);
        Self {
            table: Mutex::new(NameTable {
                names: Vec::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Record a name. Adding a name that is already present is a no-op.
    ///
    /// When the table is full its capacity doubles; if that allocation
    /// fails the table is left as it was.
    pub fn add(&self, name: &str) -> Result<(), CacheError> {
        if name.is_empty() {
            return Err(CacheError::InvalidStatement("statement name is empty".to_string()));
        }

        let mut table = self.table.lock();
        if table.names.iter().any(|existing| existing == name) {
            return Ok(());
        }

        if table.names.len() == table.capacity {
            let grown = table
                .capacity
                .checked_mul(2)
                .ok_or_else(|| CacheError::Allocation("name cache capacity overflow".to_string()))?;
            let additional = grown - table.names.len();
            table
                .names
                .try_reserve_exact(additional)
                .map_err(|e| CacheError::Allocation(e.to_string()))?;
            table.capacity = grown;
        }

        table.names.push(name.to_string());
        Ok(())
    }

    /// Forget a name; later names keep their relative order
    pub fn remove(&self, name: &str) -> bool {
        let mut table = self.table.lock();
        match table.names.iter().position(|existing| existing == name) {
            Some(index) => {
                table.names.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.lock().names.iter().any(|existing| existing == name)
    }

    pub fn len(&self) -> usize {
        self.table.lock().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.table.lock().capacity
    }

    /// Snapshot of the names in insertion order
    pub fn names(&self) -> Vec<String> {
        self.table.lock().names.clone()
    }
}

impl Default for NameCache {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_duplicate_add_is_idempotent() {
        let cache = NameCache::new(4);
        cache.add("x").unwrap();
        cache.add("x").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("x"));
    }

    #[test]
    fn test_capacity_doubles() {
        let cache = NameCache::new(2);
        cache.add("a").unwrap();
        cache.add("b").unwrap();
        assert_eq!(cache.capacity(), 2);

        cache.add("c").unwrap();
        assert_eq!(cache.capacity(), 4);
        cache.add("d").unwrap();
        cache.add("e").unwrap();
        assert_eq!(cache.capacity(), 8);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_remove_shifts_later_entries() {
        let cache = NameCache::new(4);
        for name in ["a", "b", "c", "d"] {
            cache.add(name).unwrap();
        }

        assert!(cache.remove("a"));
        assert_eq!(cache.names(), vec!["b", "c", "d"]);
        assert!(cache.remove("c"));
        assert_eq!(cache.names(), vec!["b", "d"]);
        assert!(!cache.remove("missing"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_empty_name_rejected() {
        let cache = NameCache::default();
        assert!(cache.add("").is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_add_remove() {
        let cache = Arc::new(NameCache::new(1));
        let mut workers = Vec::new();

        for t in 0..4 {
            let cache = Arc::clone(&cache);
            workers.push(thread::spawn(move || {
                for i in 0..100 {
                    let name = format!("t{}_{}", t, i);
                    cache.add(&name).unwrap();
                    cache.add("shared").unwrap();
                    if i % 2 == 0 {
                        assert!(cache.remove(&name));
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        // 4 threads x 50 kept names + the shared one
        assert_eq!(cache.len(), 201);
        assert_eq!(cache.names().iter().filter(|n| *n == "shared").count(), 1);
    }
}
