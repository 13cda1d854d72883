use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::pattern::MemoryPatternGroup;

/// Ordered feed shapes of a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeSignature(pub Vec<Vec<i64>>);

impl ShapeSignature {
    pub fn new(shapes: Vec<Vec<i64>>) -> Self {
        Self(shapes)
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    signature: ShapeSignature,
    group: MemoryPatternGroup,
}

/// Memory patterns keyed by input shape signature.
///
/// Concurrent runs that miss on the same signature each trace their own pattern; the last
/// insert wins.
#[derive(Debug, Default)]
pub struct MemoryPatternCache {
    groups: RwLock<HashMap<ShapeSignature, Arc<MemoryPatternGroup>>>,
}

impl MemoryPatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signature: &ShapeSignature) -> Option<Arc<MemoryPatternGroup>> {
        self.groups.read().ok()?.get(signature).cloned()
    }

    pub fn insert(&self, signature: ShapeSignature, group: MemoryPatternGroup) -> Result<()> {
        let mut groups = self
            .groups
            .write()
            .map_err(|_| Error::Fail("memory pattern cache lock poisoned".to_string()))?;
        groups.insert(signature, Arc::new(group));
        Ok(())
    }

    pub fn clear(&self) {
        if let Ok(mut groups) = self.groups.write() {
            groups.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.groups.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every cached group to `path` as JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let groups = self
            .groups
            .read()
            .map_err(|_| Error::Fail("memory pattern cache lock poisoned".to_string()))?;
        let mut entries: Vec<CacheEntry> = groups
            .iter()
            .map(|(signature, group)| CacheEntry {
                signature: signature.clone(),
                group: group.as_ref().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.signature.0.cmp(&b.signature.0));
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Merge groups saved by `save_json` into this cache; returns how many were loaded
    pub fn load_json(&self, path: impl AsRef<Path>) -> Result<usize> {
        let json = fs::read_to_string(path)?;
        let entries: Vec<CacheEntry> = serde_json::from_str(&json)?;
        let count = entries.len();
        for entry in entries {
            self.insert(entry.signature, entry.group)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::MemoryLocation;
    use crate::memory::pattern::MemoryPattern;

    #[test]
    fn test_insert_overwrites() {
        let cache = MemoryPatternCache::new();
        let signature = ShapeSignature::new(vec![vec![1, 4]]);
        let mut group = MemoryPatternGroup::default();
        group.push(MemoryLocation::cpu(), MemoryPattern { peak_size: 16, ..Default::default() });
        cache.insert(signature.clone(), group.clone()).unwrap();
        cache.insert(signature.clone(), group).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&signature).unwrap().total_peak_size(), 16);
        assert!(cache.get(&ShapeSignature::new(vec![vec![2, 4]])).is_none());
        cache.clear();
        assert!(cache.is_empty());
    }
}
