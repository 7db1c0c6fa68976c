use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use volley_core::{KvState, Result};

/// Process-local `KvState`. Keys are kept ordered, so prefix scans come back
/// sorted and restores replay in a stable order.
#[derive(Clone, Default)]
pub struct InMemoryState {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvState for InMemoryState {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn iter_prefix(&self, prefix: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read();
        let prefix = prefix.unwrap_or_default();
        let scan = entries
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let state = InMemoryState::new();
        let key = b"offsets:k1";
        assert!(state.get(key).await.unwrap().is_none());
        state.put(key, b"v1".to_vec()).await.unwrap();
        assert_eq!(state.get(key).await.unwrap(), Some(b"v1".to_vec()));
        state.delete(key).await.unwrap();
        assert!(state.get(key).await.unwrap().is_none());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn prefix_scan_is_ordered_and_scoped() {
        let state = InMemoryState::new();
        for k in ["offsets:b", "other:x", "offsets:a", "offsets", "offsetz:c"] {
            state.put(k.as_bytes(), k.as_bytes().to_vec()).await.unwrap();
        }
        let keys: Vec<Vec<u8>> = state
            .iter_prefix(Some(b"offsets:"))
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"offsets:a".to_vec(), b"offsets:b".to_vec()]);
        assert_eq!(state.iter_prefix(None).await.unwrap().len(), 5);
        assert_eq!(state.len(), 5);
    }
}
