//! Groups provider handles by id (C2). Guarded by a single mutex; reads
//! dominate, structural changes only happen during discovery/restart (§5).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::provider::handle::ProviderHandle;

#[derive(Default)]
pub struct ProviderRegistry {
    handles: RwLock<HashMap<String, Arc<ProviderHandle>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ProviderHandle>) {
        self.handles
            .write()
            .unwrap()
            .insert(handle.provider_id().to_string(), handle);
    }

    pub fn remove(&self, provider_id: &str) -> Option<Arc<ProviderHandle>> {
        self.handles.write().unwrap().remove(provider_id)
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderHandle>> {
        self.handles.read().unwrap().get(provider_id).cloned()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.handles.read().unwrap().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<ProviderHandle>> {
        self.handles.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::handle::ProviderSpawnSpec;
    use std::time::Duration;

    #[test]
    fn insert_remove_roundtrip() {
        let reg = ProviderRegistry::new();
        let handle = Arc::new(ProviderHandle::new(ProviderSpawnSpec {
            provider_id: "sim0".into(),
            command: "true".into(),
            args: vec![],
            timeout: Duration::from_millis(100),
        }));
        reg.insert(handle);
        assert!(reg.get("sim0").is_some());
        assert_eq!(reg.provider_ids(), vec!["sim0".to_string()]);
        reg.remove("sim0");
        assert!(reg.get("sim0").is_none());
    }
}
