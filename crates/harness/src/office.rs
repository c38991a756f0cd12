use std::sync::Arc;

use loanrec_engine::{EngineConfig, EngineError};

use crate::{InstrumentedStore, MemoryStore, TestDesk};

/// Several desks (independent engines, as in separate browser sessions)
/// over one shared store.
pub struct TestOffice {
    store: Arc<InstrumentedStore<MemoryStore>>,
    config: EngineConfig,
    desks: Vec<TestDesk>,
}

impl Default for TestOffice {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl TestOffice {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            store: Arc::new(InstrumentedStore::new(MemoryStore::new())),
            config,
            desks: Vec::new(),
        }
    }

    pub fn add_desk(&mut self) -> Result<usize, EngineError> {
        let desk = TestDesk::on_store(self.store.clone(), &self.config)?;
        let index = self.desks.len();
        self.desks.push(desk);
        Ok(index)
    }

    pub fn desk(&self, index: usize) -> &TestDesk {
        &self.desks[index]
    }

    pub fn store(&self) -> &InstrumentedStore<MemoryStore> {
        &self.store
    }
}
