use std::sync::Arc;

use loanrec_core::{
    ApplicationId, CallerIdentity, CoreError, LoanApplicationRecord, ManifestRegistry, Role, UserId,
};
use loanrec_engine::{EngineConfig, EngineError, NewApplication, RecordEngine, RolePolicy};

use crate::{InstrumentedStore, MemoryStore};

pub const DSCR: &str = "Residential NOO - DSCR";

pub fn user(id: &str) -> Result<UserId, CoreError> {
    UserId::new(id)
}

pub fn caller(id: &str, role: Role) -> Result<CallerIdentity, CoreError> {
    Ok(CallerIdentity::new(user(id)?, role))
}

/// One engine over an instrumented in-memory store, with a cast of callers:
/// `borrower-1` owns, `broker-1` brokers, `analyst-1` is the workforce member
/// and `admin-1` administers.
pub struct TestDesk {
    pub engine: RecordEngine,
    pub store: Arc<InstrumentedStore<MemoryStore>>,
    pub borrower: CallerIdentity,
    pub broker: CallerIdentity,
    pub analyst: CallerIdentity,
    pub admin: CallerIdentity,
}

impl TestDesk {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(InstrumentedStore::new(MemoryStore::new()));
        Self::on_store(store, &config)
    }

    /// A desk sharing `store` with others.
    pub fn on_store(
        store: Arc<InstrumentedStore<MemoryStore>>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let engine = RecordEngine::with_access_policy(
            store.clone(),
            ManifestRegistry::builtin()?,
            config,
            Arc::new(RolePolicy),
        );
        Ok(Self {
            engine,
            store,
            borrower: caller("borrower-1", Role::Borrower)?,
            broker: caller("broker-1", Role::Broker)?,
            analyst: caller("analyst-1", Role::Workforce)?,
            admin: caller("admin-1", Role::Admin)?,
        })
    }

    /// DSCR application opened by the broker for the borrower.
    pub async fn create_dscr(&self) -> Result<ApplicationId, EngineError> {
        let request = NewApplication::new(
            self.borrower.user_id.clone(),
            self.broker.user_id.clone(),
            DSCR,
        );
        self.engine.create_application(&self.broker, request).await
    }

    /// What the store holds right now, bypassing the engine.
    pub fn stored(&self, id: ApplicationId) -> Option<LoanApplicationRecord> {
        self.store.inner().record(id)
    }
}
