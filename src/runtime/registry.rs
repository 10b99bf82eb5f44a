//! Account id to running actor lookup.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use super::actor::{AccountHandle, AccountRuntime};
use crate::error::{ControllerError, ControllerResult};

/// Running accounts, one actor each.
#[derive(Default)]
pub struct AccountRegistry {
    accounts: RwLock<HashMap<String, AccountRuntime>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running account. A second runtime for the same account would
    /// break single ownership, so it is shut down and rejected.
    pub async fn register(&self, runtime: AccountRuntime) -> ControllerResult<AccountHandle> {
        let handle = runtime.handle();
        let account_id = handle.account_id().to_string();

        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account_id) {
            drop(accounts);
            runtime.shutdown().await;
            return Err(ControllerError::invalid(
                "account_id",
                format!("{} already has a running controller", account_id),
            ));
        }

        accounts.insert(account_id.clone(), runtime);
        info!(%account_id, "Account registered");
        Ok(handle)
    }

    pub async fn get(&self, account_id: &str) -> ControllerResult<AccountHandle> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|runtime| runtime.handle())
            .ok_or_else(|| ControllerError::ActorUnavailable(account_id.to_string()))
    }

    pub async fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Shut one account down. Its persisted state is untouched.
    pub async fn remove(&self, account_id: &str) -> ControllerResult<()> {
        let runtime = self
            .accounts
            .write()
            .await
            .remove(account_id)
            .ok_or_else(|| ControllerError::ActorUnavailable(account_id.to_string()))?;
        runtime.shutdown().await;
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        let runtimes: Vec<AccountRuntime> = self
            .accounts
            .write()
            .await
            .drain()
            .map(|(_, runtime)| runtime)
            .collect();

        for runtime in runtimes {
            runtime.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerSettings, RiskBands, StrategyConfig};
    use crate::exchange::PaperExchange;
    use crate::persistence::PersistenceManager;
    use crate::runtime::spawn_account;
    use crate::strategy::{StrategyController, StrategyStatus};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn runtime(account_id: &str, store: Arc<PersistenceManager>) -> AccountRuntime {
        let settings = ControllerSettings {
            account_id: account_id.to_string(),
            poll_interval_secs: 3600,
            ..Default::default()
        };
        let exchange = Arc::new(PaperExchange::new("BTCUSDT", dec!(10000), dec!(96500)));
        let controller = StrategyController::load(
            settings.clone(),
            RiskBands::default(),
            StrategyConfig::default(),
            exchange.clone(),
            store,
        )
        .unwrap();
        spawn_account(controller, exchange, &settings)
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let registry = AccountRegistry::new();
        let alice = registry.register(runtime("alice", store.clone())).await.unwrap();
        let bob = registry.register(runtime("bob", store.clone())).await.unwrap();

        alice.start(None).await.unwrap();
        assert_eq!(alice.state().await.unwrap().status, StrategyStatus::Wait);
        assert_eq!(bob.state().await.unwrap().status, StrategyStatus::Stopped);
        assert_eq!(registry.account_ids().await, vec!["alice", "bob"]);

        registry.remove("bob").await.unwrap();
        assert!(registry.get("bob").await.is_err());
        assert!(registry.get("alice").await.is_ok());

        registry.shutdown_all().await;
        assert!(registry.account_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let registry = AccountRegistry::new();
        registry.register(runtime("alice", store.clone())).await.unwrap();

        let err = registry
            .register(runtime("alice", store))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig { .. }));
        registry.shutdown_all().await;
    }
}
