//! Substrate 对外地址

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use kit_common::{Result, Substrate};

use crate::cloud::AddressProvider;
use crate::readiness::require;
use crate::store::ObjectKey;
use crate::subcontroller::SubController;

pub struct AddressStage {
    addresses: Arc<dyn AddressProvider>,
}

impl AddressStage {
    pub fn new(addresses: Arc<dyn AddressProvider>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl SubController<Substrate> for AddressStage {
    fn name(&self) -> &'static str {
        "address"
    }

    async fn reconcile(&self, parent: &mut Substrate) -> Result<()> {
        let key = ObjectKey::of(parent);
        let address = require(
            self.addresses.ensure_address(&key).await?,
            format!("Substrate {key} 的地址"),
        )?;
        if parent.address() != Some(address.as_str()) {
            info!("Substrate {} 分配到地址 {}", key, address);
        }
        parent.cluster_status_mut().address = Some(address);
        Ok(())
    }

    async fn finalize(&self, parent: &mut Substrate) -> Result<()> {
        self.addresses.release_address(&ObjectKey::of(parent)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::substrate_with_address;
    use crate::cloud::MockAddressProvider;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_pending_address_is_not_ready() {
        let mut addresses = MockAddressProvider::new();
        addresses
            .expect_ensure_address()
            .with(eq(ObjectKey::namespaced("default", "sub")))
            .times(1)
            .returning(|_| Ok(None));

        let mut substrate = substrate_with_address(None);
        let err = AddressStage::new(Arc::new(addresses))
            .reconcile(&mut substrate)
            .await
            .unwrap_err();
        assert!(err.is_not_ready());
        assert_eq!(substrate.address(), None);
    }

    #[tokio::test]
    async fn test_address_recorded_and_released() {
        let mut addresses = MockAddressProvider::new();
        addresses
            .expect_ensure_address()
            .returning(|_| Ok(Some("203.0.113.7".into())));
        addresses
            .expect_release_address()
            .with(eq(ObjectKey::namespaced("default", "sub")))
            .times(1)
            .returning(|_| Ok(()));

        let stage = AddressStage::new(Arc::new(addresses));
        let mut substrate = substrate_with_address(None);
        stage.reconcile(&mut substrate).await.unwrap();
        assert_eq!(substrate.address(), Some("203.0.113.7"));
        stage.finalize(&mut substrate).await.unwrap();
    }
}
