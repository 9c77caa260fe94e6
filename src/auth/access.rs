use std::sync::Arc;

use crate::error::BrokerError;
use crate::kube::{ClusterApi, ResourceAttributes, SPI_GROUP, SPI_VERSION};

/// Resource whose `create` permission grants the right to supply token data.
pub const TOKEN_DATA_UPDATES: &str = "spiaccesstokendataupdates";

/// Decides whether a caller may act on SPI resources, by asking the cluster
/// on the caller's behalf.
#[derive(Clone)]
pub struct AccessGate {
    cluster: Arc<dyn ClusterApi>,
}

impl AccessGate {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// `Ok(false)` on an explicit denial, [`BrokerError::AuthzCheck`] when the
    /// cluster cannot answer.
    pub async fn check_access(
        &self,
        bearer: &str,
        namespace: &str,
        resource: &str,
        verb: &str,
    ) -> Result<bool, BrokerError> {
        let attributes = ResourceAttributes {
            namespace: namespace.to_string(),
            verb: verb.to_string(),
            group: SPI_GROUP.to_string(),
            version: SPI_VERSION.to_string(),
            resource: resource.to_string(),
        };
        self.cluster
            .self_subject_access_review(bearer, &attributes)
            .await
    }

    /// Like [`check_access`](Self::check_access) for `create` on
    /// [`TOKEN_DATA_UPDATES`], turning a denial into
    /// [`BrokerError::Unauthorized`].
    pub async fn require_token_update(
        &self,
        bearer: &str,
        namespace: &str,
    ) -> Result<(), BrokerError> {
        if self
            .check_access(bearer, namespace, TOKEN_DATA_UPDATES, "create")
            .await?
        {
            Ok(())
        } else {
            Err(BrokerError::Unauthorized {
                namespace: namespace.to_string(),
                resource: TOKEN_DATA_UPDATES.to_string(),
                verb: "create".to_string(),
            })
        }
    }
}
