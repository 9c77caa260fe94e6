//! Minimal Kubernetes API client. Every call is made with the bearer token of
//! the caller, never with the broker's own service account.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

pub const SPI_GROUP: &str = "appstudio.redhat.com";
pub const SPI_VERSION: &str = "v1beta1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAttributes {
    pub namespace: String,
    pub verb: String,
    pub group: String,
    pub version: String,
    pub resource: String,
}

/// Identity of the `SPIAccessToken` a token is stored for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetObjectRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Returns `status.allowed` of a `SelfSubjectAccessReview` created as
    /// `bearer`.
    async fn self_subject_access_review(
        &self,
        bearer: &str,
        attributes: &ResourceAttributes,
    ) -> Result<bool, BrokerError>;

    async fn get_access_token(
        &self,
        bearer: &str,
        namespace: &str,
        name: &str,
    ) -> Result<TargetObjectRef, BrokerError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SelfSubjectAccessReview<'a> {
    api_version: &'static str,
    kind: &'static str,
    spec: ReviewSpec<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewSpec<'a> {
    resource_attributes: &'a ResourceAttributes,
}

#[derive(Deserialize)]
struct ReviewResponse {
    #[serde(default)]
    status: ReviewStatus,
}

#[derive(Default, Deserialize)]
struct ReviewStatus {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct ObjectResponse {
    metadata: ObjectMeta,
}

#[derive(Deserialize)]
struct ObjectMeta {
    name: String,
    namespace: String,
    #[serde(default)]
    uid: String,
}

pub struct KubeClient {
    api_server: String,
    http: reqwest::Client,
}

impl KubeClient {
    pub fn new(api_server: &str, http: reqwest::Client) -> Self {
        Self {
            api_server: api_server.trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn self_subject_access_review(
        &self,
        bearer: &str,
        attributes: &ResourceAttributes,
    ) -> Result<bool, BrokerError> {
        let review = SelfSubjectAccessReview {
            api_version: "authorization.k8s.io/v1",
            kind: "SelfSubjectAccessReview",
            spec: ReviewSpec {
                resource_attributes: attributes,
            },
        };

        let response = self
            .http
            .post(format!(
                "{}/apis/authorization.k8s.io/v1/selfsubjectaccessreviews",
                self.api_server
            ))
            .bearer_auth(bearer)
            .json(&review)
            .send()
            .await
            .map_err(|e| {
                BrokerError::AuthzCheck(format!("failed to create SelfSubjectAccessReview: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::AuthzCheck(format!(
                "SelfSubjectAccessReview rejected with status {status}"
            )));
        }

        let review: ReviewResponse = response.json().await.map_err(|e| {
            BrokerError::AuthzCheck(format!("unreadable SelfSubjectAccessReview response: {e}"))
        })?;
        tracing::debug!(
            allowed = review.status.allowed,
            reason = %review.status.reason,
            "self subject review result"
        );
        Ok(review.status.allowed)
    }

    async fn get_access_token(
        &self,
        bearer: &str,
        namespace: &str,
        name: &str,
    ) -> Result<TargetObjectRef, BrokerError> {
        let lookup_error = |reason: String| BrokerError::TargetLookup {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason,
        };

        let response = self
            .http
            .get(format!(
                "{}/apis/{SPI_GROUP}/{SPI_VERSION}/namespaces/{}/spiaccesstokens/{}",
                self.api_server,
                urlencoding::encode(namespace),
                urlencoding::encode(name)
            ))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| lookup_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(lookup_error(format!("API server returned {status}")));
        }

        let object: ObjectResponse = response
            .json()
            .await
            .map_err(|e| lookup_error(format!("unreadable object: {e}")))?;
        Ok(TargetObjectRef {
            namespace: object.metadata.namespace,
            name: object.metadata.name,
            uid: object.metadata.uid,
        })
    }
}
