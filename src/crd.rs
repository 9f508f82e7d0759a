use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SPEC ============================= */

/// Infrastructure is the cluster-scoped descriptor (`config.openshift.io/v1`)
/// naming the platform the cluster runs on. The checker only reads the
/// singleton called `cluster`.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Infrastructure",
    plural = "infrastructures",
    status = "InfrastructureStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    /// Reference to the config map holding the cloud provider configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_config: Option<ConfigMapFileReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapFileReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/* ============================= STATUS ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// Unique cluster identifier; VM folders and volume names derive from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_name: Option<String>,

    /// Platform type, e.g. `VSphere`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    #[serde(
        rename = "apiServerURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub api_server_url: Option<String>,
}

/// Name of the singleton Infrastructure object.
pub const INFRASTRUCTURE_NAME: &str = "cluster";

impl Infrastructure {
    /// Cluster infrastructure name from status, if the platform reported one.
    pub fn infrastructure_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.infrastructure_name.as_deref())
            .filter(|n| !n.is_empty())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_api_group() {
        let crd = Infrastructure::crd();
        assert_eq!(crd.spec.group, "config.openshift.io");
        assert_eq!(crd.spec.versions[0].name, "v1");
    }

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = Infrastructure::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.plural, "infrastructures");
    }

    #[test]
    fn test_infrastructure_name_from_status() {
        let mut infra = Infrastructure::new(INFRASTRUCTURE_NAME, InfrastructureSpec::default());
        assert_eq!(infra.infrastructure_name(), None);

        infra.status = Some(InfrastructureStatus {
            infrastructure_name: Some("my-cluster-id".to_string()),
            platform: Some("VSphere".to_string()),
            ..Default::default()
        });
        assert_eq!(infra.infrastructure_name(), Some("my-cluster-id"));
    }

    #[test]
    fn test_empty_infrastructure_name_is_none() {
        let mut infra = Infrastructure::new(INFRASTRUCTURE_NAME, InfrastructureSpec::default());
        infra.status = Some(InfrastructureStatus {
            infrastructure_name: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(infra.infrastructure_name(), None);
    }

    #[test]
    fn test_status_deserializes_camel_case() {
        let json = r#"{"infrastructureName":"abc-123","platform":"VSphere"}"#;
        let status: InfrastructureStatus = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(status.infrastructure_name.as_deref(), Some("abc-123"));
        assert_eq!(status.platform.as_deref(), Some("VSphere"));
        assert_eq!(status.api_server_url, None);
    }
}
