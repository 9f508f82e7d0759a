use k8s_openapi::api::core::v1::Node;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::cluster::{node_name, provider_id};
use crate::context::CheckContext;
use crate::error::CheckError;
use crate::infra::{ObjectKind, ObjectRef, Property, PropertyBag};

/* ============================= PROVIDER IDS ============================= */

pub const PROVIDER_ID_SCHEME: &str = "vsphere://";

/// Extract the VM UUID from a node's provider ID (`vsphere://<uuid>`).
///
/// Returns the canonical lowercase hyphenated form.
pub fn parse_provider_id(node: &str, provider_id: Option<&str>) -> Result<String, CheckError> {
    let raw = provider_id.map(str::trim).unwrap_or_default();
    let malformed = |reason: &str| CheckError::MalformedIdentifier {
        node: node.to_string(),
        provider_id: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(malformed("provider ID is empty"));
    }
    let Some(rest) = raw.strip_prefix(PROVIDER_ID_SCHEME) else {
        return Err(malformed("expected vsphere:// scheme"));
    };
    let uuid = Uuid::parse_str(rest).map_err(|e| malformed(&format!("invalid UUID: {e}")))?;
    let canonical = uuid.hyphenated().to_string();
    // braced, simple and urn forms parse too; only the hyphenated one is valid here
    if !canonical.eq_ignore_ascii_case(rest) {
        return Err(malformed("UUID must be in hyphenated 8-4-4-4-12 form"));
    }
    Ok(canonical)
}

/* ============================= RESOLUTION ============================= */

/// A node's backing virtual machine as located in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureObjectRef {
    pub node: String,
    pub inventory_path: String,
    pub uuid: String,
    pub object: ObjectRef,
}

/// Resolve `node` to its virtual machine.
///
/// Issues exactly one path lookup. The path comes from the cluster's VM
/// folder and the node name; there is no fallback search by UUID.
pub async fn resolve(
    ctx: &CheckContext,
    node: &Node,
) -> Result<InfrastructureObjectRef, CheckError> {
    let name = node_name(node);
    if name.is_empty() {
        return Err(CheckError::MalformedIdentifier {
            node: "<unnamed>".to_string(),
            provider_id: provider_id(node).unwrap_or_default().to_string(),
            reason: "node has no name".to_string(),
        });
    }

    let uuid = parse_provider_id(name, provider_id(node))?;
    let path = ctx.metadata().vm_path(name);

    let mut found = ctx.find_by_path(&path).await?;
    let object = match found.len() {
        0 => {
            return Err(CheckError::object_not_found(
                path,
                "no virtual machine registered at this path",
            ));
        }
        1 => found.remove(0),
        n => {
            return Err(CheckError::object_not_found(
                path,
                format!("path is ambiguous ({n} objects)"),
            ));
        }
    };

    if object.kind != ObjectKind::VirtualMachine {
        return Err(CheckError::object_not_found(
            path,
            format!("{object} is not a virtual machine"),
        ));
    }

    debug!(node = name, path = %path, object = %object, "identity_resolved");
    Ok(InfrastructureObjectRef {
        node: name.to_string(),
        inventory_path: path,
        uuid,
        object,
    })
}

/// Confirm the VM found at the path is the one the node's provider ID names.
pub fn verify_identity(
    reference: &InfrastructureObjectRef,
    properties: &PropertyBag,
) -> Result<(), CheckError> {
    match properties.text(Property::ConfigUuid) {
        Some(uuid) if uuid.eq_ignore_ascii_case(&reference.uuid) => Ok(()),
        Some(uuid) => Err(CheckError::object_not_found(
            &reference.inventory_path,
            format!(
                "VM at path has UUID {uuid}, node {} expects {}",
                reference.node, reference.uuid
            ),
        )),
        None => Err(CheckError::object_not_found(
            &reference.inventory_path,
            "VM reports no config.uuid",
        )),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::infra::PropertyValue;

    const UUID0: &str = "265104de-1472-547c-b873-6dc7883fb6cb";

    #[test]
    fn test_parse_valid_provider_id() {
        let id = format!("vsphere://{UUID0}");
        assert_eq!(parse_provider_id("n", Some(&id)).unwrap(), UUID0);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let id = format!("vsphere://{}", UUID0.to_uppercase());
        assert_eq!(parse_provider_id("n", Some(&id)).unwrap(), UUID0);
    }

    #[test]
    fn test_parse_empty_provider_id() {
        for id in [None, Some(""), Some("   ")] {
            let err = parse_provider_id("worker-0", id).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedIdentifier);
        }
    }

    #[test]
    fn test_parse_wrong_scheme() {
        let err = parse_provider_id("n", Some("aws:///us-east-1a/i-0abc")).unwrap_err();
        match err {
            CheckError::MalformedIdentifier { reason, .. } => {
                assert!(reason.contains("vsphere://"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_parse_bad_uuid() {
        let err = parse_provider_id("n", Some("vsphere://not-a-uuid")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedIdentifier);
    }

    #[test]
    fn test_parse_rejects_non_hyphenated_uuid_forms() {
        let simple = UUID0.replace('-', "");
        for form in [
            simple,
            format!("{{{UUID0}}}"),
            format!("urn:uuid:{UUID0}"),
        ] {
            let id = format!("vsphere://{form}");
            let err = parse_provider_id("n", Some(&id)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedIdentifier, "{id}");
        }
    }

    fn reference() -> InfrastructureObjectRef {
        InfrastructureObjectRef {
            node: "DC0_H0_VM0".into(),
            inventory_path: "/DC0/vm/DC0_H0_VM0".into(),
            uuid: UUID0.into(),
            object: ObjectRef::new(ObjectKind::VirtualMachine, "vm-57"),
        }
    }

    #[test]
    fn test_verify_matching_uuid() {
        let bag = PropertyBag::new().with(
            Property::ConfigUuid,
            PropertyValue::Text(UUID0.to_uppercase()),
        );
        assert!(verify_identity(&reference(), &bag).is_ok());
    }

    #[test]
    fn test_verify_mismatched_uuid() {
        let bag = PropertyBag::new().with(
            Property::ConfigUuid,
            PropertyValue::Text("12f8928d-f144-5c57-89db-dd2d0902c9fa".into()),
        );
        let err = verify_identity(&reference(), &bag).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
    }

    #[test]
    fn test_verify_missing_uuid() {
        let err = verify_identity(&reference(), &PropertyBag::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
    }
}
