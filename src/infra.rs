use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/* ============================= OBJECT REFERENCES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    VirtualMachine,
    HostSystem,
    Datastore,
    Datacenter,
    Folder,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::VirtualMachine => write!(f, "VirtualMachine"),
            ObjectKind::HostSystem => write!(f, "HostSystem"),
            ObjectKind::Datastore => write!(f, "Datastore"),
            ObjectKind::Datacenter => write!(f, "Datacenter"),
            ObjectKind::Folder => write!(f, "Folder"),
        }
    }
}

/// Management-object reference: a typed, opaque identifier such as
/// `VirtualMachine:vm-42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub value: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/* ============================= PROPERTIES ============================= */

/// The enumerated set of object attributes a check may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Property {
    Name,
    ConfigUuid,
    ConfigVersion,
    ConfigExtraConfig,
    RuntimeHost,
    ProductVersion,
    ProductApiVersion,
    DatastoreAccessible,
}

impl Property {
    /// Property path as named by the management API.
    pub fn path(&self) -> &'static str {
        match self {
            Property::Name => "name",
            Property::ConfigUuid => "config.uuid",
            Property::ConfigVersion => "config.version",
            Property::ConfigExtraConfig => "config.extraConfig",
            Property::RuntimeHost => "runtime.host",
            Property::ProductVersion => "summary.config.product.version",
            Property::ProductApiVersion => "summary.config.product.apiVersion",
            Property::DatastoreAccessible => "summary.accessible",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    pub key: String,
    pub value: String,
}

impl OptionValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    Text(String),
    Reference(ObjectRef),
    Options(Vec<OptionValue>),
    Flag(bool),
}

/// The subset of an object's properties returned by a single fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyBag {
    values: BTreeMap<Property, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, property: Property, value: PropertyValue) {
        self.values.insert(property, value);
    }

    pub fn with(mut self, property: Property, value: PropertyValue) -> Self {
        self.insert(property, value);
        self
    }

    pub fn get(&self, property: Property) -> Option<&PropertyValue> {
        self.values.get(&property)
    }

    pub fn contains(&self, property: Property) -> bool {
        self.values.contains_key(&property)
    }

    pub fn properties(&self) -> impl Iterator<Item = Property> + '_ {
        self.values.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn text(&self, property: Property) -> Option<&str> {
        match self.values.get(&property) {
            Some(PropertyValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn reference(&self, property: Property) -> Option<&ObjectRef> {
        match self.values.get(&property) {
            Some(PropertyValue::Reference(r)) => Some(r),
            _ => None,
        }
    }

    pub fn flag(&self, property: Property) -> Option<bool> {
        match self.values.get(&property) {
            Some(PropertyValue::Flag(b)) => Some(*b),
            _ => None,
        }
    }

    /// Look up a key inside an option-list property such as `config.extraConfig`.
    pub fn option(&self, property: Property, key: &str) -> Option<&str> {
        match self.values.get(&property) {
            Some(PropertyValue::Options(opts)) => opts
                .iter()
                .find(|o| o.key == key)
                .map(|o| o.value.as_str()),
            _ => None,
        }
    }
}

/* ============================= RECONFIGURE ============================= */

/// Change request submitted to a virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpec {
    /// New hardware version, e.g. `vmx-15`.
    pub version: Option<String>,
    pub extra_config: Vec<OptionValue>,
}

impl ConfigSpec {
    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.extra_config.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef(pub String);

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/* ============================= CLIENT ============================= */

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfraError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("{0}")]
    Remote(String),
}

/// Handle to the virtualization management plane.
///
/// Implementations must tolerate concurrent read-only calls. Serializing
/// reconfiguration of a single object is the caller's job.
#[async_trait]
pub trait InfraClient: Send + Sync {
    /// Establish (or re-establish) the client session.
    async fn login(&self) -> Result<(), InfraError>;

    /// All objects registered at the given inventory path.
    async fn find_by_path(&self, path: &str) -> Result<Vec<ObjectRef>, InfraError>;

    /// Retrieve exactly the requested properties of one object.
    async fn retrieve_properties(
        &self,
        object: &ObjectRef,
        properties: &[Property],
    ) -> Result<PropertyBag, InfraError>;

    /// Submit a reconfiguration; completion is observed through `wait_for_task`.
    async fn reconfigure(&self, object: &ObjectRef, spec: &ConfigSpec)
        -> Result<TaskRef, InfraError>;

    async fn wait_for_task(&self, task: &TaskRef) -> Result<(), InfraError>;

    /// Privilege IDs (`Datastore.Browse`, ...) `user` holds on `entity`,
    /// including those propagated from ancestors.
    async fn user_privileges(&self, entity: &ObjectRef, user: &str)
        -> Result<Vec<String>, InfraError>;

    async fn logout(&self) -> Result<(), InfraError>;
}

/* ============================= TESTS ============================= */
