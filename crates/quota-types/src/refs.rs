use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An unversioned group + kind pair.
///
/// Versions are intentionally absent from cross-record references; the
/// serving version is resolved through API discovery at the point of use.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKindRef {
    /// API group of the referenced kind. The empty string denotes the core group.
    #[serde(default)]
    pub group: String,

    /// Kind of the referenced resource, e.g. `Secret`.
    pub kind: String,
}

impl std::fmt::Display for GroupKindRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            self.kind.fmt(f)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Reference to the entity that receives quota and originates claims,
/// typically an organizational unit.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    /// API group of the consumer kind.
    #[serde(default)]
    pub group: String,

    /// Kind of the consumer, e.g. `Organization`.
    pub kind: String,

    /// Name of the consumer object.
    pub name: String,

    /// Namespace of the consumer object. Unset for cluster-scoped consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ConsumerRef {
    /// Whether two consumer references denote the same consumer.
    ///
    /// Matches on kind and name only, mirroring the inputs of the
    /// deterministic bucket identity so that aggregation and identity
    /// derivation can never disagree about which bucket a consumer maps to.
    pub fn matches(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}

impl std::fmt::Display for ConsumerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Unversioned reference to an arbitrary record, used by claims to point at
/// the object that triggered them.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedObjectRef {
    /// API group of the referenced kind. The empty string denotes the core group.
    #[serde(default)]
    pub group: String,

    /// Kind of the referenced resource.
    pub kind: String,

    /// Name of the referenced object.
    pub name: String,

    /// Namespace of the referenced object, when it is namespaced. Defaults
    /// to the namespace of the referencing record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl std::fmt::Display for TypedObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}/{}", self.kind, namespace, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_match_ignores_namespace() {
        let a = ConsumerRef {
            group: "resourcemanager.miloapis.com".to_owned(),
            kind: "Organization".to_owned(),
            name: "acme".to_owned(),
            namespace: None,
        };
        let b = ConsumerRef {
            namespace: Some("elsewhere".to_owned()),
            ..a.clone()
        };

        assert!(a.matches(&b));
    }

    #[test]
    fn consumer_mismatch_on_name() {
        let a = ConsumerRef {
            kind: "Organization".to_owned(),
            name: "acme".to_owned(),
            ..ConsumerRef::default()
        };
        let b = ConsumerRef {
            name: "globex".to_owned(),
            ..a.clone()
        };

        assert!(!a.matches(&b));
    }

    #[test]
    fn group_kind_display() {
        let core = GroupKindRef {
            group: String::new(),
            kind: "Secret".to_owned(),
        };
        assert_eq!(core.to_string(), "Secret");

        let grouped = GroupKindRef {
            group: "apps".to_owned(),
            kind: "Deployment".to_owned(),
        };
        assert_eq!(grouped.to_string(), "Deployment.apps");
    }
}
