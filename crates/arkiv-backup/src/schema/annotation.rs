//! Id and file annotations attached to elements

use serde::{Deserialize, Serialize};

use crate::scalar::Scalar;

/// What restore does when an annotated reference has no entry in the
/// migration registry.
///
/// In TOML: `{ policy = "required" }` or `{ policy = "optional", default = 0 }`.
/// An optional policy without `default` substitutes null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// The record and its subtree are dropped with a warning.
    #[default]
    Required,
    /// `default` is written instead.
    Optional {
        #[serde(default)]
        default: Scalar,
    },
}

impl ReferencePolicy {
    pub fn optional(default: impl Into<Scalar>) -> Self {
        ReferencePolicy::Optional {
            default: default.into(),
        }
    }

    pub fn optional_null() -> Self {
        ReferencePolicy::Optional {
            default: Scalar::Null,
        }
    }
}

/// Marks an attribute as a foreign key into `entity_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAnnotation {
    pub attribute: String,
    pub entity_type: String,
    pub policy: ReferencePolicy,
}

/// The attribute holding a record's own identity.
///
/// On restore the attribute is left to the database, and the assigned id is
/// registered as the new id for `(entity_type, old value)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    pub attribute: String,
    pub entity_type: String,
}

/// Marks an attribute holding rich content stored under `component/file_area`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileAnnotation {
    pub component: String,
    /// Name of the content area; also the attribute that holds the content
    pub file_area: String,
    /// Attribute keying the area per record. `None` means one shared area.
    pub item_id_attribute: Option<String>,
}

impl FileAnnotation {
    /// `component/file_area`, the key used in file manifests.
    pub fn area_key(&self) -> String {
        format!("{}/{}", self.component, self.file_area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Policies {
        user: ReferencePolicy,
        parent: ReferencePolicy,
        group: ReferencePolicy,
    }

    #[test]
    fn test_reference_policy_from_toml() {
        let parsed: Policies = toml::from_str(
            r#"
            user = { policy = "required" }
            parent = { policy = "optional", default = 0 }
            group = { policy = "optional" }
            "#,
        )
        .unwrap();

        assert_eq!(parsed.user, ReferencePolicy::Required);
        assert_eq!(parsed.parent, ReferencePolicy::optional(0));
        assert_eq!(parsed.group, ReferencePolicy::optional_null());
    }
}
