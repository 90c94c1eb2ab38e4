//! Portables and their relations.
//!
//! A portable is an object that can be exported from the source and
//! imported on the destination: a group or a project. Its data is
//! transferred one relation (e.g., `labels`, `issues`) at a time.
//!
//! ## Relation Naming
//!
//! Relation names can be up to 64 characters long and can only consist
//! of lowercase ASCII letters, digits, and underscores. They must start
//! with a letter.
//!
//! ## Stages
//!
//! Relations are grouped into ordered stages. Relations in a later stage
//! reference records created by earlier ones (issues reference labels),
//! so a stage may only start once every relation of the previous stages
//! has settled.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{FerryError, FerryResult};

/// The maximum allowable length of a relation name.
pub const MAX_RELATION_NAME_LENGTH: usize = 64;

/// The relation holding the attributes of the portable itself.
pub const SELF_RELATION: &str = "self";

lazy_static! {
    static ref RELATION_NAME_REGEX: Regex = Regex::new(r"^[a-z][a-z0-9_]{0,63}$").unwrap();
}

/// The type of a portable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortableType {
    Group,
    Project,
}

/// The name of a relation.
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RelationName(#[serde(deserialize_with = "RelationName::deserialize")] String);

/// A relation a portable supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationDefinition {
    /// The name of the relation.
    pub name: &'static str,

    /// The stage the relation is imported in.
    pub stage: i32,

    /// Whether the relation carries user-authored content.
    ///
    /// Finishing the export of such a relation invalidates cached
    /// aggregations of user contributions.
    pub user_contributions: bool,

    /// Whether the relation is exported in batches.
    pub batchable: bool,
}

/// A per-portable-type registry of supported relations.
pub trait RelationRegistry: Send + Sync {
    /// Returns the relations a portable type supports, in stage order.
    fn portable_relations(&self, portable_type: PortableType) -> &[RelationDefinition];

    /// Returns the definition of a relation.
    fn relation_definition(
        &self,
        portable_type: PortableType,
        relation: &str,
    ) -> Option<RelationDefinition> {
        self.portable_relations(portable_type)
            .iter()
            .find(|def| def.name == relation)
            .copied()
    }

    /// Returns whether a relation can be exported for a portable type.
    fn is_exportable(&self, portable_type: PortableType, relation: &str) -> bool {
        self.relation_definition(portable_type, relation).is_some()
    }

    /// Returns whether a relation carries user-authored content.
    fn relation_has_user_contributions(&self, portable_type: PortableType, relation: &str) -> bool {
        self.relation_definition(portable_type, relation)
            .map(|def| def.user_contributions)
            .unwrap_or(false)
    }
}

/// The built-in relation lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRelationRegistry;

macro_rules! relation {
    ($name:literal, $stage:literal) => {
        relation!($name, $stage, user_contributions = false, batchable = false)
    };
    ($name:literal, $stage:literal, user_contributions = $uc:literal, batchable = $b:literal) => {
        RelationDefinition {
            name: $name,
            stage: $stage,
            user_contributions: $uc,
            batchable: $b,
        }
    };
}

const GROUP_RELATIONS: &[RelationDefinition] = &[
    relation!("self", 0),
    relation!("labels", 1, user_contributions = false, batchable = true),
    relation!("milestones", 1, user_contributions = false, batchable = true),
    relation!("badges", 1),
    relation!("members", 1),
    relation!("namespace_settings", 1),
    relation!("boards", 2),
    relation!("epics", 2, user_contributions = true, batchable = true),
];

const PROJECT_RELATIONS: &[RelationDefinition] = &[
    relation!("self", 0),
    relation!("labels", 1, user_contributions = false, batchable = true),
    relation!("milestones", 1, user_contributions = false, batchable = true),
    relation!("badges", 1),
    relation!("members", 1),
    relation!("project_feature", 1),
    relation!("container_expiration_policy", 1),
    relation!("service_desk_setting", 1),
    relation!("auto_devops", 2),
    relation!("boards", 2),
    relation!("ci_cd_settings", 2),
    relation!("issues", 3, user_contributions = true, batchable = true),
    relation!("snippets", 3, user_contributions = true, batchable = true),
    relation!("merge_requests", 4, user_contributions = true, batchable = true),
    relation!("releases", 4, user_contributions = true, batchable = true),
    relation!("protected_branches", 4),
    relation!("ci_pipelines", 5, user_contributions = true, batchable = true),
    relation!("uploads", 5),
    relation!("lfs_objects", 5),
];

impl RelationRegistry for DefaultRelationRegistry {
    fn portable_relations(&self, portable_type: PortableType) -> &[RelationDefinition] {
        match portable_type {
            PortableType::Group => GROUP_RELATIONS,
            PortableType::Project => PROJECT_RELATIONS,
        }
    }
}

impl PortableType {
    /// Returns the path segment used in export-relations endpoints.
    pub fn export_path_segment(&self) -> &'static str {
        match self {
            Self::Group => "groups",
            Self::Project => "projects",
        }
    }

    /// Parses an export-relations path segment.
    pub fn from_path_segment(segment: &str) -> FerryResult<Self> {
        match segment {
            "groups" => Ok(Self::Group),
            "projects" => Ok(Self::Project),
            _ => Err(FerryError::InvalidPortableType {
                name: segment.to_owned(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Project => "project",
        }
    }
}

impl FromStr for PortableType {
    type Err = FerryError;

    fn from_str(name: &str) -> FerryResult<Self> {
        match name {
            "group" => Ok(Self::Group),
            "project" => Ok(Self::Project),
            _ => Err(FerryError::InvalidPortableType {
                name: name.to_owned(),
            }),
        }
    }
}

impl fmt::Display for PortableType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RelationName {
    /// Creates a relation name from a String.
    pub fn new(name: String) -> FerryResult<Self> {
        validate_relation_name(&name)?;
        Ok(Self(name))
    }

    /// Returns the string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deserializes a potentially-invalid relation name.
    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_relation_name(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl FromStr for RelationName {
    type Err = FerryError;

    fn from_str(name: &str) -> FerryResult<Self> {
        Self::new(name.to_owned())
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelationName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_relation_name(name: &str) -> FerryResult<()> {
    if RELATION_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(FerryError::InvalidRelationName {
            name: name.to_owned(),
        })
    }
}
