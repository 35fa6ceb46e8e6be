// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use derive_where::derive_where;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// A UUID with type-level information about what it's used for.
///
/// The control plane stores many kinds of rows (builds, teams, plan
/// nodes, ...) and all of them are keyed by UUID.  If those keys were all
/// the same type it would be easy to pass a team id where a plan node id
/// belongs; the marker type makes that a compile error.
#[derive_where(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedUuid<T: TypedUuidKind> {
    uuid: Uuid,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: TypedUuidKind> TypedUuid<T> {
    /// Creates a new, random UUID of this kind.
    #[inline]
    pub fn new_v4() -> Self {
        Self { uuid: Uuid::new_v4(), _phantom: std::marker::PhantomData }
    }

    /// Create a new `TypedUuid` from an untyped [`Uuid`].
    ///
    /// It is the caller's responsibility to ensure that the UUID is of
    /// the correct kind.
    #[inline]
    pub fn from_untyped(uuid: Uuid) -> Self {
        Self { uuid, _phantom: std::marker::PhantomData }
    }

    /// Convert `self` into the untyped [`Uuid`] it wraps.
    ///
    /// The conversion is deliberately explicit; there is no `From` impl.
    #[inline]
    pub fn into_untyped_uuid(self) -> Uuid {
        self.uuid
    }
}

impl<T: TypedUuidKind> fmt::Debug for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)?;
        write!(f, " ({})", T::tag())
    }
}

impl<T: TypedUuidKind> fmt::Display for TypedUuid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uuid.fmt(f)
    }
}

impl<T: TypedUuidKind> FromStr for TypedUuid<T> {
    type Err = TypedUuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|error| TypedUuidParseError { error, tag: T::tag() })?;
        Ok(Self { uuid, _phantom: std::marker::PhantomData })
    }
}

impl<T: TypedUuidKind> JsonSchema for TypedUuid<T> {
    #[inline]
    fn schema_name() -> String {
        format!("TypedUuidFor{}", T::schema_name())
    }

    #[inline]
    fn schema_id() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Owned(format!(
            "{}::TypedUuid<{}>",
            module_path!(),
            T::schema_id()
        ))
    }

    #[inline]
    fn json_schema(
        gen: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        Uuid::json_schema(gen)
    }
}

/// Represents marker types usable as a type parameter for [`TypedUuid`].
pub trait TypedUuidKind: JsonSchema {
    /// Returns the corresponding tag for this kind.
    fn tag() -> TypedUuidTag;
}

/// Describes what kind of [`TypedUuid`] something is.
///
/// This is the runtime equivalent of [`TypedUuidKind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypedUuidTag {
    Build,
    BuildCommit,
    Environment,
    PlanNode,
    ProvisionedHost,
    ProvisionedNetwork,
    ProvisioningStep,
    Team,
}

impl fmt::Display for TypedUuidTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypedUuidTag::Build => "build",
            TypedUuidTag::BuildCommit => "build_commit",
            TypedUuidTag::Environment => "environment",
            TypedUuidTag::PlanNode => "plan_node",
            TypedUuidTag::ProvisionedHost => "provisioned_host",
            TypedUuidTag::ProvisionedNetwork => "provisioned_network",
            TypedUuidTag::ProvisioningStep => "provisioning_step",
            TypedUuidTag::Team => "team",
        };
        f.write_str(s)
    }
}

macro_rules! impl_typed_uuid_kind {
    ($($kind:ident => $tag:ident),* $(,)?) => {
        $(
            #[derive(JsonSchema)]
            pub enum $kind {}

            impl TypedUuidKind for $kind {
                #[inline]
                fn tag() -> TypedUuidTag {
                    TypedUuidTag::$tag
                }
            }
        )*
    };
}

impl_typed_uuid_kind! {
    BuildKind => Build,
    CommitKind => BuildCommit,
    EnvironmentKind => Environment,
    PlanKind => PlanNode,
    HostKind => ProvisionedHost,
    NetworkKind => ProvisionedNetwork,
    StepKind => ProvisioningStep,
    TeamKind => Team,
}

pub type BuildUuid = TypedUuid<BuildKind>;
pub type CommitUuid = TypedUuid<CommitKind>;
pub type EnvironmentUuid = TypedUuid<EnvironmentKind>;
pub type PlanUuid = TypedUuid<PlanKind>;
pub type HostUuid = TypedUuid<HostKind>;
pub type NetworkUuid = TypedUuid<NetworkKind>;
pub type StepUuid = TypedUuid<StepKind>;
pub type TeamUuid = TypedUuid<TeamKind>;

#[derive(Error, Debug)]
#[error("error parsing uuid for {tag}")]
pub struct TypedUuidParseError {
    #[source]
    error: uuid::Error,
    tag: TypedUuidTag,
}
