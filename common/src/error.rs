// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the rampart control plane.
//!
//! Collaborator seams (datastore, builder, reviewer) and the core both
//! speak this one error type for persistence and lookup failures; layers
//! with richer failure modes wrap it in their own enums.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// An error that can be generated within any control plane component.
///
/// Where possible we reuse existing variants rather than inventing new
/// ones to distinguish cases no programmatic consumer needs to
/// distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name:?}) not found: {lookup_type}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified identifier.
    #[error("Object (of type {type_name:?}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The specified input field is not valid.
    #[error("Invalid Value: {label}, {message}")]
    InvalidValue { label: String, message: String },
    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

impl Error {
    pub fn invalid_request(message: impl Into<String>) -> Error {
        Error::InvalidRequest { message: message.into() }
    }

    pub fn invalid_value(
        label: impl Into<String>,
        message: impl Into<String>,
    ) -> Error {
        Error::InvalidValue { label: label.into(), message: message.into() }
    }

    pub fn internal_error(internal_message: impl Into<String>) -> Error {
        Error::InternalError { internal_message: internal_message.into() }
    }
}

/// Kinds of objects that the control plane stores and looks up.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ResourceType {
    Environment,
    Build,
    BuildCommit,
    Team,
    ProvisionedNetwork,
    ProvisionedHost,
    ProvisioningStep,
    PlanNode,
    Status,
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific name was requested
    ByName(String),
    /// a specific id was requested
    ById(Uuid),
    /// a specific id was requested with some composite type
    /// (caller summarizes it)
    ByCompositeId(String),
}

impl LookupType {
    /// Returns an `ObjectNotFound` error appropriate for the case where
    /// this lookup failed.
    pub fn into_not_found(self, type_name: ResourceType) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: self }
    }
}

impl std::fmt::Display for LookupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupType::ByName(name) => write!(f, "name {name:?}"),
            LookupType::ById(id) => write!(f, "id {id}"),
            LookupType::ByCompositeId(label) => write!(f, "{label}"),
        }
    }
}

impl From<&str> for LookupType {
    fn from(name: &str) -> Self {
        LookupType::ByName(name.to_owned())
    }
}

impl From<Uuid> for LookupType {
    fn from(id: Uuid) -> Self {
        LookupType::ById(id)
    }
}
