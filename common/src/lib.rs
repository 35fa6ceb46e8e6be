// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and helpers shared by every layer of the rampart control plane.
//!
//! This crate deliberately knows nothing about planning or execution; it
//! holds the common error type and the addressing math that both sides
//! agree on.

pub mod address;
pub mod error;

pub use error::Error;
pub use error::LookupType;
pub use error::ResourceType;
