// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared across component boundaries

pub mod error;

pub use error::Error;
pub use error::ErrorClass;
pub use error::InternalContext;
pub use error::ResourceType;
