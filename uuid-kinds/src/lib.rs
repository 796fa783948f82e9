// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A registry for UUID kinds used in Cirrus and related data structures.
//!
//! Every identifier in the orchestration core is a UUID, and it is easy to
//! mix them up: a reservation ID passed where a resource ID is expected
//! compiles just fine if both are untyped UUIDs. The types here attach the
//! kind of object to the UUID at the type level.

pub use newtype_uuid::{GenericUuid, TypedUuid, TypedUuidKind, TypedUuidTag};

macro_rules! impl_typed_uuid_kind {
    ($($kind:ident => $tag:literal),* $(,)?) => {
        $(
            paste::paste! {
                pub enum [< $kind Kind>] {}

                impl TypedUuidKind for [< $kind Kind >] {
                    #[inline]
                    fn tag() -> TypedUuidTag {
                        // `const` ensures that tags are validated at
                        // compile-time.
                        const TAG: TypedUuidTag = TypedUuidTag::new($tag);
                        TAG
                    }
                }

                pub type [< $kind Uuid>] = TypedUuid::<[< $kind Kind >]>;
            }
        )*
    };
}

// Please keep this list in alphabetical order.

impl_typed_uuid_kind! {
    Chain => "chain",
    Cluster => "cluster",
    Instance => "instance",
    Message => "message",
    Nic => "nic",
    Reservation => "reservation",
    Resource => "resource",
    Subscription => "subscription",
    Volume => "volume",
    Zone => "zone",
}
