//! Identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident, $gen:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(
            /// Raw id string.
            pub String,
        );

        impl $name {
            /// Generates a fresh id.
            pub fn new() -> Self {
                Self($gen)
            }

            /// Wraps an existing id string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(
    /// Id of a queue entry. ULIDs sort by creation time.
    QueueId,
    Ulid::new().to_string()
);
id_newtype!(
    /// Id of a user-facing task record.
    TaskId,
    Uuid::new_v4().to_string()
);
