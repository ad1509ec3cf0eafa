//! String-backed identifier types shared by the records. All of them
//! serialize as bare strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

pub(crate) use name_type;

name_type!(
    /// Buildpack identifier as declared in `buildpack.toml`, e.g. `acme/node`.
    BuildpackId
);

name_type!(
    /// Layer name, unique within the buildpack that owns it.
    LayerName
);

impl BuildpackId {
    /// Directory name used under the layers and buildpacks directories:
    /// every `/` becomes `_`.
    pub fn escaped(&self) -> String {
        crate::escape_id(&self.0)
    }
}

impl LayerName {
    /// `launch`, `build` and `store` name buildpack-level TOML files, never
    /// layers.
    pub fn is_reserved(&self) -> bool {
        matches!(self.0.as_str(), "launch" | "build" | "store")
    }
}
