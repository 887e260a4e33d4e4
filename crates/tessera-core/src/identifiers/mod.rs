//! Validated identifier types
//!
//! Every name that crosses the plan boundary is a distinct newtype so a
//! `StepId` can never be passed where a `CapabilityName` is expected. They
//! share one rule set (see [`IdValidationError`]) and serialize as plain
//! strings.
//!
//! ```rust
//! use tessera_core::identifiers::{CapabilityName, StepId};
//!
//! let step = StepId::parse("fetch-candidates").unwrap();
//! let capability: CapabilityName = "content-search".parse().unwrap();
//! assert_eq!(step.as_str(), "fetch-candidates");
//! assert_eq!(capability.to_string(), "content-search");
//!
//! assert!(StepId::parse("").is_err());
//! assert!(CapabilityName::parse("bad name").is_err());
//! ```

mod validation;

pub use validation::{IdValidationError, MAX_IDENTIFIER_LEN};

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate `raw` and wrap it.
            pub fn parse(raw: impl AsRef<str>) -> Result<Self, IdValidationError> {
                validation::check(raw.as_ref()).map(|ok| Self(ok.to_owned()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Wrap without checking. Intended for literals in tests and
            /// benches.
            #[doc(hidden)]
            pub fn new_unchecked(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdValidationError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                validation::check(&raw)?;
                Ok(Self(raw))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

identifier! {
    /// Identifier of a step, unique within one plan.
    StepId
}

identifier! {
    /// Name of a capability class such as `content-search` or `recommend`.
    ///
    /// Several handlers may be registered under one name; the registry
    /// orders them by priority.
    CapabilityName
}

identifier! {
    /// One concrete handler serving a capability (e.g. `primary`,
    /// `cache-fallback`).
    HandlerId
}

identifier! {
    /// Identifier of one plan execution.
    PlanId
}

impl HandlerId {
    /// Handler id used when a capability is registered without one.
    pub fn primary() -> Self {
        Self("primary".to_owned())
    }
}

impl PlanId {
    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::generate()
    }
}
