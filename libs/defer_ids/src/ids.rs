use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, backend-specific identifier for a VM in its hypervisor.
///
/// Never parsed or interpreted by the engine: it is handed back to the owning
/// driver verbatim.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmId(String);

/// Identifier of the service (driver instance) that owns a [`VmId`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceUuid(String);

macro_rules! opaque_string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $ty {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $ty {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_string_id!(VmId);
opaque_string_id!(ServiceUuid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let vmid = VmId::new("vm-123");
        let json = serde_json::to_string(&vmid).unwrap();
        let back: VmId = serde_json::from_str(&json).unwrap();
        assert_eq!(vmid, back);
    }

    #[test]
    fn display_is_the_raw_string() {
        let uuid = ServiceUuid::from("8f14e45f-ceea-4c1d");
        assert_eq!(uuid.to_string(), "8f14e45f-ceea-4c1d");
        assert_eq!(uuid.as_str(), "8f14e45f-ceea-4c1d");
    }
}
