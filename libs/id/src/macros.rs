//! Macros for defining typed ID types.

/// Macro to define a typed ID with a specific generation prefix.
///
/// This generates a newtype wrapper around a validated alphanumeric token with:
/// - A `PREFIX` constant used when minting fresh IDs
/// - `new()` to generate a fresh ID (`{prefix}{ulid}`, lowercase)
/// - `parse()` to validate an existing token
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// Parsing does not require the prefix: pools and machines are often named
/// by the host (`env1`, `m7`), and those tokens must round-trip unchanged.
///
/// # Example
///
/// ```ignore
/// define_id!(PoolId, "pool");
///
/// let fresh = PoolId::new();
/// let parsed: PoolId = "env1".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix used for generated IDs of this type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(format!(
                    "{}{}",
                    Self::PREFIX,
                    $crate::Ulid::new().to_string().to_ascii_lowercase()
                ))
            }

            /// Parses an ID from a string.
            ///
            /// The string must be a non-empty run of ASCII letters and digits.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate_token(s)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the token as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the ID, returning the owned token.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                $crate::validate_token(&s)?;
                Ok(Self(s))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::try_from(s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
