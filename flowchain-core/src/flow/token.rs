//! Typed state and event names

use std::fmt::Debug;
use std::hash::Hash;

/// A state or event of a flow definition
///
/// Every token has a stable upper-case name. The name is what gets persisted
/// and what the type-erased engine routes on.
pub trait FlowToken: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn all() -> &'static [Self];

    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|token| token.name() == name)
    }
}

/// Declare a state or event enum and implement [`FlowToken`] for it.
///
/// ```ignore
/// flow_tokens! {
///     pub enum SyncState {
///         Init => "INIT_STATE",
///         Final => "FINAL_STATE",
///     }
/// }
/// ```
#[macro_export]
macro_rules! flow_tokens {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::flow::token::FlowToken for $name {
            fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            fn all() -> &'static [Self] {
                &[$(Self::$variant),+]
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::flow::token::FlowToken::name(self))
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($crate::flow::token::FlowToken::name(self))
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                <Self as $crate::flow::token::FlowToken>::from_name(&name).ok_or_else(|| {
                    <D::Error as ::serde::de::Error>::custom(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        name
                    ))
                })
            }
        }
    };
}
