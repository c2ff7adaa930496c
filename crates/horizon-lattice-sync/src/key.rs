//! Identifier types accepted by the keyed primitives.
//!
//! Any hashable, comparable value can identify a once-guard entry, a throttle
//! slot or a task chain, including tuples of such values. A key may also be
//! *absent* (`None`, a blank string), which the primitives reject with
//! [`SyncError::InvalidArgument`](crate::SyncError::InvalidArgument).
//!
//! User types opt in with an empty impl:
//!
//! ```
//! use horizon_lattice_sync::Key;
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! struct DocumentId(u32);
//!
//! impl Key for DocumentId {}
//! ```

use std::any::TypeId;
use std::fmt::Debug;
use std::hash::Hash;

/// A value usable as an identifier for keyed coordination state.
pub trait Key: Hash + Eq + Clone + Debug + Send + Sync + 'static {
    /// Returns `true` if this key stands for "no identifier".
    fn is_absent(&self) -> bool {
        false
    }
}

macro_rules! impl_key {
    ($($ty:ty),* $(,)?) => {
        $(impl Key for $ty {})*
    };
}

impl_key!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char, TypeId, ()
);

impl Key for String {
    fn is_absent(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Key for &'static str {
    fn is_absent(&self) -> bool {
        self.trim().is_empty()
    }
}

impl<K: Key> Key for Option<K> {
    fn is_absent(&self) -> bool {
        self.as_ref().is_none_or(Key::is_absent)
    }
}

macro_rules! impl_tuple_key {
    ($($name:ident),+) => {
        impl<$($name: Key),+> Key for ($($name,)+) {
            #[allow(non_snake_case)]
            fn is_absent(&self) -> bool {
                let ($($name,)+) = self;
                false $(|| $name.is_absent())+
            }
        }
    };
}

impl_tuple_key!(A);
impl_tuple_key!(A, B);
impl_tuple_key!(A, B, C);
impl_tuple_key!(A, B, C, D);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_keys_are_present() {
        assert!(!42u32.is_absent());
        assert!(!"save".is_absent());
        assert!(!TypeId::of::<String>().is_absent());
    }

    #[test]
    fn test_blank_strings_are_absent() {
        assert!("".is_absent());
        assert!("   ".is_absent());
        assert!(String::new().is_absent());
    }

    #[test]
    fn test_option_keys() {
        assert!(None::<u32>.is_absent());
        assert!(!Some(1u32).is_absent());
        assert!(Some(String::new()).is_absent());
    }

    #[test]
    fn test_tuple_keys() {
        assert!(!("file", 3u64).is_absent());
        assert!(("", 3u64).is_absent());
        assert!(("file", None::<u8>, 'x').is_absent());
    }
}
