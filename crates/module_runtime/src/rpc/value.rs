//! Function identifiers and type-erased call arguments.

use crate::error::RpcError;
use compact_str::CompactString;
use std::any::{self, Any};
use std::fmt;

/// Identifier a handler is registered under.
///
/// Modules expose both named functions (`"normalize"`) and numeric message
/// ids coming straight off the wire; both live in one registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallId {
    Name(CompactString),
    Msg(u32),
}

impl From<&str> for CallId {
    fn from(name: &str) -> Self {
        CallId::Name(CompactString::new(name))
    }
}

impl From<String> for CallId {
    fn from(name: String) -> Self {
        CallId::Name(CompactString::from(name))
    }
}

impl From<u32> for CallId {
    fn from(id: u32) -> Self {
        CallId::Msg(id)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallId::Name(name) => f.write_str(name),
            CallId::Msg(id) => write!(f, "msg#{id}"),
        }
    }
}

/// A single type-erased argument or return value.
///
/// Values are moved, never shared, between the caller and the owning module.
pub struct Arg(Box<dyn Any + Send>);

impl Arg {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Arg(Box::new(value))
    }

    /// Takes the value out as `T`.
    pub fn downcast<T: Any>(self) -> Result<T, RpcError> {
        self.0
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| RpcError::ArgumentType {
                expected: any::type_name::<T>(),
            })
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Arg(..)")
    }
}

/// Ordered call arguments.
pub type Args = Vec<Arg>;

/// Builds an [`Args`] vector from plain values.
///
/// ```
/// use module_runtime::args;
/// let args = args![1u32, "hello".to_string()];
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::rpc::Arg>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::rpc::Arg::new($value)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_from_names_and_numbers() {
        assert_eq!(CallId::from("login"), CallId::Name("login".into()));
        assert_eq!(CallId::from(String::from("login")), CallId::from("login"));
        assert_eq!(CallId::from(7u32), CallId::Msg(7));
        assert_eq!(CallId::from(7u32).to_string(), "msg#7");
        assert_eq!(CallId::from("login").to_string(), "login");
    }

    #[test]
    fn downcast_reports_the_wanted_type() {
        let arg = Arg::new(5u64);
        assert!(arg.is::<u64>());
        assert_eq!(arg.downcast_ref::<u64>(), Some(&5));

        match Arg::new(5u64).downcast::<String>() {
            Err(RpcError::ArgumentType { expected }) => assert!(expected.contains("String")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn args_macro_preserves_order() {
        let args = args![1u8, 2u16, "three"];
        let mut iter = args.into_iter();
        assert_eq!(iter.next().unwrap().downcast::<u8>().unwrap(), 1);
        assert_eq!(iter.next().unwrap().downcast::<u16>().unwrap(), 2);
        assert_eq!(iter.next().unwrap().downcast::<&str>().unwrap(), "three");
        assert!(args![].is_empty());
    }
}
