//! Handler shapes.
//!
//! A handler receives exclusive access to the module state plus the call
//! arguments and returns nothing, a single value, or a list of values. The
//! shape is fixed at registration and checked again on every call so callers
//! asking for the wrong arity get an error instead of a silently empty result.

use super::value::{Arg, Args};
use crate::error::RpcError;
use std::any::Any;
use std::fmt;

type UnitFn<S> = Box<dyn Fn(&mut S, Args) + Send + Sync>;
type SingleFn<S> = Box<dyn Fn(&mut S, Args) -> Arg + Send + Sync>;
type MultiFn<S> = Box<dyn Fn(&mut S, Args) -> Vec<Arg> + Send + Sync>;

/// A registered function.
pub enum Handler<S> {
    Unit(UnitFn<S>),
    Single(SingleFn<S>),
    Multi(MultiFn<S>),
}

/// Arity of a handler's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerShape {
    Unit,
    Single,
    Multi,
}

impl HandlerShape {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerShape::Unit => "unit",
            HandlerShape::Single => "single",
            HandlerShape::Multi => "multi",
        }
    }
}

impl fmt::Display for HandlerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<S: 'static> Handler<S> {
    pub fn unit<F>(f: F) -> Self
    where
        F: Fn(&mut S, Args) + Send + Sync + 'static,
    {
        Handler::Unit(Box::new(f))
    }

    /// Wraps a handler returning one value of any sendable type.
    pub fn single<F, R>(f: F) -> Self
    where
        F: Fn(&mut S, Args) -> R + Send + Sync + 'static,
        R: Any + Send,
    {
        Handler::Single(Box::new(move |state: &mut S, args: Args| {
            Arg::new(f(state, args))
        }))
    }

    pub fn multi<F>(f: F) -> Self
    where
        F: Fn(&mut S, Args) -> Vec<Arg> + Send + Sync + 'static,
    {
        Handler::Multi(Box::new(f))
    }
}

impl<S> Handler<S> {
    pub fn shape(&self) -> HandlerShape {
        match self {
            Handler::Unit(_) => HandlerShape::Unit,
            Handler::Single(_) => HandlerShape::Single,
            Handler::Multi(_) => HandlerShape::Multi,
        }
    }

    pub(crate) fn invoke(&self, state: &mut S, args: Args) -> Ret {
        match self {
            Handler::Unit(f) => {
                f(state, args);
                Ret::Unit
            }
            Handler::Single(f) => Ret::Single(f(state, args)),
            Handler::Multi(f) => Ret::Multi(f(state, args)),
        }
    }
}

impl<S> fmt::Debug for Handler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.shape())
    }
}

/// What a handler produced.
#[derive(Debug)]
pub enum Ret {
    Unit,
    Single(Arg),
    Multi(Vec<Arg>),
}

impl Ret {
    pub fn into_single(self) -> Result<Arg, RpcError> {
        match self {
            Ret::Single(arg) => Ok(arg),
            Ret::Multi(mut args) if args.len() == 1 => Ok(args.remove(0)),
            _ => Err(RpcError::ArgumentType {
                expected: "single return value",
            }),
        }
    }

    pub fn into_multi(self) -> Vec<Arg> {
        match self {
            Ret::Unit => Vec::new(),
            Ret::Single(arg) => vec![arg],
            Ret::Multi(args) => args,
        }
    }
}

/// Outcome of a call as delivered back to the caller.
pub type RetInfo = Result<Ret, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn shapes_and_invocation() {
        let mut hits = 0u32;

        let unit = Handler::<u32>::unit(|hits, _| *hits += 1);
        assert_eq!(unit.shape(), HandlerShape::Unit);
        assert!(matches!(unit.invoke(&mut hits, args![]), Ret::Unit));
        assert_eq!(hits, 1);

        let single = Handler::<u32>::single(|hits, args| {
            let add = args.into_iter().next().unwrap().downcast::<u32>().unwrap();
            *hits += add;
            *hits
        });
        let ret = single.invoke(&mut hits, args![4u32]).into_single().unwrap();
        assert_eq!(ret.downcast::<u32>().unwrap(), 5);

        let multi = Handler::<u32>::multi(|hits, _| vec![Arg::new(*hits), Arg::new("done")]);
        assert_eq!(multi.shape(), HandlerShape::Multi);
        let values = multi.invoke(&mut hits, args![]).into_multi();
        assert_eq!(values.len(), 2);
    }
}
