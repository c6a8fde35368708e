//! Registry of callables the local side agrees to execute.
//!
//! Incoming requests name a callable; the registry maps that name to a
//! handler that decodes the work (inside the channel's wire scope, so pipes
//! reconnect), runs it and encodes the [`Outcome`].

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use super::Callable;
use crate::channel::Channel;
use crate::codec::scope;
use crate::request::{Fault, Outcome};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased executor for one callable.
pub(crate) trait Handler: Send + Sync + 'static {
    /// Decode and run the work in `payload`.
    fn call(&self, payload: &[u8], channel: &Channel) -> BoxFuture<'static, Outcome>;
}

/// Handler that decodes the payload as `C` before running it.
struct TypedHandler<C> {
    _phantom: PhantomData<fn() -> C>,
}

impl<C: Callable> Handler for TypedHandler<C> {
    fn call(&self, payload: &[u8], channel: &Channel) -> BoxFuture<'static, Outcome> {
        let (work, deferred) = match scope::decode_from::<C>(channel, payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                let fault = Fault::Malformed(format!("unable to decode {}: {}", C::NAME, e));
                return Box::pin(async move { Outcome::Fault(fault) });
            }
        };

        let channel = channel.clone();
        Box::pin(async move {
            for command in deferred {
                if let Err(e) = channel.send(command).await {
                    return Outcome::Fault(Fault::Aborted(e.to_string()));
                }
            }
            match work.call().await {
                Ok(value) => Outcome::value(&value),
                Err(error) => Outcome::failure(&error),
            }
        })
    }
}

/// Registry mapping callable names to handlers.
#[derive(Default)]
pub struct CallableRegistry {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
}

impl CallableRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow the peer to run `C` on this side.
    ///
    /// Registering the same name twice keeps the later registration.
    pub fn register<C: Callable>(&mut self) {
        let handler = TypedHandler::<C> {
            _phantom: PhantomData,
        };
        if self.handlers.insert(C::NAME, Box::new(handler)).is_some() {
            tracing::debug!("callable {} registered twice", C::NAME);
        }
    }

    /// Whether a callable is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Number of registered callables.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Prepare the work named `name` for execution.
    pub(crate) fn dispatch(
        &self,
        name: &str,
        payload: &[u8],
        channel: &Channel,
    ) -> BoxFuture<'static, Outcome> {
        match self.handlers.get(name) {
            Some(handler) => handler.call(payload, channel),
            None => {
                let fault = Fault::UnknownCallable(name.to_string());
                Box::pin(async move { Outcome::Fault(fault) })
            }
        }
    }
}

impl std::fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Echo(String);

    impl Callable for Echo {
        const NAME: &'static str = "echo";
        type Output = String;
        type Error = ();

        async fn call(self) -> Result<String, ()> {
            Ok(self.0)
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Fail;

    impl Callable for Fail {
        const NAME: &'static str = "fail";
        type Output = ();
        type Error = String;

        async fn call(self) -> Result<(), String> {
            Err("nope".to_string())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CallableRegistry::new();
        assert!(registry.is_empty());

        registry.register::<Echo>();
        registry.register::<Fail>();
        registry.register::<Echo>();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("echo"));
        assert!(registry.contains("fail"));
        assert!(!registry.contains("missing"));

        let mut names: Vec<_> = registry.names().collect();
        names.sort_unstable();
        assert_eq!(names, ["echo", "fail"]);
    }
}
