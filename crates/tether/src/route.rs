//! Route registry: lower-cased route keys dispatching to typed handlers.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use tether_proto::Message;

use crate::session::Session;

/// Msg-id sink for request payload structs.
///
/// A struct registered through [`Scope::request`] receives the wire
/// message id via [`RequestMeta::set_msg_id`] right after decode, so a
/// handler can hand the value back to [`Session::respond`] for
/// correlation. The id field itself should be skipped during
/// deserialization (`#[serde(skip)]`).
pub trait RequestMeta {
    fn set_msg_id(&mut self, id: u64);
    fn msg_id(&self) -> u64;
}

type BoxedHandler = Box<dyn Fn(&Arc<Session>, &Message) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {route} is already registered")]
    DuplicateRoute { route: String },
}

/// Registry mapping lower-cased `prefix.name` keys to handlers.
///
/// Registration happens once at server construction; dispatch runs on the
/// connection read path, so handlers are invoked synchronously and in
/// receive order for any one connection.
#[derive(Default)]
pub struct Router {
    rules: HashMap<String, BoxedHandler>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope subsequent registrations under `prefix`.
    pub fn scope(&mut self, prefix: &str) -> Scope<'_> {
        Scope {
            router: self,
            prefix: prefix.to_string(),
        }
    }

    fn insert(&mut self, key: String, handler: BoxedHandler) -> Result<(), RouteError> {
        if self.rules.contains_key(&key) {
            return Err(RouteError::DuplicateRoute { route: key });
        }
        tracing::info!(route = %key, "route registered");
        self.rules.insert(key, handler);
        Ok(())
    }

    /// Dispatch a decoded message on the caller's thread.
    ///
    /// Unknown routes and undecodable payloads are logged and dropped;
    /// the connection stays up. A panicking handler is contained.
    pub(crate) fn dispatch(&self, session: &Arc<Session>, msg: &Message) {
        let Some(handler) = self.rules.get(&msg.route) else {
            tracing::warn!(route = %msg.route, "unhandled route");
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(session, msg))).is_err() {
            tracing::error!(route = %msg.route, "handler panicked");
        }
    }
}

/// Registration handle prefixing every route with a service name.
pub struct Scope<'a> {
    router: &'a mut Router,
    prefix: String,
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("prefix", &self.prefix).finish()
    }
}

impl Scope<'_> {
    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name).to_lowercase()
    }

    /// Register a handler receiving the raw payload bytes.
    pub fn raw<F>(&mut self, name: &str, f: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Arc<Session>, &[u8]) + Send + Sync + 'static,
    {
        self.router.insert(
            self.key(name),
            Box::new(move |session, msg| f(session, &msg.data)),
        )?;
        Ok(self)
    }

    /// Register a handler receiving a freshly JSON-decoded payload.
    pub fn json<T, F>(&mut self, name: &str, f: F) -> Result<&mut Self, RouteError>
    where
        T: DeserializeOwned,
        F: Fn(&Arc<Session>, T) + Send + Sync + 'static,
    {
        let key = self.key(name);
        self.router.insert(
            key.clone(),
            Box::new(move |session, msg| match serde_json::from_slice::<T>(&msg.data) {
                Ok(arg) => f(session, arg),
                Err(err) => tracing::error!(route = %key, %err, "payload decode failed"),
            }),
        )?;
        Ok(self)
    }

    /// Register a request handler: the payload decodes as JSON and the
    /// message id is stored through [`RequestMeta`] before invocation.
    pub fn request<T, F>(&mut self, name: &str, f: F) -> Result<&mut Self, RouteError>
    where
        T: DeserializeOwned + RequestMeta,
        F: Fn(&Arc<Session>, T) + Send + Sync + 'static,
    {
        let key = self.key(name);
        self.router.insert(
            key.clone(),
            Box::new(move |session, msg| match serde_json::from_slice::<T>(&msg.data) {
                Ok(mut arg) => {
                    arg.set_msg_id(msg.id);
                    f(session, arg);
                }
                Err(err) => tracing::error!(route = %key, %err, "payload decode failed"),
            }),
        )?;
        Ok(self)
    }
}
