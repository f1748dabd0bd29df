//! Engine collaborator boundary.
//!
//! The broker never speaks to a database itself. It opens connections through
//! a [`Driver`] and hands out [`Connection`] trait objects; the relational
//! engine behind them is opaque. The broker is also a [`Driver`], which lets it
//! be chained in front of the engine's own driver through a
//! [`DriverRouter`](crate::router::DriverRouter).

use std::collections::HashMap;

use crate::error::BrokerResult;

/// Property key carrying the login name of an open request.
pub const USER_PROPERTY: &str = "user";
/// Property key carrying the password of an open request.
pub const PASSWORD_PROPERTY: &str = "password";

/// String properties accompanying a connection request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties carrying a `user` and, if given, a `password`.
    pub fn with_credentials(user: &str, password: Option<&str>) -> Self {
        let props = Self::new().with(USER_PROPERTY, user);
        match password {
            Some(password) => props.with(PASSWORD_PROPERTY, password),
            None => props,
        }
    }

    /// Builder method: set a property.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn user(&self) -> Option<&str> {
        self.get(USER_PROPERTY)
    }

    pub fn password(&self) -> Option<&str> {
        self.get(PASSWORD_PROPERTY)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Description of a property understood by a driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    /// Current value, taken from the request properties when present.
    pub value: Option<String>,
    pub description: String,
    pub required: bool,
}

/// A live link to a database.
///
/// Implementations must tolerate `close()` being called more than once.
pub trait Connection: Send + std::fmt::Debug {
    /// Execute a statement and return the engine's reply.
    fn execute(&mut self, statement: &str) -> BrokerResult<String>;
    /// Liveness ping. Returns `true` if the connection is usable.
    fn is_valid(&mut self) -> bool;
    /// Whether `close()` has already been called.
    fn is_closed(&self) -> bool;
    /// Close the underlying link.
    fn close(&mut self) -> BrokerResult<()>;
}

/// Opens connections for the URLs it recognises.
pub trait Driver: Send + Sync {
    /// Open a connection. Returns `Ok(None)` when the URL is not handled by
    /// this driver, so that callers can try the next one.
    fn connect(&self, url: &str, props: &Properties) -> BrokerResult<Option<Box<dyn Connection>>>;
    /// Whether this driver handles `url`.
    fn accepts_url(&self, url: &str) -> bool;
    /// Properties this driver understands for `url`.
    fn property_info(&self, url: &str, props: &Properties) -> Vec<PropertyInfo>;
    fn major_version(&self) -> u32;
    fn minor_version(&self) -> u32;
    /// Whether the driver passes the engine's compliance suite.
    fn is_compliant(&self) -> bool;
}
