//! Telemetry and control client for the rover vehicle service.
//!
//! [`Client`] ties the pieces together: a [`connection::Session`] whose
//! receive thread feeds a [`dispatcher::MessageDispatcher`], plus an optional
//! [`poller::PollScheduler`] asking for fresh data.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod poller;
pub mod thread_util;

pub use client::{Client, ClientHandles, CommandError};
pub use config::{ClientConfig, ConfigError, LogLevel};
pub use connection::{ConnectionError, ConnectionState};
pub use dispatcher::{DisplayHandle, DisplayState, Notice};
