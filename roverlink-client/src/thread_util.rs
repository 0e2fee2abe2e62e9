//! Helper for spawning named background threads
//!
//! Named threads show up in panic messages and debuggers, which makes the
//! receive loop and the poller easy to tell apart.

use log::debug;
use std::io;
use std::thread::JoinHandle;

/// Spawn a thread with the given name.
///
/// # Example
/// ```ignore
/// spawn_named("roverlink-rx", || { /* ... */ })?;
/// ```
pub fn spawn_named<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = std::thread::Builder::new().name(name.to_string()).spawn(f)?;
    debug!("Spawned thread '{name}'");
    Ok(handle)
}
