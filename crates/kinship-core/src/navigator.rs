//! Hard client redirects.
//!
//! A redirect is a full reset of the client: whatever hosts the controller
//! drops its UI state and reloads at the given route.

use std::sync::Mutex;

/// Performs a full client redirect.
pub trait Navigator: Send + Sync {
    fn redirect(&self, route: &str);
}

/// Navigator for headless hosts: logs the redirect and remembers the route.
#[derive(Debug, Default)]
pub struct LogNavigator {
    last: Mutex<Option<String>>,
}

impl LogNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent redirect target, if any.
    pub fn last_route(&self) -> Option<String> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

impl Navigator for LogNavigator {
    fn redirect(&self, route: &str) {
        tracing::info!(route, "Redirecting client");
        if let Ok(mut last) = self.last.lock() {
            *last = Some(route.to_string());
        }
    }
}
