//! Named lifecycle participants started and stopped by the reactor.

use std::fmt;

use crate::dispatch::{invoke_guarded, CallbackError, Dispatch};

/// A lifecycle participant.
///
/// `start` runs in registration order when the reactor begins running;
/// `stop` runs in reverse order when it is asked to quit. Both are invoked
/// only from the reactor thread.
pub trait Service: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<(), CallbackError>;

    fn stop(&mut self) -> Result<(), CallbackError>;
}

/// Adapter building a [`Service`] from a pair of closures.
pub struct ServiceFns<S, T> {
    name: String,
    start: S,
    stop: T,
}

impl<S, T> ServiceFns<S, T>
where
    S: FnMut() -> Result<(), CallbackError> + Send,
    T: FnMut() -> Result<(), CallbackError> + Send,
{
    pub fn new(name: impl Into<String>, start: S, stop: T) -> Self {
        ServiceFns {
            name: name.into(),
            start,
            stop,
        }
    }
}

impl<S, T> Service for ServiceFns<S, T>
where
    S: FnMut() -> Result<(), CallbackError> + Send,
    T: FnMut() -> Result<(), CallbackError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), CallbackError> {
        (self.start)()
    }

    fn stop(&mut self) -> Result<(), CallbackError> {
        (self.stop)()
    }
}

struct Registered {
    service: Box<dyn Service>,
    active: bool,
}

/// Ordered list of services; no locking because the reactor alone drives it
/// at its state transitions.
pub struct ServiceRegistry {
    services: Vec<Registered>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            services: Vec::new(),
        }
    }

    pub fn register(&mut self, service: Box<dyn Service>) {
        self.services.push(Registered {
            service,
            active: false,
        });
    }

    /// Drop a service by name before the reactor starts. Returns whether a
    /// service with that name was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.services.len();
        self.services.retain(|r| r.service.name() != name);
        self.services.len() != before
    }

    /// Start services in registration order. A failing service is logged
    /// and left inactive; the others still start.
    pub fn start_all(&mut self) {
        for registered in &mut self.services {
            let name = DisplayName(registered.service.name().to_owned());
            let verdict = invoke_guarded("service start", &name, || {
                registered.service.start()?;
                Ok(Dispatch::Continue)
            });
            registered.active = verdict.is_continue();
            if registered.active {
                log::debug!("service {name} started");
            }
        }
    }

    /// Stop active services in reverse registration order, each inside its
    /// own catch so one failure does not block the rest.
    pub fn stop_all(&mut self) {
        for registered in self.services.iter_mut().rev() {
            if !registered.active {
                continue;
            }
            let name = DisplayName(registered.service.name().to_owned());
            invoke_guarded("service stop", &name, || {
                registered.service.stop()?;
                Ok(Dispatch::Continue)
            });
            registered.active = false;
            log::debug!("service {name} stopped");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

struct DisplayName(String);

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording(
        name: &str,
        journal: &Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    ) -> Box<dyn Service> {
        let start_journal = Arc::clone(journal);
        let stop_journal = Arc::clone(journal);
        let start_name = name.to_owned();
        let stop_name = name.to_owned();
        Box::new(ServiceFns::new(
            name,
            move || {
                if fail_start {
                    return Err("refused to start".into());
                }
                start_journal.lock().unwrap().push(format!("start {start_name}"));
                Ok(())
            },
            move || {
                stop_journal.lock().unwrap().push(format!("stop {stop_name}"));
                Ok(())
            },
        ))
    }

    #[test]
    fn test_start_order_and_reverse_stop_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ServiceRegistry::new();
        registry.register(recording("a", &journal, false));
        registry.register(recording("b", &journal, false));

        registry.start_all();
        registry.stop_all();

        let entries = journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["start a", "start b", "stop b", "stop a"]);
    }

    #[test]
    fn test_failed_start_is_not_stopped() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ServiceRegistry::new();
        registry.register(recording("ok", &journal, false));
        registry.register(recording("bad", &journal, true));

        registry.start_all();
        registry.stop_all();

        let entries = journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["start ok", "stop ok"]);
    }

    #[test]
    fn test_unregister_by_name() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ServiceRegistry::new();
        registry.register(recording("a", &journal, false));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stop_all_is_idempotent() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ServiceRegistry::new();
        registry.register(recording("a", &journal, false));

        registry.start_all();
        registry.stop_all();
        registry.stop_all();

        assert_eq!(journal.lock().unwrap().len(), 2);
    }
}
