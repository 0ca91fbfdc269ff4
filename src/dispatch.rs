//! Message dispatch: routing assembled messages to interested parties.
//!
//! A [`Dispatcher`] is an ordered list of `(predicate, handler)`
//! registrations. Every completed [`ControlMessage`] is offered to each
//! registration in registration order; each one whose predicate matches has
//! its handler invoked once with the message. A message may match any
//! number of registrations, or none.
//!
//! The connection installs two default registrations at startup: replies
//! (`2xx`/`4xx`/`5xx`) are forwarded to the command pipeline, and `650`
//! events reach the subscriptions created by
//! [`Controller::watch_event`](crate::Controller::watch_event). Further
//! registrations can tap the stream for diagnostics.
//!
//! Registration returns an id usable for deregistration; the public
//! deregistration surface is [`EventSubscription`](crate::EventSubscription).

use tracing::trace;

use crate::framing::ControlMessage;

/// Decides whether a handler should see a message.
pub type Predicate = Box<dyn Fn(&ControlMessage) -> bool + Send>;

/// Receives matching messages.
pub type Handler = Box<dyn Fn(&ControlMessage) + Send>;

/// Opaque identifier for one dispatcher registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Registration {
    id: RegistrationId,
    predicate: Predicate,
    handler: Handler,
}

/// Ordered table of `(predicate, handler)` registrations.
#[derive(Default)]
pub struct Dispatcher {
    next_id: u64,
    entries: Vec<Registration>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a registration; later registrations are evaluated later.
    pub fn register(&mut self, predicate: Predicate, handler: Handler) -> RegistrationId {
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        self.entries.push(Registration {
            id,
            predicate,
            handler,
        });
        id
    }

    /// Removes a registration. Returns false if the id was already gone.
    pub fn unregister(&mut self, id: RegistrationId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Offers a message to every registration, in registration order.
    pub fn dispatch(&self, message: &ControlMessage) {
        let mut matched = false;
        for entry in &self.entries {
            if (entry.predicate)(message) {
                matched = true;
                (entry.handler)(message);
            }
        }
        if !matched {
            trace!(status = message.status, "message matched no dispatch registration");
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no registrations exist.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registrations", &self.entries.len())
            .finish()
    }
}
