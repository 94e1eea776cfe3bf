//! Dispatch of messages to subscribed handlers.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::message::{Message, MessageKind};
use crate::Result;

/// A pipeline stage.
///
/// `handle` is called once per message of a subscribed kind, in queue
/// order. Follow-up messages go into `out`; an `Err` is reported as a
/// [`Message::Error`] and does not stop the pipeline.
pub trait Handler: Send {
    fn name(&self) -> &'static str;

    /// Message kinds this handler receives.
    fn kinds(&self) -> &'static [MessageKind];

    /// # Errors
    /// Any error is turned into a [`Message::Error`] by the router.
    fn handle(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<()>;

    /// Like [`handle`](Handler::handle), but messages passed to `forward`
    /// are dispatched through the router, follow-ups included, before
    /// `forward` returns. Stages producing bulk data override this so each
    /// piece is consumed before the next is produced.
    ///
    /// # Errors
    /// Any error is turned into a [`Message::Error`] by the router.
    fn handle_forwarding(
        &mut self,
        message: &Message,
        out: &mut Vec<Message>,
        _forward: &mut dyn FnMut(Message),
    ) -> Result<()> {
        self.handle(message, out)
    }
}

/// Stands in for a handler while it is running a forwarding call.
struct Detached;

impl Handler for Detached {
    fn name(&self) -> &'static str {
        "detached"
    }

    fn kinds(&self) -> &'static [MessageKind] {
        &[]
    }

    fn handle(&mut self, _message: &Message, _out: &mut Vec<Message>) -> Result<()> {
        Ok(())
    }
}

/// Maps message kinds to the handlers subscribed to them.
#[derive(Default)]
pub struct Router {
    handlers: Vec<Box<dyn Handler>>,
    routes: HashMap<MessageKind, Vec<usize>>,
    taps: Vec<(Vec<MessageKind>, Sender<Message>)>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a handler to every kind it lists. Handlers registered
    /// earlier see a message first.
    pub fn register(&mut self, handler: Box<dyn Handler>) {
        let index = self.handlers.len();
        for &kind in handler.kinds() {
            self.routes.entry(kind).or_default().push(index);
        }
        log::debug!("registered handler {}", handler.name());
        self.handlers.push(handler);
    }

    /// Returns a receiver that gets a copy of every dispatched message of
    /// the given kinds.
    pub fn tap(&mut self, kinds: &[MessageKind]) -> Receiver<Message> {
        let (tx, rx) = channel();
        self.taps.push((kinds.to_vec(), tx));
        rx
    }

    #[must_use]
    pub fn handlers_for(&self, kind: MessageKind) -> usize {
        self.routes.get(&kind).map_or(0, Vec::len)
    }

    /// Runs every subscribed handler on `message` and returns what they
    /// produced.
    pub fn dispatch(&mut self, message: &Message) -> Vec<Message> {
        let kind = message.kind();
        self.taps.retain(|(kinds, tx)| {
            if kinds.contains(&kind) {
                tx.send(message.clone()).is_ok()
            } else {
                true
            }
        });

        let mut out = Vec::new();
        let Some(indices) = self.routes.get(&kind).cloned() else {
            return out;
        };
        for index in indices {
            // the running handler is detached so forwarded messages can
            // reach every other stage
            let mut handler = std::mem::replace(&mut self.handlers[index], Box::new(Detached));
            let result = handler.handle_forwarding(message, &mut out, &mut |next| {
                self.dispatch_now(next);
            });
            if let Err(err) = result {
                log::warn!("{} failed on {kind:?}: {err}", handler.name());
                out.push(Message::Error(format!("{}: {err}", handler.name())));
            }
            self.handlers[index] = handler;
        }
        out
    }

    /// Dispatches `message` and then its follow-ups, depth first.
    pub fn dispatch_now(&mut self, message: Message) {
        for follow_up in self.dispatch(&message) {
            self.dispatch_now(follow_up);
        }
    }
}
