//! # Ask
//!
//! A one-shot promise registered under `/temp/ask-N`. It is addressable like any actor (so the
//! reply reference can travel over the network), watches the target, and completes exactly once.

use crate::actor_ref::{ActorRef, MessageSink};
use crate::cell::{decode_payload, ErasedCell};
use crate::dead_letters::{DeadLetterReason, Undelivered};
use crate::error::FrameworkError;
use crate::identity::{ActorId, ActorPath};
use crate::message::{Message, SystemMessage};
use crate::system::ActorSystem;
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

type Completion<R> = oneshot::Sender<Result<R, FrameworkError>>;

struct PromiseCell<R> {
    id: ActorId,
    completion: Mutex<Option<Completion<R>>>,
}

impl<R: Message> PromiseCell<R> {
    fn complete(&self, result: Result<R, FrameworkError>) -> Result<(), Result<R, FrameworkError>> {
        let completion = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match completion {
            Some(sender) => sender.send(result),
            None => Err(result),
        }
    }
}

impl<R: Message> MessageSink<R> for PromiseCell<R> {
    fn tell(&self, _target: &ActorId, message: R) -> Result<(), Undelivered> {
        self.complete(Ok(message)).map_err(|rejected| match rejected {
            Ok(message) => Undelivered::of(&message, DeadLetterReason::Terminated),
            Err(e) => Undelivered {
                message: e.to_string(),
                reason: DeadLetterReason::Terminated,
            },
        })
    }
}

impl<R: Message> ErasedCell for PromiseCell<R> {
    fn id(&self) -> ActorId {
        self.id.clone()
    }

    fn send_system(&self, message: SystemMessage) -> Result<(), SystemMessage> {
        match message {
            SystemMessage::Terminated { id, .. } => {
                let _ = self.complete(Err(FrameworkError::AskTargetTerminated(id)));
                Ok(())
            }
            other => Err(other),
        }
    }

    fn deliver_encoded(
        &self,
        target: &ActorId,
        type_tag: &str,
        payload: &[u8],
        system: &ActorSystem,
    ) -> Result<(), Undelivered> {
        let message = decode_payload::<R>(type_tag, payload, system)?;
        self.tell(target, message)
    }

    fn sink_any(self: Arc<Self>) -> Box<dyn Any + Send + Sync> {
        Box::new(self as Arc<dyn MessageSink<R>>)
    }
}

/// Removes the promise and its watch when the ask finishes or is dropped.
struct PromiseGuard {
    system: ActorSystem,
    path: ActorPath,
    promise: ActorId,
    target: ActorId,
}

impl Drop for PromiseGuard {
    fn drop(&mut self) {
        self.system.remove_cell(&self.path);
        self.system.deliver_system(
            &self.target,
            SystemMessage::Unwatch {
                watchee: self.target.clone(),
                watcher: self.promise.clone(),
            },
        );
    }
}

pub(crate) struct Promise<R> {
    response: oneshot::Receiver<Result<R, FrameworkError>>,
    _guard: PromiseGuard,
}

impl<R: Message> Promise<R> {
    pub(crate) fn register(
        system: &ActorSystem,
        target: &ActorId,
    ) -> Result<(ActorRef<R>, Self), FrameworkError> {
        let path = ActorPath::temp().child(&system.ask_name())?;
        let id = ActorId::new(system.node().clone(), path.clone(), 1);
        let (completion, response) = oneshot::channel();
        let cell = Arc::new(PromiseCell {
            id: id.clone(),
            completion: Mutex::new(Some(completion)),
        });
        let erased: Arc<dyn ErasedCell> = cell.clone();
        system.register_cell(path.clone(), erased)?;
        let sink: Arc<dyn MessageSink<R>> = cell;
        let reply_to = ActorRef::new(id.clone(), sink, system.clone());
        let promise = Self {
            response,
            _guard: PromiseGuard {
                system: system.clone(),
                path,
                promise: id,
                target: target.clone(),
            },
        };
        Ok((reply_to, promise))
    }

    pub(crate) async fn wait(mut self, timeout: Duration) -> Result<R, FrameworkError> {
        match tokio::time::timeout(timeout, &mut self.response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FrameworkError::ActorDropped),
            Err(_) => Err(FrameworkError::AskTimeout(timeout)),
        }
    }
}
