//! # Wire Codec
//!
//! The single encode/decode boundary for everything that crosses a process: user messages,
//! handshake and membership frames, receptionist ops. Payloads are JSON via `serde_json`.
//!
//! [`crate::ActorRef`] serializes as its [`crate::ActorId`]. Turning an id back into a usable
//! reference needs an actor system, so decoding runs inside [`with_system`], which installs the
//! system as the decoding context for the current thread.

use crate::system::ActorSystem;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Decode failed: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("No actor system installed for decoding actor references")]
    MissingSystemContext,
}

thread_local! {
    static SYSTEM: RefCell<Option<ActorSystem>> = const { RefCell::new(None) };
    static MISSING_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    MISSING_CONTEXT.with(|flag| flag.set(false));
    serde_json::from_slice(bytes).map_err(|e| {
        if MISSING_CONTEXT.with(Cell::get) {
            CodecError::MissingSystemContext
        } else {
            CodecError::Decode(e)
        }
    })
}

/// Runs `f` with `system` installed as the decoding context. Nested calls restore the previous
/// context on exit.
pub fn with_system<R>(system: &ActorSystem, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<ActorSystem>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            SYSTEM.with(|slot| *slot.borrow_mut() = previous);
        }
    }

    let previous = SYSTEM.with(|slot| slot.borrow_mut().replace(system.clone()));
    let _restore = Restore(previous);
    f()
}

/// The system installed by [`with_system`], if any. Records the miss so [`decode`] can report
/// [`CodecError::MissingSystemContext`] instead of a generic decode error.
pub(crate) fn current_system() -> Option<ActorSystem> {
    let system = SYSTEM.with(|slot| slot.borrow().clone());
    if system.is_none() {
        MISSING_CONTEXT.with(|flag| flag.set(true));
    }
    system
}
