//! Matches notifications to the command waiting for them.
//!
//! At most one wait can be outstanding per opcode. A wait is created with
//! [`Correlator::register`], completed by [`Correlator::resolve`] when the
//! matching notification arrives, and consumed with
//! [`PendingResponse::await_result`]. Dropping a [`PendingResponse`] removes its
//! registration, so a cancelled caller never leaves a stale entry behind.

use crate::tokio_common::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Waiter {
    ticket: u64,
    sender: oneshot::Sender<Vec<u8>>,
}

/// Per-opcode table of outstanding waits.
#[derive(Default)]
pub struct Correlator {
    waiters: Mutex<HashMap<u8, Waiter>>,
    next_ticket: Mutex<u64>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<u8, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a wait for `opcode` that expires at `deadline`.
    ///
    /// Fails with [`Error::AlreadyAwaiting`] if a wait for the opcode exists.
    pub fn register(self: &Arc<Self>, opcode: u8, deadline: Instant) -> Result<PendingResponse> {
        let ticket = {
            let mut next = self.next_ticket.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let (sender, receiver) = oneshot::channel();
        let mut waiters = self.waiters();
        if waiters.contains_key(&opcode) {
            return Err(Error::AlreadyAwaiting(opcode));
        }
        waiters.insert(opcode, Waiter { ticket, sender });
        log::trace!("Awaiting response to 0x{opcode:02X} (ticket {ticket})");

        Ok(PendingResponse {
            opcode,
            ticket,
            registered: Instant::now(),
            deadline,
            receiver,
            correlator: Arc::clone(self),
        })
    }

    /// Delivers `frame` to the wait registered for `opcode`.
    ///
    /// Returns `false` if nobody was waiting; the frame is dropped in that case.
    pub fn resolve(&self, opcode: u8, frame: &[u8]) -> bool {
        let Some(waiter) = self.waiters().remove(&opcode) else {
            log::debug!("No pending request for 0x{opcode:02X}, dropping frame");
            return false;
        };
        if waiter.sender.send(frame.to_vec()).is_err() {
            log::debug!("Request for 0x{opcode:02X} was abandoned, dropping frame");
            return false;
        }
        true
    }

    /// Abandons the wait registered for `opcode`, the waiter sees [`Error::Cancelled`].
    pub fn cancel(&self, opcode: u8) -> bool {
        self.waiters().remove(&opcode).is_some()
    }

    /// Returns `true` while a wait for `opcode` is registered.
    pub fn is_awaiting(&self, opcode: u8) -> bool {
        self.waiters().contains_key(&opcode)
    }

    fn release(&self, opcode: u8, ticket: u64) {
        let mut waiters = self.waiters();
        if waiters.get(&opcode).is_some_and(|waiter| waiter.ticket == ticket) {
            waiters.remove(&opcode);
        }
    }
}

/// An outstanding wait for one opcode.
pub struct PendingResponse {
    opcode: u8,
    ticket: u64,
    registered: Instant,
    deadline: Instant,
    receiver: oneshot::Receiver<Vec<u8>>,
    correlator: Arc<Correlator>,
}

impl PendingResponse {
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Waits until the response frame arrives or the deadline elapses.
    ///
    /// On timeout the registration is removed and a frame arriving later is
    /// dropped by [`Correlator::resolve`].
    pub async fn await_result(mut self) -> Result<Vec<u8>> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::Cancelled(self.opcode)),
            Err(_) => {
                self.correlator.release(self.opcode, self.ticket);
                log::warn!("No response received for command 0x{:02X}", self.opcode);
                Err(Error::ResponseTimeout {
                    opcode: self.opcode,
                    timeout: self.deadline.saturating_duration_since(self.registered),
                })
            }
        }
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("opcode", &format_args!("0x{:02X}", self.opcode))
            .field("ticket", &self.ticket)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.correlator.release(self.opcode, self.ticket);
    }
}
