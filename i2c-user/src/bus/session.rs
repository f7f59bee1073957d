//! Session context and the transfer handoff engine.
//!
//! A [`Session`] is the rendezvous point between requesters, which call
//! [`Session::transfer`], and the single external agent, which drives the
//! device-file handlers. All protocol state lives behind one mutex. Every
//! transition wakes every waiter, and each waiter re-checks its own
//! predicate against the new [`State`].
//!
//! ```text
//!            transfer                       agent fetch
//!   Idle ─────────────▶ AwaitMsgHdr ──────────────────────┐
//!    │                                                    ▼
//!    │ agent fetch           transfer            AwaitWritePayload /
//!    └──────────▶ W4NextRequest ───────────────▶ AwaitReadPayload
//!                                                         │ payload
//!                       ┌── NextMessagePending ◀──────────┤
//!                       │        (fetch)                  ▼
//!                       └──────────────────────▶ Ready / Aborted ──▶ Idle
//! ```
//!
//! Closing the session moves any state to `Terminated`, which every wait
//! predicate accepts, so nobody stays blocked.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{
    functionality::Functionality,
    msg::{Message, MsgHeader, Transaction},
    state::{self, Predicate, State},
};
use crate::{
    error::{Error, Result},
    tracing::prelude::*,
};

/// Per-adapter shared state.
pub struct Session {
    name: String,
    inner: Mutex<Inner>,
    changed: Notify,
}

struct Inner {
    state: State,
    functionality: Functionality,
    txn: Option<Transaction>,
    /// The agent is parked in a fetch with no header presented yet.
    agent_waiting: bool,
}

impl Session {
    pub fn new(name: impl Into<String>, functionality: Functionality) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: State::Idle,
                functionality,
                txn: None,
                agent_waiting: false,
            }),
            changed: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn functionality(&self) -> Functionality {
        self.lock().functionality
    }

    /// Cursor of the active transaction, if one is installed.
    pub fn cursor(&self) -> Option<usize> {
        self.lock().txn.as_ref().map(Transaction::cursor)
    }

    /// Execute a transaction through the external agent.
    ///
    /// Blocks until a previous transfer on this session settles, then until
    /// the agent has serviced every message. Returns the number of messages
    /// completed. On success, read messages hold the received data and write
    /// messages are truncated to what the agent consumed.
    ///
    /// Dropping the returned future cancels the request. Before the agent
    /// has seen the transaction this restores the previous state exactly;
    /// afterwards the session returns to `Idle` and the agent's next payload
    /// operation fails.
    pub async fn transfer(&self, msgs: &mut [Message]) -> Result<usize> {
        let txn = Transaction::new(msgs)?;
        let count = txn.len();

        let prev = self
            .wait_then(state::admits_request, |inner| {
                if inner.state == State::Terminated {
                    return Err(Error::Terminated);
                }
                let prev = inner.state;
                let next = match (prev, txn.current()) {
                    (State::W4NextRequest, Some(first)) => State::payload_for(first),
                    _ => State::AwaitMsgHdr,
                };
                inner.txn = Some(txn);
                self.transition(inner, next);
                Ok(prev)
            })
            .await?;

        debug!(bus = %self.name, messages = count, "Transfer admitted");

        let mut pending = PendingTransfer {
            session: self,
            prev,
            armed: true,
        };
        let (outcome, txn) = self
            .wait_then(state::transfer_settled, |inner| {
                let outcome = inner.state;
                let txn = inner.txn.take();
                if outcome != State::Terminated {
                    self.transition(inner, State::Idle);
                }
                (outcome, txn)
            })
            .await;
        pending.armed = false;

        let completed = txn.as_ref().map_or(0, Transaction::cursor);
        match outcome {
            State::Ready => {
                if let Some(txn) = txn {
                    txn.write_back(msgs);
                }
                debug!(bus = %self.name, completed, "Transfer complete");
                Ok(completed)
            }
            State::Aborted => {
                if let Some(txn) = txn {
                    txn.write_back(msgs);
                }
                debug!(bus = %self.name, completed, count, "Transfer aborted");
                Err(Error::Aborted { completed })
            }
            _ => Err(Error::Terminated),
        }
    }

    /// [`Session::transfer`], interrupted when `cancel` fires.
    pub async fn transfer_cancellable(
        &self,
        msgs: &mut [Message],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        tokio::select! {
            biased;
            result = self.transfer(msgs) => result,
            _ = cancel.cancelled() => {
                debug!(bus = %self.name, "Transfer interrupted");
                Err(Error::Interrupted)
            }
        }
    }

    /// Address-phase fetch for the agent.
    ///
    /// Returns the header of the next message to service, blocking until a
    /// requester supplies one. Fails immediately once the session is
    /// terminated. Fetching while a payload is still due is a protocol
    /// violation.
    pub(crate) async fn fetch_header(&self) -> Result<MsgHeader> {
        {
            let mut inner = self.lock();
            if inner.state.is_payload() {
                self.violation(&mut inner, "header fetch while a payload is due");
                return Err(Error::Io);
            }
        }

        let queued = self
            .wait_then(state::fetch_possible, |inner| match inner.state {
                State::Terminated => Err(Error::Terminated),
                State::Idle => {
                    inner.agent_waiting = true;
                    self.transition(inner, State::W4NextRequest);
                    Ok(None)
                }
                _ => self.present_header(inner).map(Some),
            })
            .await?;
        if let Some(header) = queued {
            return Ok(header);
        }

        let mut waiting = WaitingAgent {
            session: self,
            armed: true,
        };
        let header = self
            .wait_then(state::header_presented, |inner| match inner.state {
                State::Terminated => Err(Error::Terminated),
                _ => self.present_header(inner),
            })
            .await;
        waiting.armed = false;
        header
    }

    /// Agent pulls the current write message's payload into `out`.
    ///
    /// Returns `None` when no write payload is due, meaning the caller is
    /// in the address stage.
    pub(crate) fn try_pull_payload(&self, out: &mut [u8]) -> Result<Option<usize>> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            State::Terminated => Err(Error::Terminated),
            State::AwaitWritePayload => self
                .complete_payload(&mut inner, |buf| {
                    let n = buf.len().min(out.len());
                    out[..n].copy_from_slice(&buf[..n]);
                    n
                })
                .map(Some),
            State::AwaitReadPayload => {
                self.violation(&mut inner, "payload pull for a read message");
                Err(Error::Io)
            }
            _ => Ok(None),
        }
    }

    /// Agent pushes the current read message's payload from `data`.
    pub(crate) fn push_payload(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            State::Terminated => Err(Error::Terminated),
            State::AwaitReadPayload => self.complete_payload(&mut inner, |buf| {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }),
            State::AwaitWritePayload => {
                self.violation(&mut inner, "payload push for a write message");
                Err(Error::Io)
            }
            _ => {
                self.violation(&mut inner, "payload push with no payload due");
                Err(Error::Io)
            }
        }
    }

    /// Override the advertised capability mask.
    pub(crate) fn set_functionality(&self, mask: Functionality) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == State::Terminated {
            return Err(Error::Terminated);
        }
        if inner.txn.is_some() {
            return Err(Error::Busy);
        }
        debug!(bus = %self.name, mask = %format!("{:#010x}", mask.bits()), "Functionality set");
        inner.functionality = mask;
        Ok(())
    }

    /// Force `Terminated` and release every blocked participant.
    pub(crate) fn terminate(&self) {
        let mut inner = self.lock();
        if inner.state != State::Terminated {
            debug!(bus = %self.name, state = ?inner.state, "Terminating session");
            self.transition(&mut inner, State::Terminated);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, next: State) {
        trace!(bus = %self.name, from = ?inner.state, to = ?next, "State transition");
        inner.state = next;
        self.changed.notify_waiters();
    }

    /// Wait until `ready` holds, then run `f` under the same lock.
    async fn wait_then<R>(&self, ready: Predicate, f: impl FnOnce(&mut Inner) -> R) -> R {
        loop {
            // Register before checking so a transition in between is not lost
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if ready(inner.state) {
                    return f(&mut *inner);
                }
            }

            notified.await;
        }
    }

    fn present_header(&self, inner: &mut Inner) -> Result<MsgHeader> {
        let Some(txn) = inner.txn.as_mut() else {
            return Err(Error::Io);
        };
        let (header, next) = match (txn.header(), txn.current()) {
            (Some(header), Some(msg)) => (header, State::payload_for(msg)),
            _ => return Err(Error::Io),
        };
        txn.mark_handed_off();
        inner.agent_waiting = false;

        trace!(
            bus = %self.name,
            addr = %format!("{:#04x}", header.addr()),
            len = header.len,
            read = header.is_read(),
            stop = header.stop,
            "Header fetched"
        );
        if inner.state != next {
            self.transition(inner, next);
        }
        Ok(header)
    }

    fn complete_payload(
        &self,
        inner: &mut Inner,
        copy: impl FnOnce(&mut Vec<u8>) -> usize,
    ) -> Result<usize> {
        let Some(txn) = inner.txn.as_mut() else {
            return Err(Error::Io);
        };
        let Some(msg) = txn.current_mut() else {
            return Err(Error::Io);
        };

        let n = copy(&mut msg.buf);
        msg.buf.truncate(n);
        let more = txn.advance();
        trace!(bus = %self.name, bytes = n, completed = txn.cursor(), "Payload transferred");

        let next = if more {
            State::NextMessagePending
        } else {
            State::Ready
        };
        self.transition(inner, next);
        Ok(n)
    }

    fn violation(&self, inner: &mut Inner, what: &str) {
        warn!(bus = %self.name, state = ?inner.state, "Protocol violation: {}", what);
        if inner.state.is_in_flight() {
            self.transition(inner, State::Aborted);
        }
    }

    fn abandon_transfer(&self, prev: State) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            State::Terminated => {}
            s if s.is_outcome() => {
                inner.txn = None;
                self.transition(&mut inner, State::Idle);
            }
            _ => {
                if let Some(txn) = inner.txn.take() {
                    // Only hand the state back to an agent that is still parked
                    let restore = if !txn.handed_off() && inner.agent_waiting {
                        prev
                    } else {
                        State::Idle
                    };
                    debug!(
                        bus = %self.name,
                        handed_off = txn.handed_off(),
                        "Transfer abandoned by requester"
                    );
                    self.transition(&mut inner, restore);
                }
            }
        }
    }

    fn abandon_fetch(&self) {
        let mut inner = self.lock();
        inner.agent_waiting = false;
        let unseen = inner.txn.as_ref().is_some_and(|txn| !txn.handed_off());
        let state = inner.state;
        match state {
            State::W4NextRequest => self.transition(&mut inner, State::Idle),
            s if s.is_payload() && unseen => self.transition(&mut inner, State::AwaitMsgHdr),
            _ => {}
        }
    }
}

/// Undoes a requester's installation if its wait is dropped.
struct PendingTransfer<'a> {
    session: &'a Session,
    prev: State,
    armed: bool,
}

impl Drop for PendingTransfer<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.abandon_transfer(self.prev);
        }
    }
}

/// Withdraws the agent's waiting fetch if its wait is dropped.
struct WaitingAgent<'a> {
    session: &'a Session,
    armed: bool,
}

impl Drop for WaitingAgent<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.abandon_fetch();
        }
    }
}
