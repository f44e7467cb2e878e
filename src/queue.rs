//! Per-connection GATT command queue.
//!
//! The queue is a plain state machine: it never talks to the radio itself.
//! Operations that make a new command eligible for the radio hand back a
//! [`Dispatch`] which the owning connection submits to the native stack. The
//! completion comes back through [`CommandQueue::on_native_completion`] tagged
//! with the generation that was current at dispatch time.
//!
//! Invariants:
//! - at most one command is in flight, and it is always the head;
//! - results resolve in enqueue order;
//! - a completion whose generation differs from the queue's is discarded.

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::gatt::{Characteristic, Service};
use crate::error::{Error, Result};

/// Kind of GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Discover all services of the device.
    DiscoverServices,
    /// Discover the characteristics of one service.
    DiscoverCharacteristics,
    /// Read a characteristic value.
    Read,
    /// Write a characteristic value and wait for the acknowledgement.
    Write,
    /// Write a characteristic value without acknowledgement.
    WriteWithoutResponse,
    /// Enable notifications on a characteristic.
    Subscribe,
    /// Disable notifications on a characteristic.
    Unsubscribe,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiscoverServices => write!(f, "DiscoverServices"),
            Self::DiscoverCharacteristics => write!(f, "DiscoverCharacteristics"),
            Self::Read => write!(f, "Read"),
            Self::Write => write!(f, "Write"),
            Self::WriteWithoutResponse => write!(f, "WriteWithoutResponse"),
            Self::Subscribe => write!(f, "Subscribe"),
            Self::Unsubscribe => write!(f, "Unsubscribe"),
        }
    }
}

/// A GATT operation waiting to be sent to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Operation kind.
    pub kind: CommandKind,
    /// Target service, when the kind needs one.
    pub service: Option<Uuid>,
    /// Target characteristic, when the kind needs one.
    pub characteristic: Option<Uuid>,
    /// Bytes to write.
    pub payload: Option<Bytes>,
}

impl Command {
    fn new(kind: CommandKind, service: Option<Uuid>, characteristic: Option<Uuid>) -> Self {
        Self {
            kind,
            service,
            characteristic,
            payload: None,
        }
    }

    /// Discover all services.
    pub fn discover_services() -> Self {
        Self::new(CommandKind::DiscoverServices, None, None)
    }

    /// Discover the characteristics of `service`.
    pub fn discover_characteristics(service: Uuid) -> Self {
        Self::new(CommandKind::DiscoverCharacteristics, Some(service), None)
    }

    /// Read a characteristic.
    pub fn read(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(CommandKind::Read, Some(service), Some(characteristic))
    }

    /// Write a characteristic.
    pub fn write(
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Bytes>,
        with_response: bool,
    ) -> Self {
        let kind = if with_response {
            CommandKind::Write
        } else {
            CommandKind::WriteWithoutResponse
        };
        Self {
            payload: Some(value.into()),
            ..Self::new(kind, Some(service), Some(characteristic))
        }
    }

    /// Enable notifications.
    pub fn subscribe(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(CommandKind::Subscribe, Some(service), Some(characteristic))
    }

    /// Disable notifications.
    pub fn unsubscribe(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(CommandKind::Unsubscribe, Some(service), Some(characteristic))
    }

    /// Target service, or an error naming the missing parameter.
    pub fn require_service(&self) -> Result<Uuid> {
        self.service.ok_or_else(|| Error::InvalidParameter {
            name: "service".to_string(),
            value: format!("missing for {}", self.kind),
        })
    }

    /// Target characteristic, or an error naming the missing parameter.
    pub fn require_characteristic(&self) -> Result<Uuid> {
        self.characteristic.ok_or_else(|| Error::InvalidParameter {
            name: "characteristic".to_string(),
            value: format!("missing for {}", self.kind),
        })
    }
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// Result of `DiscoverServices`.
    Services(Vec<Service>),
    /// Result of `DiscoverCharacteristics`.
    Characteristics(Vec<Characteristic>),
    /// Result of `Read`.
    Value(Vec<u8>),
    /// Result of writes and (un)subscriptions.
    Done,
}

/// Handle to a queued command's result.
///
/// Resolves exactly once, either with the native outcome or with
/// [`Error::Cancelled`] if the command was drained by a disconnect.
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<Result<CommandOutput>>,
}

impl PendingResult {
    /// A handle that is already resolved.
    pub(crate) fn ready(outcome: Result<CommandOutput>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }
}

impl Future for PendingResult {
    type Output = Result<CommandOutput>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the owning queue went away with the command.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Cancelled)))
    }
}

/// A command the connection must hand to the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Generation the completion must carry.
    pub generation: u64,
    /// The command to execute.
    pub command: Command,
}

struct QueuedCommand {
    command: Command,
    reply: oneshot::Sender<Result<CommandOutput>>,
}

/// Ordered, single-flight command pipeline for one connection.
pub struct CommandQueue {
    generation: u64,
    pending: VecDeque<QueuedCommand>,
    in_flight: bool,
}

impl CommandQueue {
    /// Create an empty queue scoped to `generation`.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            pending: VecDeque::new(),
            in_flight: false,
        }
    }

    /// Generation this queue accepts completions for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of commands not yet resolved, including the in-flight one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if the queue holds no commands.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Check if the head has been handed to the radio.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Append a command. Returns the caller's handle and, when the queue was
    /// idle and `connected` is set, the dispatch for the new head.
    pub fn enqueue(&mut self, command: Command, connected: bool) -> (PendingResult, Option<Dispatch>) {
        let (reply, rx) = oneshot::channel();
        trace!(
            "Enqueue {} (generation {}, depth {})",
            command.kind,
            self.generation,
            self.pending.len()
        );
        self.pending.push_back(QueuedCommand { command, reply });

        let dispatch = if connected { self.dispatch_head() } else { None };
        (PendingResult { rx }, dispatch)
    }

    /// Start the head command if nothing is in flight.
    ///
    /// Used after a connection is established to release commands queued
    /// while it was being set up.
    pub fn dispatch_head(&mut self) -> Option<Dispatch> {
        if self.in_flight {
            return None;
        }
        let head = self.pending.front()?;
        self.in_flight = true;
        Some(Dispatch {
            generation: self.generation,
            command: head.command.clone(),
        })
    }

    /// Resolve the in-flight command with the native outcome.
    ///
    /// Completions from another generation, or arriving while nothing is in
    /// flight (the command was already drained), are discarded.
    pub fn on_native_completion(
        &mut self,
        generation: u64,
        outcome: Result<CommandOutput>,
        connected: bool,
    ) -> Option<Dispatch> {
        if generation != self.generation || !self.in_flight {
            debug!(
                "Discarding stale completion (generation {}, current {}, in flight {})",
                generation, self.generation, self.in_flight
            );
            return None;
        }

        self.in_flight = false;
        if let Some(head) = self.pending.pop_front() {
            trace!("Completed {} (generation {})", head.command.kind, generation);
            // The caller may have stopped waiting; the queue still advances.
            let _ = head.reply.send(outcome);
        }

        if connected {
            self.dispatch_head()
        } else {
            None
        }
    }

    /// Resolve every pending command with [`Error::Cancelled`], in queue
    /// order, and empty the queue. Returns the number of commands cancelled.
    pub fn drain_on_disconnect(&mut self) -> usize {
        let count = self.pending.len();
        for queued in self.pending.drain(..) {
            let _ = queued.reply.send(Err(Error::Cancelled));
        }
        self.in_flight = false;

        if count > 0 {
            debug!(
                "Drained {} command(s) from generation {}",
                count, self.generation
            );
        }
        count
    }

    /// Scope the queue to a new connection generation.
    ///
    /// Commands that were never dispatched carry over to the new generation.
    /// If a command is still in flight it belongs to the old link, so the
    /// whole queue is cancelled instead.
    pub fn reset(&mut self, generation: u64) {
        if self.in_flight {
            self.drain_on_disconnect();
        }
        self.generation = generation;
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("generation", &self.generation)
            .field("len", &self.pending.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use proptest::prelude::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    fn read() -> Command {
        Command::read(TEST_SERVICE_UUID, TEST_WRITE_UUID)
    }

    #[test]
    fn test_first_enqueue_dispatches_when_connected() {
        let mut queue = CommandQueue::new(1);

        let (_first, dispatch) = queue.enqueue(read(), true);
        assert_eq!(
            dispatch,
            Some(Dispatch {
                generation: 1,
                command: read()
            })
        );

        let (_second, dispatch) = queue.enqueue(Command::discover_services(), true);
        assert!(dispatch.is_none());
        assert!(queue.is_in_flight());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_enqueue_while_not_connected_holds_dispatch() {
        let mut queue = CommandQueue::new(0);

        let (_handle, dispatch) = queue.enqueue(read(), false);
        assert!(dispatch.is_none());
        assert!(!queue.is_in_flight());

        let dispatch = queue.dispatch_head().expect("head should dispatch");
        assert_eq!(dispatch.command.kind, CommandKind::Read);
        assert!(queue.dispatch_head().is_none());
    }

    #[test]
    fn test_completion_resolves_head_and_advances() {
        let mut queue = CommandQueue::new(3);

        let (first, _) = queue.enqueue(read(), true);
        let (second, _) = queue.enqueue(Command::discover_services(), true);
        let mut first = task::spawn(first);
        let mut second = task::spawn(second);

        let next = queue.on_native_completion(3, Ok(CommandOutput::Value(vec![7])), true);
        assert_eq!(next.map(|d| d.command.kind), Some(CommandKind::DiscoverServices));

        assert_ready_eq!(first.poll(), Ok(CommandOutput::Value(vec![7])));
        assert_pending!(second.poll());
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let mut queue = CommandQueue::new(2);
        let (handle, _) = queue.enqueue(read(), true);
        let mut handle = task::spawn(handle);

        assert!(queue
            .on_native_completion(1, Ok(CommandOutput::Done), true)
            .is_none());
        assert_pending!(handle.poll());
        assert!(queue.is_in_flight());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_completion_after_drain_is_discarded() {
        let mut queue = CommandQueue::new(1);
        let (handle, _) = queue.enqueue(read(), true);
        let mut handle = task::spawn(handle);

        assert_eq!(queue.drain_on_disconnect(), 1);
        assert_ready_eq!(handle.poll(), Err(Error::Cancelled));

        // Late completion from the radio for the drained command.
        let (later, dispatch) = queue.enqueue(read(), false);
        assert!(dispatch.is_none());
        assert!(queue
            .on_native_completion(1, Ok(CommandOutput::Value(vec![1])), false)
            .is_none());
        let mut later = task::spawn(later);
        assert_pending!(later.poll());
    }

    #[test]
    fn test_drain_cancels_everything_in_order() {
        let mut queue = CommandQueue::new(1);
        let mut handles: Vec<_> = (0..10u8)
            .map(|i| {
                let command = Command::write(TEST_SERVICE_UUID, TEST_WRITE_UUID, vec![i], true);
                task::spawn(queue.enqueue(command, true).0)
            })
            .collect();

        assert_eq!(queue.drain_on_disconnect(), 10);
        assert!(queue.is_empty());
        assert!(!queue.is_in_flight());

        for handle in handles.iter_mut() {
            assert_ready_eq!(handle.poll(), Err(Error::Cancelled));
        }
    }

    #[test]
    fn test_reset_moves_generation() {
        let mut queue = CommandQueue::new(1);
        let (handle, _) = queue.enqueue(read(), true);
        queue.reset(2);

        let mut handle = task::spawn(handle);
        assert_ready_eq!(handle.poll(), Err(Error::Cancelled));
        assert_eq!(queue.generation(), 2);

        let (_, dispatch) = queue.enqueue(read(), true);
        assert_eq!(dispatch.map(|d| d.generation), Some(2));
    }

    #[test]
    fn test_reset_keeps_undispatched_commands() {
        let mut queue = CommandQueue::new(1);
        let (handle, dispatch) = queue.enqueue(read(), false);
        assert!(dispatch.is_none());

        queue.reset(2);
        assert_eq!(queue.len(), 1);

        let dispatch = queue.dispatch_head().expect("carried command dispatches");
        assert_eq!(dispatch.generation, 2);

        queue.on_native_completion(2, Ok(CommandOutput::Value(vec![9])), true);
        let mut handle = task::spawn(handle);
        assert_ready_eq!(handle.poll(), Ok(CommandOutput::Value(vec![9])));
    }

    #[test]
    fn test_dropped_queue_cancels_handle() {
        let mut queue = CommandQueue::new(1);
        let (handle, _) = queue.enqueue(read(), true);
        drop(queue);

        let mut handle = task::spawn(handle);
        assert_ready_eq!(handle.poll(), Err(Error::Cancelled));
    }

    #[test]
    fn test_ready_handle() {
        let mut handle = task::spawn(PendingResult::ready(Err(Error::NotConnected)));
        assert_ready!(handle.poll()).unwrap_err();
    }

    proptest! {
        /// Random interleavings of enqueue and completion keep results in
        /// enqueue order and never put two commands in flight.
        #[test]
        fn prop_fifo_single_flight(steps in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut queue = CommandQueue::new(7);
            let mut handles = Vec::new();
            let mut in_flight = 0usize;
            let mut completed = 0u8;
            let mut enqueued = 0u8;

            for enqueue in steps {
                if enqueue {
                    let command = Command::write(TEST_SERVICE_UUID, TEST_WRITE_UUID, vec![enqueued], true);
                    let (handle, dispatch) = queue.enqueue(command, true);
                    handles.push(task::spawn(handle));
                    enqueued = enqueued.wrapping_add(1);
                    if dispatch.is_some() {
                        in_flight += 1;
                    }
                } else if queue.is_in_flight() {
                    let next = queue.on_native_completion(
                        7,
                        Ok(CommandOutput::Value(vec![completed])),
                        true,
                    );
                    in_flight -= 1;
                    completed = completed.wrapping_add(1);
                    if next.is_some() {
                        in_flight += 1;
                    }
                }
                prop_assert!(in_flight <= 1);
            }

            for (index, handle) in handles.iter_mut().enumerate() {
                if index < completed as usize {
                    prop_assert_eq!(
                        assert_ready!(handle.poll()),
                        Ok(CommandOutput::Value(vec![index as u8]))
                    );
                } else {
                    prop_assert!(handle.poll().is_pending());
                }
            }
        }
    }
}
