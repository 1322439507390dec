//! Acknowledgment channel.
//!
//! The apply path posts one [`Notification`] per applied mutation; a consumer
//! blocked in [`AckChannel::wait`] takes the oldest one. Each notification is
//! handed to exactly one waiter. Timeouts are an ordinary outcome and are kept
//! distinct from a notification carrying a failure code.

use crate::sonic::adapters::ConsumerNotifierAdapter;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::Code;

/// SWSS response codes carried by acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    InvalidParam,
    Unavailable,
    NotFound,
    NoMemory,
    Exists,
    Full,
    InUse,
    Internal,
    NotImplemented,
    NotExecuted,
    Unknown,
}

impl ResponseCode {
    /// Wire string used on the SONiC notification channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SWSS_RC_SUCCESS",
            Self::InvalidParam => "SWSS_RC_INVALID_PARAM",
            Self::Unavailable => "SWSS_RC_UNAVAIL",
            Self::NotFound => "SWSS_RC_NOT_FOUND",
            Self::NoMemory => "SWSS_RC_NO_MEMORY",
            Self::Exists => "SWSS_RC_EXISTS",
            Self::Full => "SWSS_RC_FULL",
            Self::InUse => "SWSS_RC_IN_USE",
            Self::Internal => "SWSS_RC_INTERNAL",
            Self::NotImplemented => "SWSS_RC_NOT_IMPLEMENTED",
            Self::NotExecuted => "SWSS_RC_NOT_EXECUTED",
            Self::Unknown => "SWSS_RC_UNKNOWN",
        }
    }

    /// Whether the mutation took effect.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// gRPC code the P4Runtime server reports for this outcome.
    pub fn to_grpc_code(&self) -> Code {
        match self {
            Self::Success => Code::Ok,
            Self::InvalidParam => Code::InvalidArgument,
            Self::Unavailable => Code::Unavailable,
            Self::NotFound => Code::NotFound,
            Self::NoMemory | Self::Full => Code::ResourceExhausted,
            Self::Exists => Code::AlreadyExists,
            Self::InUse => Code::FailedPrecondition,
            Self::Internal => Code::Internal,
            Self::NotImplemented => Code::Unimplemented,
            Self::NotExecuted => Code::Aborted,
            Self::Unknown => Code::Unknown,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "SWSS_RC_SUCCESS" => Self::Success,
            "SWSS_RC_INVALID_PARAM" => Self::InvalidParam,
            "SWSS_RC_UNAVAIL" => Self::Unavailable,
            "SWSS_RC_NOT_FOUND" => Self::NotFound,
            "SWSS_RC_NO_MEMORY" => Self::NoMemory,
            "SWSS_RC_EXISTS" => Self::Exists,
            "SWSS_RC_FULL" => Self::Full,
            "SWSS_RC_IN_USE" => Self::InUse,
            "SWSS_RC_INTERNAL" => Self::Internal,
            "SWSS_RC_NOT_IMPLEMENTED" => Self::NotImplemented,
            "SWSS_RC_NOT_EXECUTED" => Self::NotExecuted,
            "SWSS_RC_UNKNOWN" => Self::Unknown,
            other => return Err(format!("unknown SWSS response code: {}", other)),
        };
        Ok(code)
    }
}

/// Outcome of one applied mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Row key the mutation targeted.
    pub key: String,
    /// Apply outcome.
    pub code: ResponseCode,
    /// Human-readable detail, empty on success.
    pub message: String,
    /// Sequence number assigned when the mutation was enqueued.
    pub seq: u64,
}

impl Notification {
    /// Create a success notification.
    pub fn success(key: impl Into<String>, seq: u64) -> Self {
        Self {
            key: key.into(),
            code: ResponseCode::Success,
            message: String::new(),
            seq,
        }
    }

    /// Create a failure notification.
    pub fn failure(
        key: impl Into<String>,
        code: ResponseCode,
        message: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            code,
            message: message.into(),
            seq,
        }
    }
}

/// Result of waiting on an acknowledgment channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The oldest pending notification.
    Ready(Notification),
    /// Nothing arrived within the timeout.
    TimedOut,
}

impl WaitOutcome {
    /// The notification, if one arrived.
    pub fn into_notification(self) -> Option<Notification> {
        match self {
            Self::Ready(n) => Some(n),
            Self::TimedOut => None,
        }
    }

    /// Check for the timeout outcome.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

struct ChannelInner {
    table: String,
    pending: Mutex<ChannelState>,
    available: Condvar,
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<Notification>,
    posted: u64,
    last_seq: Option<u64>,
}

/// Per-table FIFO of acknowledgments with blocking wait.
#[derive(Clone)]
pub struct AckChannel {
    inner: Arc<ChannelInner>,
}

impl AckChannel {
    /// Create an empty channel for the named table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                table: table.into(),
                pending: Mutex::new(ChannelState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Table this channel reports on.
    pub fn table(&self) -> &str {
        &self.inner.table
    }

    /// Make a notification visible to exactly one future `wait`.
    ///
    /// Sequence numbers must increase; a regression means the apply path
    /// reordered work and the simulation can no longer be trusted.
    pub fn post(&self, notification: Notification) {
        let mut state = self.inner.pending.lock();
        if let Some(last) = state.last_seq {
            assert!(
                notification.seq > last,
                "acknowledgment out of order on {}: seq {} after {}",
                self.inner.table,
                notification.seq,
                last
            );
        }
        state.last_seq = Some(notification.seq);
        state.posted += 1;
        tracing::trace!(
            table = %self.inner.table,
            key = %notification.key,
            code = %notification.code,
            seq = notification.seq,
            "acknowledgment posted"
        );
        state.queue.push_back(notification);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Block until a notification is available or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.pending.lock();
        loop {
            if let Some(notification) = state.queue.pop_front() {
                return WaitOutcome::Ready(notification);
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            // Spurious and timed-out wakeups both fall through to the checks above.
            let _ = self.inner.available.wait_until(&mut state, deadline);
        }
    }

    /// Take the oldest notification without blocking.
    pub fn try_take(&self) -> Option<Notification> {
        self.inner.pending.lock().queue.pop_front()
    }

    /// Number of notifications posted but not yet taken.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().queue.len()
    }

    /// Total notifications ever posted.
    pub fn posted(&self) -> u64 {
        self.inner.pending.lock().posted
    }
}

impl fmt::Debug for AckChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckChannel")
            .field("table", &self.inner.table)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Notifier capability backed by an in-process [`AckChannel`].
#[derive(Debug, Clone)]
pub struct FakeConsumerNotifier {
    channel: AckChannel,
}

impl FakeConsumerNotifier {
    /// Wrap a channel.
    pub fn new(channel: AckChannel) -> Self {
        Self { channel }
    }

    /// Underlying channel.
    pub fn channel(&self) -> &AckChannel {
        &self.channel
    }
}

impl ConsumerNotifierAdapter for FakeConsumerNotifier {
    fn wait_for_notification(&self, timeout: Duration) -> WaitOutcome {
        self.channel.wait(timeout)
    }
}
