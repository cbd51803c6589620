//! Request/response correlation
//!
//! A bounded pool of 255 request slots. Tag `n` lives in slot `n - 1`; tag 0
//! marks uncorrelated traffic and is never handed out. A slot can be reused
//! once its occupant has been released, which happens when
//!
//! - a matching reply is handled,
//! - the request is released explicitly,
//! - the sweeper (or a waiter) finds it older than its TTL.
//!
//! Release is idempotent: the first release decides whether the request was
//! replied or expired, later releases are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{BoardLinkError, Result};
use crate::message::Message;

/// Number of request slots (tags 1..=255)
pub const POOL_CAPACITY: usize = 255;
/// Default request time-to-live
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(30);
/// Default sweep period
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Callback run with the reply, outside any pool lock
pub type Continuation = Box<dyn FnOnce(&Message) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Replied,
    Expired,
}

/// How a correlated request ended
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Replied(Message),
    Expired,
}

pub struct Request {
    tag: u8,
    created: Instant,
    ttl: Duration,
    released: AtomicBool,
    handled: AtomicBool,
    reply: Mutex<Option<Message>>,
    continuation: Mutex<Option<Continuation>>,
    state: watch::Sender<RequestState>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("tag", &self.tag)
            .field("ttl", &self.ttl)
            .field("released", &self.is_released())
            .field("handled", &self.is_handled())
            .finish()
    }
}

impl Request {
    fn new(tag: u8, ttl: Duration, continuation: Option<Continuation>) -> Self {
        let (state, _) = watch::channel(RequestState::Pending);
        Self {
            tag,
            created: Instant::now(),
            ttl,
            released: AtomicBool::new(false),
            handled: AtomicBool::new(false),
            reply: Mutex::new(None),
            continuation: Mutex::new(continuation),
            state,
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    fn is_aged(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= self.ttl
    }

    /// Released or older than its TTL
    pub fn is_expired(&self, now: Instant) -> bool {
        self.is_released() || self.is_aged(now)
    }

    /// Release once; `reply` present means the request was answered.
    ///
    /// Returns false when someone else released it first.
    fn finish(&self, reply: Option<Message>) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let state = match reply {
            Some(reply) => {
                *self.reply.lock() = Some(reply);
                self.handled.store(true, Ordering::Release);
                RequestState::Replied
            }
            None => RequestState::Expired,
        };
        self.state.send_replace(state);
        true
    }
}

/// Handle returned to the issuer of a correlated request
#[derive(Debug)]
pub struct PendingRequest {
    request: Arc<Request>,
    state: watch::Receiver<RequestState>,
}

impl PendingRequest {
    pub fn tag(&self) -> u8 {
        self.request.tag
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// Wait until the request is released
    ///
    /// Resolves no later than the request's TTL even if no sweeper runs.
    pub async fn wait(mut self) -> RequestOutcome {
        let deadline = self.request.created + self.request.ttl;

        let state = tokio::select! {
            changed = self.state.wait_for(|s| *s != RequestState::Pending) => {
                changed.map(|s| *s).unwrap_or(RequestState::Expired)
            }
            _ = tokio::time::sleep_until(deadline) => {
                if self.request.finish(None) || !self.request.is_handled() {
                    RequestState::Expired
                } else {
                    RequestState::Replied
                }
            }
        };

        match state {
            RequestState::Replied => match self.request.reply.lock().take() {
                Some(reply) => RequestOutcome::Replied(reply),
                None => RequestOutcome::Expired,
            },
            _ => RequestOutcome::Expired,
        }
    }
}

/// Bounded request pool
#[derive(Debug)]
pub struct RequestPool {
    slots: Mutex<Vec<Option<Arc<Request>>>>,
    default_ttl: Duration,
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TTL)
    }
}

impl RequestPool {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(vec![None; POOL_CAPACITY]),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Allocate a slot and stamp its tag on `message`
    pub fn create(
        &self,
        message: &mut Message,
        ttl: Option<Duration>,
        continuation: Option<Continuation>,
    ) -> Result<PendingRequest> {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut slots = self.slots.lock();

        let index = slots
            .iter()
            .position(|slot| slot.as_ref().map_or(true, |r| r.is_expired(now)))
            .ok_or(BoardLinkError::PoolExhausted)?;

        if let Some(previous) = slots[index].take() {
            // aged but never swept: wake its waiter before the slot is reused
            previous.finish(None);
        }

        let tag = (index + 1) as u8;
        let request = Arc::new(Request::new(tag, ttl, continuation));
        let state = request.state.subscribe();
        slots[index] = Some(request.clone());
        drop(slots);

        message.tag = tag;
        trace!(tag, kind = %message.kind, "Request created");
        Ok(PendingRequest { request, state })
    }

    fn lookup(&self, tag: u8) -> Result<Arc<Request>> {
        let index = match tag.checked_sub(1) {
            Some(index) if (index as usize) < POOL_CAPACITY => index as usize,
            _ => return Err(BoardLinkError::InvalidTag(tag)),
        };
        self.slots.lock()[index]
            .clone()
            .ok_or(BoardLinkError::RequestNotFound(tag))
    }

    /// Match a reply to its request and run the continuation
    pub fn handle(&self, message: &Message) -> Result<()> {
        let tag = message.tag;
        let request = self.lookup(tag)?;

        if request.is_aged(Instant::now()) {
            request.finish(None);
            return Err(BoardLinkError::RequestExpired(tag));
        }
        if !request.finish(Some(message.clone())) {
            return Err(BoardLinkError::RequestExpired(tag));
        }

        let continuation = request.continuation.lock().take();
        if let Some(continuation) = continuation {
            continuation(message);
        }
        trace!(tag, "Request handled");
        Ok(())
    }

    /// Release a request without a reply; releasing twice is a no-op
    pub fn release(&self, tag: u8) -> Result<()> {
        let request = self.lookup(tag)?;
        request.finish(None);
        Ok(())
    }

    /// Release every request older than its TTL, returning how many were released
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<Request>> = self
            .slots
            .lock()
            .iter()
            .flatten()
            .filter(|r| !r.is_released() && r.is_aged(now))
            .cloned()
            .collect();

        let count = expired.iter().filter(|r| r.finish(None)).count();
        if count > 0 {
            debug!("Swept {} expired requests", count);
        }
        count
    }

    /// Number of slots holding an unreleased request
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|r| !r.is_released())
            .count()
    }

    /// Periodically sweep until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep(Instant::now());
                    }
                }
            }
            trace!("Request sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::atomic::AtomicUsize;

    fn request_message() -> Message {
        Message::new(MessageKind::StatusRequest)
    }

    #[tokio::test]
    async fn test_pool_exhaustion_and_reuse() {
        let pool = RequestPool::default();
        let mut pending = Vec::new();
        for expected in 1..=255u8 {
            let mut message = request_message();
            let request = pool.create(&mut message, None, None).unwrap();
            assert_eq!(message.tag, expected);
            pending.push(request);
        }

        let mut message = request_message();
        assert!(matches!(
            pool.create(&mut message, None, None),
            Err(BoardLinkError::PoolExhausted)
        ));

        pool.release(17).unwrap();
        let reused = pool.create(&mut message, None, None).unwrap();
        assert_eq!(reused.tag(), 17);
        assert_eq!(message.tag, 17);
    }

    #[tokio::test]
    async fn test_handle_runs_continuation_and_wakes_waiter() {
        let pool = RequestPool::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut message = request_message();
        let pending = pool
            .create(
                &mut message,
                None,
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let reply = Message::new(MessageKind::StatusResponse).with_argument(5u8);
        let reply = Message { tag: pending.tag(), ..reply };
        pool.handle(&reply).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pending.wait().await, RequestOutcome::Replied(reply.clone()));

        // a second reply with the same tag must not succeed silently
        assert!(matches!(
            pool.handle(&reply),
            Err(BoardLinkError::RequestExpired(1))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_errors() {
        let pool = RequestPool::default();
        let stray = Message::new(MessageKind::StatusResponse);
        assert!(matches!(
            pool.handle(&stray),
            Err(BoardLinkError::InvalidTag(0))
        ));

        let stray = Message { tag: 9, ..stray };
        assert!(matches!(
            pool.handle(&stray),
            Err(BoardLinkError::RequestNotFound(9))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_request_is_expired() {
        let pool = RequestPool::default();
        let mut message = request_message();
        let pending = pool
            .create(&mut message, Some(Duration::from_secs(1)), None)
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        let reply = Message {
            tag: message.tag,
            ..Message::new(MessageKind::StatusResponse)
        };
        assert!(matches!(
            pool.handle(&reply),
            Err(BoardLinkError::RequestExpired(1))
        ));
        assert_eq!(pending.wait().await, RequestOutcome::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_wakes_waiters() {
        let pool = Arc::new(RequestPool::new(Duration::from_secs(3)));
        let cancel = CancellationToken::new();
        let sweeper = pool.spawn_sweeper(Duration::from_secs(2), cancel.clone());

        let mut message = request_message();
        let pending = pool.create(&mut message, None, None).unwrap();
        assert_eq!(pool.in_flight(), 1);

        let outcome = pending.wait().await;
        assert_eq!(outcome, RequestOutcome::Expired);
        assert_eq!(pool.in_flight(), 0);

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = RequestPool::default();
        let mut message = request_message();
        let pending = pool.create(&mut message, None, None).unwrap();

        pool.release(1).unwrap();
        pool.release(1).unwrap();
        assert_eq!(pool.sweep(Instant::now() + Duration::from_secs(60)), 0);
        assert_eq!(pending.state(), RequestState::Expired);
    }
}
