//! Message looper
//!
//! One event loop drains a bounded mailbox in push order and hands each
//! message to the handler registered for its action. Handlers run as their
//! own tasks, so a slow handler never stalls the mailbox and may overlap with
//! later invocations of itself.
//!
//! An action registered with a deadline gets a tricker: the first `Probe`
//! starts a timer, a `Succeed` stops it, and if it fires first a copy of the
//! probe is pushed back in `Failed` state. Handler errors come back through
//! the mailbox as `Error` messages on the same action.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    config::LooperConfig,
    error::LooperError,
    message::{Action, Message, State},
    sink::SharedSink,
};

/// Per-action message handler.
///
/// The looper handle is passed in so handlers can push follow-up messages
/// without holding a clone of their own looper.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, looper: MessageLooper, msg: Message) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageLooper, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, looper: MessageLooper, msg: Message) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(looper, msg))
    }
}

struct HandlerEntry {
    handler: Arc<dyn MessageHandler>,
    deadline: Option<Duration>,
}

struct Tricker {
    generation: u64,
    task: JoinHandle<()>,
}

struct LooperInner {
    mailbox_tx: mpsc::Sender<Message>,
    mailbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    handlers: DashMap<Action, HandlerEntry>,
    trickers: DashMap<Action, Tricker>,
    intervals: Mutex<Vec<JoinHandle<()>>>,
    control: watch::Sender<bool>,
    closed: AtomicBool,
    generation: AtomicU64,
    sink: SharedSink,
}

/// Cloneable handle to one event loop.
#[derive(Clone)]
pub struct MessageLooper {
    inner: Arc<LooperInner>,
}

impl std::fmt::Debug for MessageLooper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLooper")
            .field("handlers", &self.inner.handlers.len())
            .field("trickers", &self.inner.trickers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MessageLooper {
    pub fn new(mailbox_capacity: usize, sink: SharedSink) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(mailbox_capacity.max(1));
        let (control, _) = watch::channel(false);
        Self {
            inner: Arc::new(LooperInner {
                mailbox_tx,
                mailbox_rx: Mutex::new(Some(mailbox_rx)),
                handlers: DashMap::new(),
                trickers: DashMap::new(),
                intervals: Mutex::new(Vec::new()),
                control,
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                sink,
            }),
        }
    }

    pub fn from_config(config: &LooperConfig, sink: SharedSink) -> Self {
        Self::new(config.mailbox_capacity, sink)
    }

    fn from_inner(inner: Arc<LooperInner>) -> Self {
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Enqueue `msg`, waiting for mailbox space.
    ///
    /// A `Failed` message has its visit count bumped first, so retries are
    /// visible to whoever handles them.
    pub async fn push(&self, mut msg: Message) -> Result<(), LooperError> {
        if self.is_closed() {
            return Err(LooperError::Closed);
        }
        if msg.state() == State::Failed {
            msg.visit();
        }
        self.inner
            .mailbox_tx
            .send(msg)
            .await
            .map_err(|_| LooperError::Closed)
    }

    /// Non-blocking [`push`](Self::push).
    pub fn try_push(&self, mut msg: Message) -> Result<(), LooperError> {
        if self.is_closed() {
            return Err(LooperError::Closed);
        }
        if msg.state() == State::Failed {
            msg.visit();
        }
        self.inner.mailbox_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LooperError::Full,
            mpsc::error::TrySendError::Closed(_) => LooperError::Closed,
        })
    }

    /// Register `handler` for `action`, replacing any previous one.
    ///
    /// A non-zero `deadline` arms a tricker on each `Probe` of this action.
    pub fn add_handler<H>(&self, deadline: Duration, action: Action, handler: H)
    where
        H: MessageHandler,
    {
        self.add_shared_handler(deadline, action, Arc::new(handler));
    }

    pub fn add_shared_handler(&self, deadline: Duration, action: Action, handler: Arc<dyn MessageHandler>) {
        let deadline = (!deadline.is_zero()).then_some(deadline);
        debug!(%action, ?deadline, "Handler registered");
        self.inner
            .handlers
            .insert(action, HandlerEntry { handler, deadline });
    }

    pub fn remove_handler(&self, action: Action) -> bool {
        self.disarm_tricker(action);
        self.inner.handlers.remove(&action).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Call `tick` every `period`, the first time one period from now, and
    /// push whatever message it returns.
    ///
    /// The task stops when the looper stops accepting messages.
    pub fn set_interval<F>(&self, period: Duration, mut tick: F) -> Result<(), LooperError>
    where
        F: FnMut() -> Option<Message> + Send + 'static,
    {
        if period.is_zero() {
            return Err(LooperError::ZeroPeriod);
        }
        if self.is_closed() {
            return Err(LooperError::Closed);
        }
        let weak: Weak<LooperInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let Some(msg) = tick() else {
                    continue;
                };
                if MessageLooper::from_inner(inner).push(msg).await.is_err() {
                    break;
                }
            }
        });
        self.inner.intervals.lock().push(task);
        Ok(())
    }

    /// Ask the loop to stop.
    ///
    /// Further pushes fail immediately. The loop sees the request before any
    /// queued message.
    pub fn term(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.control.send_replace(true);
        // Wakes a loop parked on an empty mailbox; a full mailbox is fine
        // because control is polled first.
        let _ = self
            .inner
            .mailbox_tx
            .try_send(Message::new(Action::Terminate, State::Probe));
        debug!("Termination requested");
    }

    /// Drain the mailbox until terminated.
    ///
    /// Returns after a `Terminate` message, a [`term`](Self::term) call, or a
    /// message arriving while no handler is registered. Trickers and interval
    /// tasks are stopped before returning. May only run once per looper.
    #[instrument(skip(self), name = "message_looper")]
    pub async fn event_loop(&self) -> Result<(), LooperError> {
        let mut mailbox = self
            .inner
            .mailbox_rx
            .lock()
            .take()
            .ok_or(LooperError::AlreadyRunning)?;
        let mut control = self.inner.control.subscribe();
        info!("Message looper started");

        loop {
            if self.is_closed() {
                debug!("Termination flag set");
                break;
            }
            let msg = tokio::select! {
                biased;
                _ = control.changed() => continue,
                msg = mailbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            if msg.action() == Action::Terminate {
                debug!("Terminate message received");
                break;
            }
            if self.inner.handlers.is_empty() {
                warn!(action = %msg.action(), "No handlers registered, stopping");
                break;
            }
            self.dispatch(msg);
        }

        self.inner.closed.store(true, Ordering::Release);
        mailbox.close();
        self.stop_timers();
        info!("Message looper stopped");
        Ok(())
    }

    fn dispatch(&self, msg: Message) {
        let action = msg.action();
        let entry = self
            .inner
            .handlers
            .get(&action)
            .map(|entry| (entry.handler.clone(), entry.deadline));
        let Some((handler, deadline)) = entry else {
            trace!(%action, "No handler for action");
            return;
        };
        counter!("fleet_looper_dispatched_total", "action" => action.as_str()).increment(1);

        if let Some(deadline) = deadline {
            match msg.state() {
                State::Probe => self.arm_tricker(action, deadline, &msg),
                State::Succeed => self.disarm_tricker(action),
                _ => {}
            }
        }

        let looper = self.clone();
        tokio::spawn(async move {
            let state = msg.state();
            let Err(e) = handler.handle(looper.clone(), msg).await else {
                return;
            };
            if state == State::Error {
                // Re-reporting would loop forever on a handler that rejects
                // its own error reports.
                looper.inner.sink.err_in(&*e, action.as_str());
                return;
            }
            debug!(%action, error = %e, "Handler failed");
            let report = Message::new(action, State::Error).with_content(format!("{:#}", e));
            if let Err(push_err) = looper.push(report).await {
                looper.inner.sink.err_in(&push_err, action.as_str());
            }
        });
    }

    fn arm_tricker(&self, action: Action, deadline: Duration, msg: &Message) {
        let running = self
            .inner
            .trickers
            .get(&action)
            .is_some_and(|tricker| !tricker.task.is_finished());
        if running {
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(&self.inner);
        let failed = msg.transitioned(State::Failed);
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner
                .trickers
                .remove_if(&action, |_, tricker| tricker.generation == generation);
            counter!("fleet_looper_retries_total", "action" => action.as_str()).increment(1);
            debug!(%action, ?deadline, "Deadline passed without success");
            let looper = MessageLooper::from_inner(inner);
            if let Err(e) = looper.push(failed).await {
                trace!(%action, error = %e, "Dropping failed copy");
            }
        });
        self.inner
            .trickers
            .insert(action, Tricker { generation, task });
    }

    fn disarm_tricker(&self, action: Action) {
        if let Some((_, tricker)) = self.inner.trickers.remove(&action) {
            tricker.task.abort();
            trace!(%action, "Tricker stopped");
        }
    }

    fn stop_timers(&self) {
        self.inner.trickers.retain(|_, tricker| {
            tricker.task.abort();
            false
        });
        for task in self.inner.intervals.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::sink::{CollectingSink, TracingSink};

    fn looper() -> MessageLooper {
        MessageLooper::new(64, Arc::new(TracingSink))
    }

    fn spawn_loop(looper: &MessageLooper) -> JoinHandle<Result<(), LooperError>> {
        let looper = looper.clone();
        tokio::spawn(async move { looper.event_loop().await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsucceeded_probe_escalates_to_failed() {
        let looper = looper();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        {
            let seen = seen.clone();
            looper.add_handler(
                Duration::from_millis(1000),
                Action::Refer,
                move |_: MessageLooper, msg: Message| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().push((msg.state(), msg.visit_count(), start.elapsed()));
                        anyhow::Ok(())
                    }
                },
            );
        }
        let run = spawn_loop(&looper);

        looper
            .push(Message::new(Action::Refer, State::Probe).with_content("job-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        looper.term();
        run.await.unwrap().unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2, "{:?}", seen);
        assert_eq!((seen[0].0, seen[0].1), (State::Probe, 0));
        assert_eq!((seen[1].0, seen[1].1), (State::Failed, 1));
        assert!(seen[1].2 >= Duration::from_millis(1000));
        assert!(seen[1].2 < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeed_cancels_tricker() {
        let looper = looper();
        let failures = Arc::new(AtomicUsize::new(0));
        {
            let failures = failures.clone();
            looper.add_handler(
                Duration::from_millis(200),
                Action::Lock,
                move |looper: MessageLooper, msg: Message| {
                    let failures = failures.clone();
                    async move {
                        match msg.state() {
                            State::Probe => looper.push(msg.transitioned(State::Succeed)).await?,
                            State::Failed => {
                                failures.fetch_add(1, Ordering::SeqCst);
                            }
                            _ => {}
                        }
                        anyhow::Ok(())
                    }
                },
            );
        }
        let run = spawn_loop(&looper);
        looper.push(Message::new(Action::Lock, State::Probe)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        looper.term();
        run.await.unwrap().unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_term_stops_loop_and_timers() {
        let looper = looper();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            looper.add_handler(
                Duration::from_millis(100),
                Action::Vote,
                move |_: MessageLooper, _: Message| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                },
            );
        }
        looper
            .set_interval(Duration::from_millis(30), || {
                Some(Message::new(Action::Update, State::Local))
            })
            .unwrap();
        let run = spawn_loop(&looper);
        looper.push(Message::new(Action::Vote, State::Probe)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        looper.term();
        run.await.unwrap().unwrap();
        assert!(looper.is_closed());
        assert_eq!(looper.inner.trickers.len(), 0);
        assert!(looper.inner.intervals.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no tricker fired after return");
        assert_eq!(
            looper.push(Message::new(Action::Vote, State::Probe)).await,
            Err(LooperError::Closed)
        );
    }

    #[tokio::test]
    async fn test_terminate_message_ends_loop() {
        let looper = looper();
        looper.add_handler(Duration::ZERO, Action::Join, |_: MessageLooper, _: Message| async {
            anyhow::Ok(())
        });
        let run = spawn_loop(&looper);
        looper.push(Message::new(Action::Join, State::Probe)).await.unwrap();
        looper.push(Message::new(Action::Terminate, State::Probe)).await.unwrap();
        run.await.unwrap().unwrap();
        assert!(looper.is_closed());
    }

    #[tokio::test]
    async fn test_no_handlers_ends_loop() {
        let looper = looper();
        let run = spawn_loop(&looper);
        looper.push(Message::new(Action::Join, State::Probe)).await.unwrap();
        run.await.unwrap().unwrap();
        assert!(looper.is_closed());
    }

    #[tokio::test]
    async fn test_term_before_loop_starts() {
        let looper = looper();
        looper.add_handler(Duration::ZERO, Action::Join, |_: MessageLooper, _: Message| async {
            anyhow::Ok(())
        });
        looper.term();
        looper.event_loop().await.unwrap();
        assert_eq!(
            looper.try_push(Message::new(Action::Join, State::Probe)),
            Err(LooperError::Closed)
        );
    }

    #[tokio::test]
    async fn test_second_event_loop_is_refused() {
        let looper = looper();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        looper.add_handler(
            Duration::ZERO,
            Action::Init,
            move |looper: MessageLooper, _: Message| {
                let tx = tx.clone();
                async move {
                    let second = looper.event_loop().await;
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(second);
                    }
                    anyhow::Ok(())
                }
            },
        );
        let run = spawn_loop(&looper);
        looper.push(Message::new(Action::Init, State::Probe)).await.unwrap();
        assert_eq!(rx.await.unwrap(), Err(LooperError::AlreadyRunning));
        looper.term();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_message() {
        let looper = looper();
        let reports = Arc::new(Mutex::new(Vec::new()));
        {
            let reports = reports.clone();
            looper.add_handler(
                Duration::ZERO,
                Action::Lock,
                move |looper: MessageLooper, msg: Message| {
                    let reports = reports.clone();
                    async move {
                        match msg.state() {
                            State::Probe => anyhow::bail!("lock already held"),
                            State::Error => {
                                reports.lock().push(msg.content_str(0).unwrap_or_default().to_string());
                                looper.term();
                            }
                            _ => {}
                        }
                        Ok(())
                    }
                },
            );
        }
        let run = spawn_loop(&looper);
        looper.push(Message::new(Action::Lock, State::Probe)).await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(reports.lock().clone(), vec!["lock already held".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_error_handler_goes_to_sink() {
        let sink = Arc::new(CollectingSink::new());
        let looper = MessageLooper::new(8, sink.clone());
        looper.add_handler(Duration::ZERO, Action::Crash, |_: MessageLooper, _: Message| async {
            Err::<(), _>(anyhow::anyhow!("still broken"))
        });
        let run = spawn_loop(&looper);
        looper.push(Message::new(Action::Crash, State::Probe)).await.unwrap();
        for _ in 0..100 {
            if !sink.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        looper.term();
        run.await.unwrap().unwrap();
        assert_eq!(sink.entries(), vec!["crash: still broken".to_string()]);
    }

    #[tokio::test]
    async fn test_push_counts_failed_visits() {
        let looper = looper();
        let mut msg = Message::new(Action::Checkin, State::Failed);
        msg.visit();
        looper.push(msg).await.unwrap();
        let mut rx = looper.inner.mailbox_rx.lock().take().unwrap();
        assert_eq!(rx.recv().await.unwrap().visit_count(), 2);
    }

    #[tokio::test]
    async fn test_try_push_reports_full() {
        let looper = MessageLooper::new(1, Arc::new(TracingSink));
        looper.try_push(Message::new(Action::Join, State::Probe)).unwrap();
        assert_eq!(
            looper.try_push(Message::new(Action::Join, State::Probe)),
            Err(LooperError::Full)
        );
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let looper = looper();
        assert_eq!(
            looper.set_interval(Duration::ZERO, || None),
            Err(LooperError::ZeroPeriod)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cycle_per_tick() {
        let looper = looper();
        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let observed = observed.clone();
            looper.add_handler(
                Duration::ZERO,
                Action::Heartbeat,
                move |looper: MessageLooper, msg: Message| {
                    let observed = observed.clone();
                    async move {
                        let tick = msg.content_str(0).unwrap_or_default().to_string();
                        match msg.state() {
                            State::Probe => looper.push(msg.transitioned(State::Ask)).await?,
                            State::Ask => {
                                observed.lock().push((tick, State::Ask));
                                looper.push(msg.transitioned(State::Succeed)).await?;
                            }
                            State::Succeed => observed.lock().push((tick, State::Succeed)),
                            _ => {}
                        }
                        anyhow::Ok(())
                    }
                },
            );
        }
        let mut tick = 0u32;
        looper
            .set_interval(Duration::from_millis(1000), move || {
                tick += 1;
                Some(Message::new(Action::Heartbeat, State::Probe).with_content(tick.to_string()))
            })
            .unwrap();
        let run = spawn_loop(&looper);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        looper.term();
        run.await.unwrap().unwrap();

        let observed = observed.lock().clone();
        let expected: Vec<(String, State)> = (1..=3)
            .flat_map(|t| [(t.to_string(), State::Ask), (t.to_string(), State::Succeed)])
            .collect();
        assert_eq!(observed, expected);
    }
}
