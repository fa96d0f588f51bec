//! Client-side reusable long-poll state machine, mirroring the `Watcher`
//! type real Central Dogma clients (e.g. `line-centraldogma-rs`) expose on
//! top of the raw watch RPC: a background loop keeps re-issuing the long
//! poll, republishing the latest value to registered listeners, with
//! jittered exponential backoff when the poll itself errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::errors::DogmaError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Started,
    Stopped,
}

#[derive(Clone)]
enum Signal<T> {
    Pending,
    Value(i64, T),
    Closed,
}

pub type FetchResult<T> = Result<Option<(i64, T)>, DogmaError>;
type FetchFn<T> = Arc<dyn Fn(i64) -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;
type Listener<T> = Arc<dyn Fn(i64, &T) + Send + Sync>;

/// Polls `fetch(last_known_rev)` in a loop. `fetch` should itself be a
/// bounded long poll (e.g. wrapping [`super::watch_repository`] or
/// [`super::watch_file`]) returning `Ok(None)` on a plain timeout so the
/// loop can immediately re-issue it without treating a timeout as an error.
pub struct Watcher<T: Clone + Send + Sync + 'static> {
    state: Mutex<State>,
    tx: watch::Sender<Signal<T>>,
    rx: watch::Receiver<Signal<T>>,
    listeners: Mutex<Vec<Listener<T>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Watcher<T> {
    pub fn start<F, Fut>(fetch: F) -> Arc<Self>
    where
        F: Fn(i64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let fetch: FetchFn<T> = Arc::new(move |rev| Box::pin(fetch(rev)));
        let (tx, rx) = watch::channel(Signal::Pending);
        let watcher = Arc::new(Self {
            state: Mutex::new(State::Initial),
            tx,
            rx,
            listeners: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });
        let handle = tokio::spawn(run_loop(Arc::clone(&watcher), fetch));
        // `try_lock` is safe here: nothing else can hold this lock before
        // the struct has escaped this function.
        *watcher.task.try_lock().expect("uncontended at construction") = Some(handle);
        *watcher.state.try_lock().expect("uncontended at construction") = State::Started;
        watcher
    }

    /// The most recently observed `(revision, value)`, if any poll has
    /// succeeded yet.
    pub fn latest(&self) -> Option<(i64, T)> {
        match &*self.rx.borrow() {
            Signal::Value(rev, v) => Some((*rev, v.clone())),
            Signal::Pending | Signal::Closed => None,
        }
    }

    pub fn latest_or(&self, default: T) -> T {
        self.latest().map(|(_, v)| v).unwrap_or(default)
    }

    /// Waits for the first value to arrive, or `timeout` to elapse (if
    /// given). Fails with `Internal` if the watcher is closed before a
    /// value ever arrives.
    pub async fn await_initial(&self, timeout: Option<Duration>) -> Result<(i64, T), DogmaError> {
        let wait = async {
            let mut rx = self.rx.clone();
            loop {
                {
                    match &*rx.borrow() {
                        Signal::Value(rev, v) => return Ok((*rev, v.clone())),
                        Signal::Closed => return Err(DogmaError::Internal("watcher closed".into())),
                        Signal::Pending => {}
                    }
                }
                rx.changed()
                    .await
                    .map_err(|_| DogmaError::Internal("watcher sender dropped".into()))?;
            }
        };
        match timeout {
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| DogmaError::Internal("awaitInitial timed out".into()))?,
            None => wait.await,
        }
    }

    /// Registers a listener. Invoked immediately if a value is already
    /// available, then on every subsequent update, one at a time.
    pub async fn watch(&self, listener: impl Fn(i64, &T) + Send + Sync + 'static) {
        let listener: Listener<T> = Arc::new(listener);
        if let Signal::Value(rev, v) = &*self.rx.borrow() {
            listener(*rev, v);
        }
        self.listeners.lock().await.push(listener);
    }

    /// Stops the background poll loop and marks the watcher terminally
    /// closed; any `awaitInitial` still pending (and none have arrived)
    /// fails.
    pub async fn close(&self) {
        *self.state.lock().await = State::Stopped;
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        if matches!(&*self.rx.borrow(), Signal::Pending) {
            let _ = self.tx.send(Signal::Closed);
        }
    }

    async fn is_stopped(&self) -> bool {
        *self.state.lock().await == State::Stopped
    }

    async fn publish(&self, revision: i64, value: T) {
        let _ = self.tx.send(Signal::Value(revision, value.clone()));
        let listeners = self.listeners.lock().await;
        for listener in listeners.iter() {
            listener(revision, &value);
        }
    }
}

async fn run_loop<T: Clone + Send + Sync + 'static>(watcher: Arc<Watcher<T>>, fetch: FetchFn<T>) {
    let mut last_known_rev = 0i64;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if watcher.is_stopped().await {
            return;
        }
        match fetch(last_known_rev).await {
            Ok(Some((revision, value))) => {
                last_known_rev = revision;
                backoff = INITIAL_BACKOFF;
                watcher.publish(revision, value).await;
            }
            Ok(None) => {
                backoff = INITIAL_BACKOFF;
            }
            Err(_) => {
                tokio::time::sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
