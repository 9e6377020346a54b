//! Bounded worker queue: a fixed-capacity request channel and response
//! channel served by exactly one dedicated worker thread.
//!
//! The worker loops: receive a request (blocking), take the resource lock,
//! run the handler, release the lock, send the response (blocking). The lock
//! is never held across a channel operation, so at most one operation touches
//! the resource at any instant, and a stalled worker pushes back on submitters
//! instead of buffering without bound.
//!
//! All submitters share one response channel. Responses carry the caller's
//! correlation id. [`WorkerQueue::call`] registers a private channel for its
//! id, and whichever reader takes a response off the shared channel hands it
//! to the caller waiting on that id. Responses nobody waits for are parked
//! for [`WorkerQueue::poll`]; those of calls that timed out are discarded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{
    after, at, bounded, never, select, Receiver, SendTimeoutError, Sender, TrySendError,
};

use crate::error::NodeError;

/// Caller-assigned correlation id. The worker never changes it.
pub type RequestId = u32;

/// Messages that carry a correlation id.
pub trait Correlated {
    fn request_id(&self) -> RequestId;
}

/// Response envelope for workers whose replies carry no extra state.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub id: RequestId,
    pub result: Result<T, NodeError>,
}

impl<T> Response<T> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    /// Human-readable status: `"ok"` or the error message.
    pub fn message(&self) -> String {
        match &self.result {
            Ok(_) => "ok".into(),
            Err(e) => e.to_string(),
        }
    }
}

impl<T> Correlated for Response<T> {
    fn request_id(&self) -> RequestId {
        self.id
    }
}

/// Thread parameters for one worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSpec {
    /// Thread name, also used in log lines.
    pub name: &'static str,
    /// Capacity of both the request and the response channel.
    pub capacity: usize,
    pub stack_size: usize,
}

pub struct WorkerQueue<Req, Resp> {
    name: &'static str,
    requests: Option<Sender<Req>>,
    responses: Option<Receiver<Resp>>,
    worker: Option<JoinHandle<()>>,
    next_id: AtomicU32,
    routes: Mutex<Routes<Resp>>,
}

/// Where responses read off the shared channel go.
struct Routes<Resp> {
    /// Callers blocked in `call`, by request id.
    waiting: HashMap<RequestId, Sender<Resp>>,
    /// Ids of calls that timed out.
    abandoned: HashSet<RequestId>,
    /// Responses read by a `call` on behalf of `poll` users.
    unclaimed: VecDeque<Resp>,
}

impl<Req, Resp> WorkerQueue<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Spawn the worker thread. `handler` runs with the lock on `resource`
    /// held and must turn every request into exactly one response.
    pub fn spawn<R, H>(
        spec: WorkerSpec,
        resource: Arc<Mutex<R>>,
        mut handler: H,
    ) -> Result<Self, NodeError>
    where
        R: Send + 'static,
        H: FnMut(&mut R, Req) -> Resp + Send + 'static,
    {
        if spec.capacity == 0 {
            return Err(NodeError::Config("queue capacity must be non-zero"));
        }

        let (req_tx, req_rx) = bounded::<Req>(spec.capacity);
        let (resp_tx, resp_rx) = bounded::<Resp>(spec.capacity);
        let name = spec.name;

        let worker = thread::Builder::new()
            .name(name.into())
            .stack_size(spec.stack_size)
            .spawn(move || {
                log::info!("{} worker started", name);
                while let Ok(request) = req_rx.recv() {
                    let response = {
                        let mut guard = lock_or_recover(&resource, name);
                        handler(&mut *guard, request)
                    };
                    if resp_tx.send(response).is_err() {
                        break;
                    }
                }
                log::info!("{} worker stopped", name);
            })
            .map_err(|_| NodeError::Spawn(name))?;

        Ok(Self {
            name,
            requests: Some(req_tx),
            responses: Some(resp_rx),
            worker: Some(worker),
            next_id: AtomicU32::new(1),
            routes: Mutex::new(Routes {
                waiting: HashMap::new(),
                abandoned: HashSet::new(),
                unclaimed: VecDeque::new(),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fresh correlation id for this queue.
    pub fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a request, blocking while the request channel is full.
    pub fn submit(&self, request: Req) -> Result<(), NodeError> {
        self.sender()?
            .send(request)
            .map_err(|_| NodeError::QueueClosed)
    }

    /// Enqueue a request, giving up with [`NodeError::QueueFull`] after `timeout`.
    pub fn submit_timeout(&self, request: Req, timeout: Duration) -> Result<(), NodeError> {
        match self.sender()?.send_timeout(request, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(NodeError::QueueFull),
            Err(SendTimeoutError::Disconnected(_)) => Err(NodeError::QueueClosed),
        }
    }

    /// Enqueue a request without blocking.
    pub fn try_submit(&self, request: Req) -> Result<(), NodeError> {
        match self.sender()?.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NodeError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(NodeError::QueueClosed),
        }
    }

    fn sender(&self) -> Result<&Sender<Req>, NodeError> {
        self.requests.as_ref().ok_or(NodeError::QueueClosed)
    }
}

impl<Req, Resp> WorkerQueue<Req, Resp>
where
    Req: Correlated + Send + 'static,
    Resp: Correlated + Send + 'static,
{
    /// Next response not claimed by a pending [`call`](Self::call), blocking
    /// until one is available. `None` once the worker has exited and every
    /// response has been drained.
    pub fn poll(&self) -> Option<Resp> {
        self.next_unclaimed(never())
    }

    /// Next unclaimed response, waiting at most `timeout`.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Resp> {
        self.next_unclaimed(after(timeout))
    }

    /// Submit `request` and wait for the response with its correlation id.
    ///
    /// Safe to use from several threads at once, and alongside
    /// `submit` + `poll` users: a response read by someone else is routed to
    /// its waiting caller, or parked for `poll`. The response of a call that
    /// timed out is discarded when it arrives. With `timeout == None` both the
    /// submit and the wait block indefinitely.
    pub fn call(&self, request: Req, timeout: Option<Duration>) -> Result<Resp, NodeError> {
        let id = request.request_id();
        let deadline = timeout.map(|t| Instant::now() + t);

        // Registered before submitting, so no reader can mistake the
        // response for an unclaimed one.
        let (mine_tx, mine) = bounded::<Resp>(1);
        lock_or_recover(&self.routes, self.name).waiting.insert(id, mine_tx);

        let submitted = match deadline {
            Some(deadline) => self.submit_timeout(request, remaining(deadline)),
            None => self.submit(request),
        };
        if let Err(e) = submitted {
            lock_or_recover(&self.routes, self.name).waiting.remove(&id);
            return Err(e);
        }
        let result = self.wait(id, deadline, &mine);

        let mut routes = lock_or_recover(&self.routes, self.name);
        routes.waiting.remove(&id);
        match result {
            // Routed to us after the deadline but before deregistration.
            Err(NodeError::Timeout) => mine.try_recv().or_else(|_| {
                routes.abandoned.insert(id);
                Err(NodeError::Timeout)
            }),
            other => other,
        }
    }

    fn wait(
        &self,
        id: RequestId,
        deadline: Option<Instant>,
        mine: &Receiver<Resp>,
    ) -> Result<Resp, NodeError> {
        let responses = self.responses.as_ref().ok_or(NodeError::QueueClosed)?;
        let timer = match deadline {
            Some(deadline) => at(deadline),
            None => never(),
        };

        loop {
            select! {
                recv(mine) -> response => {
                    return response.map_err(|_| NodeError::QueueClosed);
                }
                recv(responses) -> response => match response {
                    Ok(response) if response.request_id() == id => return Ok(response),
                    Ok(response) => {
                        if let Some(unclaimed) = self.route(response) {
                            let mut routes = lock_or_recover(&self.routes, self.name);
                            routes.unclaimed.push_back(unclaimed);
                        }
                    }
                    // Worker gone; another reader may have routed ours first.
                    Err(_) => return mine.try_recv().map_err(|_| NodeError::QueueClosed),
                },
                recv(timer) -> _ => return Err(NodeError::Timeout),
            }
        }
    }

    fn next_unclaimed(&self, timer: Receiver<Instant>) -> Option<Resp> {
        if let Some(parked) = lock_or_recover(&self.routes, self.name).unclaimed.pop_front() {
            return Some(parked);
        }
        let responses = self.responses.as_ref()?;
        loop {
            select! {
                recv(responses) -> response => {
                    if let Some(unclaimed) = self.route(response.ok()?) {
                        return Some(unclaimed);
                    }
                }
                recv(timer) -> _ => return None,
            }
        }
    }

    /// Hand `response` to the caller waiting on its id, or drop it if its
    /// caller gave up. Returns it back when nobody claims it.
    fn route(&self, response: Resp) -> Option<Resp> {
        let id = response.request_id();
        let mut routes = lock_or_recover(&self.routes, self.name);
        if let Some(waiter) = routes.waiting.get(&id) {
            // Capacity 1 and one response per id, so this never blocks.
            let _ = waiter.try_send(response);
            return None;
        }
        if routes.abandoned.remove(&id) {
            log::debug!("{}: discarding late response {}", self.name, id);
            return None;
        }
        Some(response)
    }
}

impl<Req, Resp> WorkerQueue<Req, Resp> {
    /// Close the request channel and wait for the worker to exit.
    ///
    /// Requests still queued are dropped unanswered; a handler already
    /// running is allowed to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.requests.take();
        self.responses.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} worker panicked", self.name);
            }
        }
    }
}

impl<Req, Resp> Drop for WorkerQueue<Req, Resp> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

pub(crate) fn lock_or_recover<'a, R>(resource: &'a Mutex<R>, name: &str) -> MutexGuard<'a, R> {
    resource.lock().unwrap_or_else(|poisoned| {
        log::warn!("{} lock poisoned, recovering", name);
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    #[derive(Debug)]
    struct Echo {
        id: RequestId,
        value: u32,
    }

    impl Correlated for Echo {
        fn request_id(&self) -> RequestId {
            self.id
        }
    }

    fn spec(capacity: usize) -> WorkerSpec {
        WorkerSpec {
            name: "test",
            capacity,
            stack_size: 64 * 1024,
        }
    }

    /// Worker that doubles the value and counts handled requests.
    fn doubling(capacity: usize) -> (WorkerQueue<Echo, Response<u32>>, Arc<Mutex<u32>>) {
        let handled = Arc::new(Mutex::new(0u32));
        let queue = WorkerQueue::spawn(
            spec(capacity),
            handled.clone(),
            |count: &mut u32, req: Echo| {
                *count += 1;
                Response {
                    id: req.id,
                    result: Ok(req.value * 2),
                }
            },
        )
        .unwrap();
        (queue, handled)
    }

    /// Worker that signals `started` per request and then waits for one
    /// message on `release` before answering.
    fn gated(
        capacity: usize,
    ) -> (WorkerQueue<Echo, Response<u32>>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let queue = WorkerQueue::spawn(
            spec(capacity),
            Arc::new(Mutex::new(())),
            move |_: &mut (), req: Echo| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Response {
                    id: req.id,
                    result: Ok(req.value),
                }
            },
        )
        .unwrap();
        (queue, started_rx, release_tx)
    }

    #[test]
    fn every_request_gets_exactly_one_response() {
        let (queue, handled) = doubling(4);

        let seen = thread::scope(|s| {
            s.spawn(|| {
                for id in 1..=20 {
                    queue.submit(Echo { id, value: id }).unwrap();
                }
            });

            let mut seen = HashSet::new();
            for _ in 0..20 {
                let response = queue.poll_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(response.result, Ok(response.id * 2));
                assert!(seen.insert(response.id), "duplicate response {}", response.id);
            }
            seen
        });

        assert_eq!(seen, (1..=20).collect::<HashSet<_>>());
        assert!(queue.poll_timeout(Duration::from_millis(50)).is_none());
        assert_eq!(*handled.lock().unwrap(), 20);
    }

    #[test]
    fn responses_follow_submission_order() {
        let (queue, _) = doubling(8);
        for id in 1..=8 {
            queue.submit(Echo { id, value: 1 }).unwrap();
        }
        let order: Vec<RequestId> = (0..8).map(|_| queue.poll().unwrap().id).collect();
        assert_eq!(order, (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn call_parks_responses_of_plain_submits() {
        let (queue, _) = doubling(4);
        queue.submit(Echo { id: 7, value: 100 }).unwrap();

        let response = queue.call(Echo { id: 8, value: 3 }, None).unwrap();
        assert_eq!(response.id, 8);
        assert_eq!(response.result, Ok(6));

        let parked = queue.poll_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(parked.id, 7);
        assert_eq!(parked.result, Ok(200));
    }

    #[test]
    fn full_queue_surfaces_capacity_error() {
        let (queue, started_rx, release_tx) = gated(1);

        // First request occupies the worker, second fills the channel.
        queue.submit(Echo { id: 1, value: 1 }).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        queue.submit(Echo { id: 2, value: 2 }).unwrap();

        assert_eq!(queue.try_submit(Echo { id: 3, value: 3 }), Err(NodeError::QueueFull));
        assert_eq!(
            queue.submit_timeout(Echo { id: 3, value: 3 }, Duration::from_millis(20)),
            Err(NodeError::QueueFull)
        );

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(queue.poll().unwrap().id, 1);
        assert_eq!(queue.poll().unwrap().id, 2);
    }

    #[test]
    fn blocking_submit_waits_for_room() {
        let (queue, started_rx, release_tx) = gated(1);
        queue.submit(Echo { id: 1, value: 1 }).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        queue.submit(Echo { id: 2, value: 2 }).unwrap();

        let submitted = AtomicBool::new(false);
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                let result = queue.submit(Echo { id: 3, value: 3 });
                submitted.store(true, Ordering::SeqCst);
                result
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!submitted.load(Ordering::SeqCst), "submit returned while full");

            for _ in 0..3 {
                release_tx.send(()).unwrap();
            }
            assert_eq!(blocked.join().unwrap(), Ok(()));
        });

        let ids: Vec<RequestId> = (0..3)
            .map(|_| queue.poll_timeout(Duration::from_secs(5)).unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_calls_each_get_their_own_response() {
        let (queue, handled) = doubling(2);

        thread::scope(|s| {
            for t in 0..4u32 {
                let queue = &queue;
                s.spawn(move || {
                    for n in 0..50u32 {
                        let id = queue.next_request_id();
                        let value = t * 1000 + n;
                        let response = queue
                            .call(Echo { id, value }, Some(Duration::from_secs(5)))
                            .unwrap();
                        assert_eq!(response.id, id);
                        assert_eq!(response.result, Ok(value * 2));
                    }
                });
            }
        });

        assert_eq!(*handled.lock().unwrap(), 200);
    }

    #[test]
    fn poll_leaves_responses_of_pending_calls_alone() {
        let (queue, started_rx, release_tx) = gated(2);
        queue.submit(Echo { id: 1, value: 10 }).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        thread::scope(|s| {
            let caller = s.spawn(|| queue.call(Echo { id: 2, value: 20 }, None));

            release_tx.send(()).unwrap();
            release_tx.send(()).unwrap();
            assert_eq!(caller.join().unwrap().unwrap().result, Ok(20));
        });

        // Only the submitted request is left for poll, whoever read it first.
        assert_eq!(queue.poll_timeout(Duration::from_secs(5)).unwrap().id, 1);
        assert!(queue.poll_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn call_times_out_when_worker_is_slow() {
        let queue = WorkerQueue::spawn(
            spec(2),
            Arc::new(Mutex::new(())),
            |_: &mut (), req: Echo| {
                thread::sleep(Duration::from_millis(200));
                Response {
                    id: req.id,
                    result: Ok(req.value),
                }
            },
        )
        .unwrap();

        let result = queue.call(Echo { id: 1, value: 1 }, Some(Duration::from_millis(20)));
        assert_eq!(result.unwrap_err(), NodeError::Timeout);

        // The abandoned response still arrives and is dropped, not parked.
        let response = queue
            .call(Echo { id: 2, value: 5 }, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(response.result, Ok(5));
        assert!(queue.poll_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result: Result<WorkerQueue<Echo, Response<u32>>, _> =
            WorkerQueue::spawn(spec(0), Arc::new(Mutex::new(())), |_: &mut (), req: Echo| Response {
                id: req.id,
                result: Ok(req.value),
            });
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[test]
    fn request_ids_increase() {
        let (queue, _) = doubling(1);
        let a = queue.next_request_id();
        let b = queue.next_request_id();
        assert!(b > a);
    }

    #[test]
    fn shutdown_joins_worker() {
        let (queue, handled) = doubling(2);
        queue.call(Echo { id: 1, value: 1 }, None).unwrap();
        queue.shutdown();
        assert_eq!(*handled.lock().unwrap(), 1);
    }
}
