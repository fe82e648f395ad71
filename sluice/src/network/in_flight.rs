//! Bookkeeping of the requests awaiting responses on one connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::stream_id::{StreamIdGenerator, UnallocatedStreamId};
use crate::errors::{BrokenConnectionErrorKind, ProtocolAnomaly, RequestError};
use crate::frame::response::ResponseOpcode;
use crate::frame::{is_final_continuous_frame, Compression, FrameParams};

/// Orphans older than this are counted towards [`OLD_ORPHAN_COUNT_THRESHOLD`].
pub(crate) const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

/// A connection with this many old orphans is considered broken.
///
/// Connections with fewer than twice as many stream ids give up once half of
/// their ids are old orphans.
pub(crate) const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;

/// A connection with an orphan this old is considered broken, however few orphans it has.
pub(crate) const MAX_ORPHAN_AGE: Duration = Duration::from_secs(60);

pub(crate) type RequestId = u64;

/// A raw response frame, as read by the router.
#[derive(Debug)]
pub(crate) struct TaskResponse {
    pub(crate) params: FrameParams,
    pub(crate) opcode: ResponseOpcode,
    pub(crate) body: Bytes,
    pub(crate) received_at: Instant,
}

pub(crate) type ResponseResult = Result<TaskResponse, RequestError>;

/// Where the response(s) to a request go.
#[derive(Debug)]
pub(crate) enum ResponseHandler {
    /// A request answered by exactly one frame.
    Single(oneshot::Sender<ResponseResult>),
    /// A continuous paging request, answered by frames until a final one.
    Stream(mpsc::UnboundedSender<ResponseResult>),
}

impl ResponseHandler {
    fn kind(&self) -> HandlerKind {
        match self {
            ResponseHandler::Single(_) => HandlerKind::Single,
            ResponseHandler::Stream(_) => HandlerKind::Stream,
        }
    }

    fn send(self, response: ResponseResult) {
        // The receiver may be gone already; its orphan notification is on the way.
        match self {
            ResponseHandler::Single(sender) => {
                let _ = sender.send(response);
            }
            ResponseHandler::Stream(sender) => {
                let _ = sender.send(response);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Single,
    Stream,
}

/// The moment a request times out, along with the timeout it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline {
    pub(crate) at: Instant,
    pub(crate) timeout: Duration,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    request_id: RequestId,
    handler: ResponseHandler,
    deadline: Option<Deadline>,
    // Whether the writer may have put the request on the wire.
    // Only written requests can still be answered by the server.
    written: bool,
}

/// Counters of the things that went wrong on a connection without breaking it.
#[derive(Debug, Default)]
pub struct ConnectionDiagnostics {
    protocol_anomalies: AtomicU64,
    late_frames_dropped: AtomicU64,
    consistency_violations: AtomicU64,
    duplicate_resolutions: AtomicU64,
}

impl ConnectionDiagnostics {
    /// Frames that broke the protocol: unknown stream ids, out-of-order or duplicate pages.
    ///
    /// A non-zero value marks the connection as suspect.
    pub fn protocol_anomalies(&self) -> u64 {
        self.protocol_anomalies.load(Ordering::Relaxed)
    }

    /// Frames that arrived for requests which had timed out or were cancelled.
    pub fn late_frames_dropped(&self) -> u64 {
        self.late_frames_dropped.load(Ordering::Relaxed)
    }

    /// Violations of the connection's own bookkeeping, such as releasing a stream id twice.
    pub fn consistency_violations(&self) -> u64 {
        self.consistency_violations.load(Ordering::Relaxed)
    }

    /// Attempts to resolve a request which was resolved already.
    pub fn duplicate_resolutions(&self) -> u64 {
        self.duplicate_resolutions.load(Ordering::Relaxed)
    }

    pub(crate) fn record_anomaly(&self, anomaly: &ProtocolAnomaly) {
        warn!("Protocol anomaly: {}", anomaly);
        self.protocol_anomalies.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stream ids whose requests were abandoned after being written.
///
/// The server may still answer them, so the ids stay reserved until it does.
struct OrphanageTracker {
    orphans: HashMap<i16, (Instant, HandlerKind)>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16, kind: HandlerKind) {
        let now = Instant::now();
        self.orphans.insert(stream_id, (now, kind));
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some((time, _)) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn kind(&self, stream_id: i16) -> Option<HandlerKind> {
        self.orphans.get(&stream_id).map(|(_, kind)| *kind)
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let Some(minimal_age) = Instant::now().checked_sub(age) else {
            return 0;
        };
        // Linear in the number of old orphans only.
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }

    fn oldest(&self) -> Option<(i16, Duration)> {
        let &(orphaned_at, stream_id) = self.by_orphaning_times.first()?;
        Some((stream_id, orphaned_at.elapsed()))
    }
}

/// What the registry did with a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameDisposition {
    /// Handed over to the waiting party.
    Delivered,
    /// The request was abandoned; the frame was dropped.
    Late,
    /// No request was registered on the frame's stream id.
    Unknown,
}

/// Whether the writer should put a request on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteDecision {
    Write,
    /// The request was resolved or abandoned while queued.
    Skip,
}

/// Associates outstanding requests with their stream ids and resolves them.
///
/// Every entry is resolved exactly once: by a response frame, by an error (deadline
/// sweep, connection shutdown) or by being orphaned. Resolving an entry removes it,
/// so a second attempt finds nothing and is only counted.
pub(crate) struct InFlightRegistry {
    stream_ids: StreamIdGenerator,
    entries: HashMap<i16, PendingRequest>,
    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
    deadlines: BTreeSet<(Instant, i16)>,
    diagnostics: Arc<ConnectionDiagnostics>,
    closed_with: Option<RequestError>,
}

impl InFlightRegistry {
    pub(crate) fn new(max_requests: usize, diagnostics: Arc<ConnectionDiagnostics>) -> Self {
        Self {
            stream_ids: StreamIdGenerator::new(max_requests),
            entries: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
            deadlines: BTreeSet::new(),
            diagnostics,
            closed_with: None,
        }
    }

    /// Allocates a stream id for the request and records where its response goes.
    ///
    /// Fails at once when no stream id is free or the connection is shut down.
    pub(crate) fn register(
        &mut self,
        request_id: RequestId,
        handler: ResponseHandler,
        deadline: Option<Deadline>,
    ) -> Result<i16, RequestError> {
        if let Some(err) = &self.closed_with {
            return Err(err.clone());
        }
        let stream_id = self
            .stream_ids
            .allocate()
            .ok_or(RequestError::StreamExhausted)?;

        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline.at, stream_id));
        }
        self.request_to_stream.insert(request_id, stream_id);
        let prev = self.entries.insert(
            stream_id,
            PendingRequest {
                request_id,
                handler,
                deadline,
                written: false,
            },
        );
        debug_assert!(prev.is_none());
        trace!(stream_id, request_id, "Registered request");

        Ok(stream_id)
    }

    /// Called by the writer right before it writes the request.
    pub(crate) fn prepare_write(&mut self, stream_id: i16, request_id: RequestId) -> WriteDecision {
        match self.entries.get_mut(&stream_id) {
            Some(entry) if entry.request_id == request_id => {
                entry.written = true;
                WriteDecision::Write
            }
            _ => WriteDecision::Skip,
        }
    }

    /// Whether frames on `stream_id` belong to a continuous paging request,
    /// live or orphaned.
    ///
    /// The reader asks this before classifying a frame, so that classification
    /// happens without holding the lock.
    pub(crate) fn expects_pages(&self, stream_id: i16) -> bool {
        let kind = match self.entries.get(&stream_id) {
            Some(entry) => Some(entry.handler.kind()),
            None => self.orphanage_tracker.kind(stream_id),
        };
        kind == Some(HandlerKind::Stream)
    }

    /// Routes a response frame to the request registered on its stream id.
    ///
    /// `final_page` tells whether the frame ends a continuous paging stream, if
    /// the caller classified it. Unclassified frames on a paging stream are
    /// classified here.
    pub(crate) fn complete(
        &mut self,
        response: TaskResponse,
        final_page: Option<bool>,
        compression: Option<Compression>,
    ) -> FrameDisposition {
        let stream_id = response.params.stream;
        let ends_stream = |response: &TaskResponse| {
            final_page.unwrap_or_else(|| {
                is_final_continuous_frame(
                    response.opcode,
                    response.params,
                    compression,
                    response.body.clone(),
                )
            })
        };

        if let Some(kind) = self.orphanage_tracker.kind(stream_id) {
            let terminal = match kind {
                HandlerKind::Single => true,
                HandlerKind::Stream => ends_stream(&response),
            };
            if terminal {
                self.orphanage_tracker.remove(stream_id);
                self.release_stream_id(stream_id);
            }
            self.diagnostics
                .late_frames_dropped
                .fetch_add(1, Ordering::Relaxed);
            trace!(stream_id, terminal, "Dropped late frame of an abandoned request");
            return FrameDisposition::Late;
        }

        let Some(entry) = self.entries.get(&stream_id) else {
            self.diagnostics
                .record_anomaly(&ProtocolAnomaly::UnknownStreamId(stream_id));
            return FrameDisposition::Unknown;
        };

        let terminal = match entry.handler {
            ResponseHandler::Single(_) => true,
            ResponseHandler::Stream(_) => ends_stream(&response),
        };

        if terminal {
            if let Some(entry) = self.remove_entry(stream_id) {
                self.release_stream_id(stream_id);
                entry.handler.send(Ok(response));
            }
        } else if let ResponseHandler::Stream(sender) = &entry.handler {
            let _ = sender.send(Ok(response));
        }

        FrameDisposition::Delivered
    }

    /// Fails the request registered on `stream_id` with `error`.
    ///
    /// If the request may have reached the server, its stream id stays reserved
    /// until the server answers it.
    pub(crate) fn complete_with_error(&mut self, stream_id: i16, error: RequestError) {
        let Some(entry) = self.remove_entry(stream_id) else {
            self.diagnostics
                .duplicate_resolutions
                .fetch_add(1, Ordering::Relaxed);
            debug!(stream_id, "Ignoring resolution of a request resolved already");
            return;
        };
        self.retire_stream_id(stream_id, entry.written, entry.handler.kind());
        entry.handler.send(Err(error));
    }

    /// Forgets the handler of a request whose caller went away.
    pub(crate) fn orphan(&mut self, request_id: RequestId) {
        let Some(&stream_id) = self.request_to_stream.get(&request_id) else {
            // Resolved before the notification arrived.
            return;
        };
        debug!(
            "Orphaning stream_id = {} associated with request_id = {}",
            stream_id, request_id
        );
        if let Some(entry) = self.remove_entry(stream_id) {
            self.retire_stream_id(stream_id, entry.written, entry.handler.kind());
        }
    }

    /// Fails every request whose deadline is not later than `now`.
    ///
    /// Returns the earliest deadline still pending.
    pub(crate) fn sweep_expired(&mut self, now: Instant) -> Option<Instant> {
        while let Some(&(at, stream_id)) = self.deadlines.first() {
            if at > now {
                return Some(at);
            }
            let timeout = self
                .entries
                .get(&stream_id)
                .and_then(|entry| entry.deadline)
                .filter(|deadline| deadline.at == at)
                .map(|deadline| deadline.timeout);
            match timeout {
                Some(timeout) => {
                    debug!(stream_id, "Request timed out after {:?}", timeout);
                    self.complete_with_error(stream_id, RequestError::Timeout(timeout));
                }
                None => {
                    self.deadlines.remove(&(at, stream_id));
                }
            }
        }
        None
    }

    /// Tells whether the orphaned stream ids leave the connection unusable.
    ///
    /// That is the case once too many of them are old, relative to the number of
    /// stream ids, or once any of them was not answered for [`MAX_ORPHAN_AGE`].
    pub(crate) fn orphan_overload(&self) -> Option<BrokenConnectionErrorKind> {
        let limit = OLD_ORPHAN_COUNT_THRESHOLD.min((self.stream_ids.capacity() / 2).max(1));
        let old_orphans = self
            .orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD);
        if old_orphans >= limit {
            return Some(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(
                u16::try_from(old_orphans).unwrap_or(u16::MAX),
            ));
        }
        let (stream_id, age) = self.orphanage_tracker.oldest()?;
        (age >= MAX_ORPHAN_AGE)
            .then_some(BrokenConnectionErrorKind::StaleOrphanedStreamId { stream_id, age })
    }

    /// Fails all pending requests with `error`, and every later registration too.
    ///
    /// Orphaned stream ids are released, as nothing can arrive for them anymore.
    pub(crate) fn drain(&mut self, error: RequestError) {
        self.closed_with = Some(error.clone());
        self.deadlines.clear();
        self.request_to_stream.clear();
        for (stream_id, entry) in std::mem::take(&mut self.entries) {
            self.release_stream_id(stream_id);
            entry.handler.send(Err(error.clone()));
        }
        let orphans = std::mem::replace(&mut self.orphanage_tracker, OrphanageTracker::new());
        for stream_id in orphans.orphans.into_keys() {
            self.release_stream_id(stream_id);
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn stream_ids_in_use(&self) -> usize {
        self.stream_ids.in_use()
    }

    fn remove_entry(&mut self, stream_id: i16) -> Option<PendingRequest> {
        let entry = self.entries.remove(&stream_id)?;
        // A late orphan notification must not find this request anymore.
        self.request_to_stream.remove(&entry.request_id);
        if let Some(deadline) = entry.deadline {
            self.deadlines.remove(&(deadline.at, stream_id));
        }
        Some(entry)
    }

    fn retire_stream_id(&mut self, stream_id: i16, written: bool, kind: HandlerKind) {
        if written {
            self.orphanage_tracker.insert(stream_id, kind);
        } else {
            self.release_stream_id(stream_id);
        }
    }

    fn release_stream_id(&mut self, stream_id: i16) {
        if let Err(err) = self.stream_ids.release(stream_id) {
            self.report_violation(err);
        }
    }

    fn report_violation(&self, err: UnallocatedStreamId) {
        self.diagnostics
            .consistency_violations
            .fetch_add(1, Ordering::Relaxed);
        error!("Internal consistency violation: {}", err);
        debug_assert!(false, "Internal consistency violation: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::*;
    use crate::frame::response::result::{ContinuousPageInfo, ResultMetadata, Rows};
    use crate::frame::response::{result, ResponseOpcode};
    use crate::frame::request::query::PagingStateResponse;
    use crate::frame::ProtocolVersion;

    fn registry(max_requests: usize) -> InFlightRegistry {
        InFlightRegistry::new(max_requests, Arc::new(ConnectionDiagnostics::default()))
    }

    fn frame(stream: i16, opcode: ResponseOpcode, body: Bytes) -> TaskResponse {
        TaskResponse {
            params: FrameParams {
                version: ProtocolVersion::DseV2.code() | 0x80,
                flags: 0,
                stream,
            },
            opcode,
            body,
            received_at: Instant::now(),
        }
    }

    fn ready(stream: i16) -> TaskResponse {
        frame(stream, ResponseOpcode::Ready, Bytes::new())
    }

    fn page(stream: i16, page_number: i32, last: bool) -> TaskResponse {
        let rows = result::Result::Rows(Rows {
            metadata: Arc::new(ResultMetadata::new(Vec::new())),
            paging_state_response: PagingStateResponse::NoMorePages,
            continuous_page: Some(ContinuousPageInfo { page_number, last }),
            rows_count: 0,
            rows: Vec::new(),
            serialized_size: 0,
        });
        let mut body = Vec::new();
        rows.serialize(&mut body).unwrap();
        frame(stream, ResponseOpcode::Result, body.into())
    }

    fn single(
        registry: &mut InFlightRegistry,
        request_id: RequestId,
    ) -> (i16, oneshot::Receiver<ResponseResult>) {
        let (sender, receiver) = oneshot::channel();
        let stream_id = registry
            .register(request_id, ResponseHandler::Single(sender), None)
            .unwrap();
        (stream_id, receiver)
    }

    #[tokio::test]
    async fn response_resolves_request_and_frees_id() {
        let mut registry = registry(4);
        let (stream_id, receiver) = single(&mut registry, 1);
        assert_eq!(registry.prepare_write(stream_id, 1), WriteDecision::Write);

        assert_eq!(registry.complete(ready(stream_id), None, None), FrameDisposition::Delivered);
        assert_matches!(receiver.await, Ok(Ok(TaskResponse { opcode: ResponseOpcode::Ready, .. })));
        assert_eq!(registry.stream_ids_in_use(), 0);

        // Resolving again only shows up in diagnostics.
        registry.complete_with_error(stream_id, RequestError::ConnectionClosed);
        assert_eq!(registry.diagnostics.duplicate_resolutions(), 1);
    }

    #[test]
    fn exhaustion_is_immediate() {
        let mut registry = registry(2);
        let (a, _ra) = single(&mut registry, 1);
        let (b, _rb) = single(&mut registry, 2);
        assert_ne!(a, b);
        let (sender, _receiver) = oneshot::channel();
        assert_matches!(
            registry.register(3, ResponseHandler::Single(sender), None),
            Err(RequestError::StreamExhausted)
        );
    }

    #[test]
    fn unknown_stream_id_is_an_anomaly() {
        let mut registry = registry(2);
        assert_eq!(registry.complete(ready(1), None, None), FrameDisposition::Unknown);
        assert_eq!(registry.diagnostics.protocol_anomalies(), 1);
        assert_eq!(registry.stream_ids_in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_fails_expired_requests_with_configured_timeout() {
        let mut registry = registry(4);
        let (sender, receiver) = oneshot::channel();
        let timeout = Duration::from_millis(100);
        let stream_id = registry
            .register(7, ResponseHandler::Single(sender), Some(Deadline::after(timeout)))
            .unwrap();
        let (_other, _other_receiver) = single(&mut registry, 8);

        assert_eq!(registry.sweep_expired(Instant::now()), Some(Instant::now() + timeout));
        tokio::time::advance(timeout).await;
        assert_eq!(registry.sweep_expired(Instant::now()), None);

        let err = receiver.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Request timed out after 100ms");
        // Never written, so nothing can arrive for it.
        assert_eq!(registry.stream_ids_in_use(), 1);
        assert_eq!(registry.orphanage_tracker.kind(stream_id), None);
        assert_eq!(registry.prepare_write(stream_id, 7), WriteDecision::Skip);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_written_request_keeps_its_id_until_answered() {
        let mut registry = registry(1);
        let (sender, receiver) = oneshot::channel();
        let stream_id = registry
            .register(
                1,
                ResponseHandler::Single(sender),
                Some(Deadline::after(Duration::from_millis(10))),
            )
            .unwrap();
        registry.prepare_write(stream_id, 1);

        tokio::time::advance(Duration::from_millis(10)).await;
        registry.sweep_expired(Instant::now());
        assert_matches!(receiver.await, Ok(Err(RequestError::Timeout(_))));

        // Quarantined: the id cannot be reused yet.
        let (sender, _receiver) = oneshot::channel();
        assert_matches!(
            registry.register(2, ResponseHandler::Single(sender), None),
            Err(RequestError::StreamExhausted)
        );

        assert_eq!(registry.complete(ready(stream_id), None, None), FrameDisposition::Late);
        assert_eq!(registry.diagnostics.late_frames_dropped(), 1);
        let (reused, _receiver) = single(&mut registry, 3);
        assert_eq!(reused, stream_id);
    }

    #[test]
    fn orphaned_stream_waits_for_final_page() {
        let mut registry = registry(2);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let stream_id = registry
            .register(1, ResponseHandler::Stream(sender), None)
            .unwrap();
        registry.prepare_write(stream_id, 1);

        assert_eq!(registry.complete(page(stream_id, 1, false), None, None), FrameDisposition::Delivered);
        assert_matches!(receiver.try_recv(), Ok(Ok(_)));

        registry.orphan(1);
        assert_eq!(registry.complete(page(stream_id, 2, false), None, None), FrameDisposition::Late);
        assert_eq!(registry.stream_ids_in_use(), 1);
        assert_eq!(registry.complete(page(stream_id, 3, true), None, None), FrameDisposition::Late);
        assert_eq!(registry.stream_ids_in_use(), 0);
        assert_eq!(registry.orphanage_tracker.kind(stream_id), None);
    }

    #[test]
    fn classification_by_the_caller_is_trusted() {
        let mut registry = registry(2);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let stream_id = registry
            .register(1, ResponseHandler::Stream(sender), None)
            .unwrap();
        let (single_id, _single) = single(&mut registry, 2);
        assert!(registry.expects_pages(stream_id));
        assert!(!registry.expects_pages(single_id));
        assert!(!registry.expects_pages(5));

        // The body says "last", but the frame was classified as a middle page.
        registry.complete(page(stream_id, 1, true), Some(false), None);
        assert_eq!(registry.pending_count(), 2);
        registry.complete(page(stream_id, 2, false), Some(true), None);
        assert_eq!(registry.pending_count(), 1);
        assert!(!registry.expects_pages(stream_id));
        assert_matches!(receiver.try_recv(), Ok(Ok(_)));
        assert_matches!(receiver.try_recv(), Ok(Ok(_)));
    }

    fn orphan_written(registry: &mut InFlightRegistry, request_id: RequestId) -> i16 {
        let (stream_id, _receiver) = single(registry, request_id);
        registry.prepare_write(stream_id, request_id);
        registry.orphan(request_id);
        stream_id
    }

    #[tokio::test(start_paused = true)]
    async fn small_pool_breaks_once_half_of_its_ids_are_old_orphans() {
        let mut registry = registry(2);
        orphan_written(&mut registry, 1);
        assert_eq!(registry.stream_ids_in_use(), 1);
        assert_matches!(registry.orphan_overload(), None);

        tokio::time::advance(OLD_AGE_ORPHAN_THRESHOLD).await;
        assert_matches!(
            registry.orphan_overload(),
            Some(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn large_pool_breaks_on_an_orphan_that_is_never_answered() {
        let mut registry = registry(4096);
        let stream_id = orphan_written(&mut registry, 1);
        tokio::time::advance(OLD_AGE_ORPHAN_THRESHOLD).await;
        assert_matches!(registry.orphan_overload(), None);

        tokio::time::advance(MAX_ORPHAN_AGE).await;
        assert_matches!(
            registry.orphan_overload(),
            Some(BrokenConnectionErrorKind::StaleOrphanedStreamId { stream_id: id, .. }) if id == stream_id
        );

        // An answer ends the quarantine.
        registry.complete(ready(stream_id), None, None);
        assert_matches!(registry.orphan_overload(), None);
    }

    #[test]
    fn live_stream_is_released_by_final_page() {
        let mut registry = registry(2);
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let stream_id = registry
            .register(1, ResponseHandler::Stream(sender), None)
            .unwrap();
        registry.complete(page(stream_id, 1, false), None, None);
        assert_eq!(registry.pending_count(), 1);
        registry.complete(page(stream_id, 2, true), None, None);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.stream_ids_in_use(), 0);
        assert_matches!(receiver.try_recv(), Ok(Ok(_)));
        assert_matches!(receiver.try_recv(), Ok(Ok(_)));
    }

    #[tokio::test]
    async fn drain_fails_everything_and_refuses_new_requests() {
        let mut registry = registry(4);
        let (_a, ra) = single(&mut registry, 1);
        let (_b, rb) = single(&mut registry, 2);
        orphan_written(&mut registry, 3);
        assert_eq!(registry.stream_ids_in_use(), 3);
        registry.drain(RequestError::ConnectionClosed);

        assert_matches!(ra.await, Ok(Err(RequestError::ConnectionClosed)));
        assert_matches!(rb.await, Ok(Err(RequestError::ConnectionClosed)));
        assert_eq!(registry.stream_ids_in_use(), 0);
        let (sender, _receiver) = oneshot::channel();
        assert_matches!(
            registry.register(3, ResponseHandler::Single(sender), None),
            Err(RequestError::ConnectionClosed)
        );
    }

    #[test]
    fn orphan_of_unwritten_request_frees_id_and_skips_write() {
        let mut registry = registry(1);
        let (stream_id, _receiver) = single(&mut registry, 1);
        registry.orphan(1);
        assert_eq!(registry.stream_ids_in_use(), 0);
        let (reused, _receiver) = single(&mut registry, 2);
        assert_eq!(reused, stream_id);
        // The stale task still sitting in the write queue must not be written.
        assert_eq!(registry.prepare_write(stream_id, 1), WriteDecision::Skip);
        assert_eq!(registry.prepare_write(stream_id, 2), WriteDecision::Write);
    }
}
