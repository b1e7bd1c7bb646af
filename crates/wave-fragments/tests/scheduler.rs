//! Scheduler behaviour against a gated fake fetcher and a recording store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_test::assert_ok;
use wave_channel::{FetchFragmentsRequest, FetchFragmentsResponse, ServiceError};
use wave_core::{RawFragment, ReturnStatus, SegmentId, WaveletId};
use wave_fragments::{
    FragmentConfig, FragmentConfigBuilder, FragmentError, FragmentFetcher, FragmentScheduler,
    SegmentStore,
};

struct FakeFetcher {
    requests: Mutex<Vec<FetchFragmentsRequest>>,
    gate: Semaphore,
    omit: Mutex<HashSet<SegmentId>>,
    fail: AtomicBool,
}

impl FakeFetcher {
    fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            gate: Semaphore::new(permits),
            omit: Mutex::new(HashSet::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn gated() -> Arc<Self> {
        Self::with_permits(0)
    }

    fn open() -> Arc<Self> {
        Self::with_permits(1000)
    }

    fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    fn requests(&self) -> Vec<FetchFragmentsRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl FragmentFetcher for FakeFetcher {
    async fn fetch_fragments(
        &self,
        request: FetchFragmentsRequest,
    ) -> Result<FetchFragmentsResponse, ServiceError> {
        self.requests.lock().push(request.clone());
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ServiceError::StreamEnded)?;
        permit.forget();

        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::UnexpectedResponse("connection reset".into()));
        }
        let omit = self.omit.lock();
        let fragments = request
            .start_versions
            .keys()
            .filter(|segment| !omit.contains(*segment))
            .map(|segment| (segment.clone(), RawFragment::default()))
            .collect();
        Ok(FetchFragmentsResponse {
            status: ReturnStatus::ok(),
            fragments,
            version: None,
        })
    }
}

#[derive(Default)]
struct FakeStore {
    open: Mutex<HashMap<WaveletId, u64>>,
    desired: Mutex<HashMap<WaveletId, u64>>,
    starts: Mutex<HashMap<SegmentId, u64>>,
    applied: Mutex<Vec<(WaveletId, SegmentId)>>,
}

impl FakeStore {
    fn applied(&self) -> Vec<SegmentId> {
        self.applied.lock().iter().map(|(_, s)| s.clone()).collect()
    }
}

impl SegmentStore for FakeStore {
    fn open_version(&self, wavelet_id: &WaveletId) -> Option<u64> {
        self.open.lock().get(wavelet_id).copied()
    }

    fn desired_version(&self, wavelet_id: &WaveletId) -> Option<u64> {
        self.desired.lock().get(wavelet_id).copied()
    }

    fn segment_start_version(&self, _wavelet_id: &WaveletId, segment: &SegmentId) -> Option<u64> {
        self.starts.lock().get(segment).copied()
    }

    fn apply_fragment(&self, wavelet_id: &WaveletId, segment: &SegmentId, _fragment: RawFragment) {
        self.applied.lock().push((wavelet_id.clone(), segment.clone()));
    }
}

fn wavelet(n: u32) -> WaveletId {
    WaveletId::new(format!("example.com!w+{}", n), "conv+root")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn scheduler(
    config: FragmentConfig,
    fetcher: &Arc<FakeFetcher>,
    store: &Arc<FakeStore>,
) -> FragmentScheduler {
    FragmentScheduler::new(config, fetcher.clone(), store.clone())
}

#[tokio::test(start_paused = true)]
async fn partial_reply_applies_the_rest_and_does_not_requeue() {
    let fetcher = FakeFetcher::open();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let mut updates = scheduler.subscribe();
    let w = wavelet(1);

    fetcher.omit.lock().insert(SegmentId::blip("b3"));
    scheduler.new_request(&w).unwrap();
    for id in ["b1", "b2", "b3"] {
        assert!(scheduler.add_segment(&w, SegmentId::blip(id), 0).unwrap());
    }
    scheduler.schedule_request().unwrap();
    settle().await;

    let update = updates.recv().await.unwrap();
    assert_eq!(update.wavelet_id, w);
    assert_eq!(update.segments, vec![SegmentId::blip("b1"), SegmentId::blip("b2")]);
    assert_eq!(store.applied(), vec![SegmentId::blip("b1"), SegmentId::blip("b2")]);

    // Nothing was retried on its own.
    assert_eq!(fetcher.requests().len(), 1);
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(scheduler.queued(), 0);
    assert!(!scheduler.is_awaiting(&w, &SegmentId::blip("b3")));

    // An explicit add fetches it again.
    fetcher.omit.lock().clear();
    assert!(scheduler.add_segment(&w, SegmentId::blip("b3"), 0).unwrap());
    scheduler.schedule_request().unwrap();
    settle().await;

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].start_versions.keys().cloned().collect::<Vec<_>>(),
        vec![SegmentId::blip("b3")]
    );
    assert_eq!(updates.recv().await.unwrap().segments, vec![SegmentId::blip("b3")]);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_logged_and_dropped() {
    let fetcher = FakeFetcher::open();
    fetcher.fail.store(true, Ordering::SeqCst);
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    scheduler.schedule_request().unwrap();
    settle().await;

    assert_eq!(fetcher.requests().len(), 1);
    assert!(store.applied().is_empty());
    assert_eq!(scheduler.in_flight(), 0);
    assert!(!scheduler.is_awaiting(&w, &SegmentId::Index));

    settle().await;
    assert_eq!(fetcher.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn segments_in_flight_are_not_queued_twice() {
    let fetcher = FakeFetcher::gated();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::blip("b1"), 0).unwrap();
    scheduler.schedule_request().unwrap();
    settle().await;
    assert!(scheduler.is_awaiting(&w, &SegmentId::blip("b1")));

    assert!(!scheduler.add_segment(&w, SegmentId::blip("b1"), 0).unwrap());
    assert!(scheduler.add_segment(&w, SegmentId::blip("b2"), 0).unwrap());
    assert_eq!(scheduler.queued(), 1);

    fetcher.release(1);
    settle().await;
    // Completion re-runs the pass and picks up b2.
    assert_eq!(fetcher.requests().len(), 2);
    fetcher.release(1);
    settle().await;
    assert_eq!(store.applied(), vec![SegmentId::blip("b1"), SegmentId::blip("b2")]);
}

#[tokio::test(start_paused = true)]
async fn calls_in_one_turn_share_a_batch() {
    let fetcher = FakeFetcher::open();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::Participants, 0).unwrap();
    scheduler.schedule_request().unwrap();
    scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    scheduler.schedule_request().unwrap();
    settle().await;

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].start_versions.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_the_cap() {
    let fetcher = FakeFetcher::gated();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);

    for n in 0..5 {
        let w = wavelet(n);
        scheduler.new_request(&w).unwrap();
        scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    }
    scheduler.schedule_request().unwrap();
    settle().await;

    assert_eq!(scheduler.in_flight(), 2);
    assert_eq!(fetcher.requests().len(), 2);
    assert_eq!(scheduler.queued(), 3);

    for issued in [3, 4, 5] {
        fetcher.release(1);
        settle().await;
        assert!(scheduler.in_flight() <= 2);
        assert_eq!(fetcher.requests().len(), issued);
    }

    fetcher.release(2);
    settle().await;
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(store.applied().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn request_versions_follow_the_store() {
    let fetcher = FakeFetcher::open();
    let store = Arc::new(FakeStore::default());
    let config = FragmentConfigBuilder::new()
        .reply_size(100, 900)
        .max_blips(7)
        .build();
    let scheduler = scheduler(config, &fetcher, &store);
    let w = wavelet(1);

    store.open.lock().insert(w.clone(), 10);
    store.desired.lock().insert(w.clone(), 15);
    store.starts.lock().insert(SegmentId::blip("known"), 12);
    store.starts.lock().insert(SegmentId::blip("ahead"), 40);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::blip("known"), 3).unwrap();
    scheduler.add_segment(&w, SegmentId::blip("ahead"), 3).unwrap();
    scheduler.add_segment(&w, SegmentId::blip("fresh"), 4).unwrap();
    scheduler.schedule_request().unwrap();
    settle().await;

    let request = &fetcher.requests()[0];
    let expected: BTreeMap<_, _> = [
        (SegmentId::blip("known"), 12),
        (SegmentId::blip("ahead"), 15),
        (SegmentId::blip("fresh"), 15),
    ]
    .into_iter()
    .collect();
    assert_eq!(request.end_version, 15);
    assert_eq!(request.start_versions, expected);
    assert_eq!((request.min_reply_size, request.max_reply_size), (100, 900));
    assert_eq!(request.max_blips, 7);
}

#[tokio::test(start_paused = true)]
async fn segment_without_a_start_version_fetches_a_fresh_snapshot() {
    let fetcher = FakeFetcher::open();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let w = wavelet(1);

    store.open.lock().insert(w.clone(), 500);
    assert_ok!(scheduler.new_request(&w));
    assert_ok!(scheduler.add_segment(&w, SegmentId::Index, 0));
    assert_ok!(scheduler.schedule_request());
    settle().await;

    let request = &fetcher.requests()[0];
    assert_eq!(request.end_version, 500);
    assert_eq!(request.start_versions.get(&SegmentId::Index), Some(&500));
}

#[tokio::test(start_paused = true)]
async fn stale_desired_version_is_ignored() {
    let fetcher = FakeFetcher::open();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let w = wavelet(1);

    store.open.lock().insert(w.clone(), 10);
    store.desired.lock().insert(w.clone(), 6);
    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    scheduler.schedule_request().unwrap();
    settle().await;

    assert_eq!(fetcher.requests()[0].end_version, 10);
}

#[tokio::test(start_paused = true)]
async fn reset_discards_late_replies() {
    let fetcher = FakeFetcher::gated();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let mut updates = scheduler.subscribe();
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    scheduler.schedule_request().unwrap();
    settle().await;
    assert_eq!(scheduler.in_flight(), 1);

    scheduler.reset();
    assert_eq!(scheduler.in_flight(), 0);
    assert!(!scheduler.is_awaiting(&w, &SegmentId::Index));

    fetcher.release(1);
    settle().await;
    assert!(store.applied().is_empty());
    assert!(updates.try_recv().is_err());

    // Still usable after a reset.
    assert!(scheduler.add_segment(&w, SegmentId::Index, 0).unwrap());
}

#[tokio::test(start_paused = true)]
async fn new_request_clears_the_open_batch() {
    let fetcher = FakeFetcher::open();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    scheduler.new_request(&w).unwrap();
    assert_eq!(scheduler.queued(), 0);

    scheduler.schedule_request().unwrap();
    settle().await;
    assert!(fetcher.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_once_the_cap_is_reached() {
    let fetcher = FakeFetcher::gated();
    let store = Arc::new(FakeStore::default());
    let config = FragmentConfigBuilder::new().max_queued_segments(3).build();
    let scheduler = scheduler(config, &fetcher, &store);
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    for n in 0..3 {
        assert!(!scheduler.is_full().unwrap());
        scheduler.add_segment(&w, SegmentId::blip(format!("b{}", n)), 0).unwrap();
    }
    assert!(scheduler.is_full().unwrap());
}

#[tokio::test(start_paused = true)]
async fn closed_scheduler_fails_fast() {
    let fetcher = FakeFetcher::gated();
    let store = Arc::new(FakeStore::default());
    let scheduler = scheduler(FragmentConfig::default(), &fetcher, &store);
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    scheduler.schedule_request().unwrap();
    scheduler.close();
    settle().await;

    assert!(scheduler.is_closed());
    assert!(fetcher.requests().is_empty());
    assert_eq!(scheduler.new_request(&w), Err(FragmentError::Closed));
    assert_eq!(
        scheduler.add_segment(&w, SegmentId::Index, 0),
        Err(FragmentError::Closed)
    );
    assert_eq!(scheduler.is_full(), Err(FragmentError::Closed));
    assert_eq!(scheduler.schedule_request(), Err(FragmentError::Closed));
}

#[tokio::test(start_paused = true)]
async fn delay_defers_the_pass() {
    let fetcher = FakeFetcher::open();
    let store = Arc::new(FakeStore::default());
    let config = FragmentConfigBuilder::new().schedule_delay(50).build();
    let scheduler = scheduler(config, &fetcher, &store);
    let w = wavelet(1);

    scheduler.new_request(&w).unwrap();
    scheduler.add_segment(&w, SegmentId::Index, 0).unwrap();
    scheduler.schedule_request().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fetcher.requests().is_empty());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(fetcher.requests().len(), 1);
}
