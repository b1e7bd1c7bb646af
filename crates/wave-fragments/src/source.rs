//! Seams between the scheduler and its collaborators.

use async_trait::async_trait;
use wave_channel::{FetchFragmentsRequest, FetchFragmentsResponse, ServiceError, ViewService};
use wave_core::{RawFragment, SegmentId, WaveletId};

/// Issues fragment fetches.
#[async_trait]
pub trait FragmentFetcher: Send + Sync + 'static {
    async fn fetch_fragments(
        &self,
        request: FetchFragmentsRequest,
    ) -> Result<FetchFragmentsResponse, ServiceError>;
}

#[async_trait]
impl FragmentFetcher for ViewService {
    async fn fetch_fragments(
        &self,
        request: FetchFragmentsRequest,
    ) -> Result<FetchFragmentsResponse, ServiceError> {
        ViewService::fetch_fragments(self, request).await
    }
}

/// The local document store fetched fragments are applied to.
///
/// The scheduler only reads versions from it and hands it fragments; it
/// never owns wavelet state.
pub trait SegmentStore: Send + Sync + 'static {
    /// Version of the wavelet currently open locally.
    fn open_version(&self, wavelet_id: &WaveletId) -> Option<u64>;

    /// A later version the caller wants to look at, if known.
    fn desired_version(&self, wavelet_id: &WaveletId) -> Option<u64>;

    /// Version up to which the segment is already held locally.
    fn segment_start_version(&self, wavelet_id: &WaveletId, segment: &SegmentId) -> Option<u64>;

    /// Fold a fetched fragment into local state.
    fn apply_fragment(&self, wavelet_id: &WaveletId, segment: &SegmentId, fragment: RawFragment);
}
