//! Typed RPC shim over the transport channel.

use crate::channel::TransportChannel;
use crate::error::{Result, ServiceError};
use crate::protocol::{
    CloseWaveletChannelRequest, FetchFragmentsRequest, FetchFragmentsResponse,
    FetchWaveViewRequest, Message, OpenWaveletChannelRequest, OpenWaveletChannelStream,
    SubmitDeltaRequest, SubmitDeltaResponse, WaveletView,
};
use tokio::sync::mpsc;
use tracing::debug;
use wave_core::{HashedVersion, ReturnStatus, TransformedWaveletDelta, WaveId, WaveletDelta, WaveletId};

fn check(status: ReturnStatus) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(ServiceError::Status(status))
    }
}

fn unexpected(message: &Message) -> ServiceError {
    ServiceError::UnexpectedResponse(message.type_name().to_string())
}

/// An incremental update on an open wavelet channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaveletUpdate {
    pub delta: Option<TransformedWaveletDelta>,
    pub commit_version: Option<HashedVersion>,
}

/// A live subscription to one wavelet's transformed deltas.
#[derive(Debug)]
pub struct WaveletSubscription {
    pub channel_id: String,
    pub wavelet_id: WaveletId,
    /// Wavelet head at the time the channel opened.
    pub version: Option<HashedVersion>,
    updates: mpsc::UnboundedReceiver<Message>,
}

impl WaveletSubscription {
    /// Next update. `None` once the server closes the channel normally, the
    /// link drops or the session goes away.
    pub async fn next_update(&mut self) -> Option<Result<WaveletUpdate>> {
        loop {
            let message = self.updates.recv().await?;
            let stream = match message {
                Message::OpenWaveletChannelStream(stream) => stream,
                other => return Some(Err(unexpected(&other))),
            };
            if let Some(status) = stream.terminator {
                return match check(status) {
                    Ok(()) => None,
                    Err(err) => Some(Err(err)),
                };
            }
            if stream.delta.is_none() && stream.commit_version.is_none() {
                continue;
            }
            return Some(Ok(WaveletUpdate {
                delta: stream.delta,
                commit_version: stream.commit_version,
            }));
        }
    }
}

/// View and submission service.
#[derive(Clone)]
pub struct ViewService {
    channel: TransportChannel,
}

impl ViewService {
    pub fn new(channel: TransportChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.channel
    }

    /// Fetch every wavelet of a wave with a fragment for each segment.
    pub async fn fetch_wave_view(&self, wave_id: WaveId) -> Result<Vec<WaveletView>> {
        let reply = self
            .channel
            .request(Message::FetchWaveViewRequest(FetchWaveViewRequest { wave_id }))
            .await?;
        match reply {
            Message::FetchWaveViewResponse(response) => {
                check(response.status)?;
                Ok(response.wavelets)
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn fetch_fragments(
        &self,
        request: FetchFragmentsRequest,
    ) -> Result<FetchFragmentsResponse> {
        debug!(
            wavelet = %request.wavelet_id,
            segments = request.start_versions.len(),
            end_version = request.end_version,
            "fetching fragments"
        );
        let reply = self
            .channel
            .request(Message::FetchFragmentsRequest(request))
            .await?;
        match reply {
            Message::FetchFragmentsResponse(response) => {
                check(response.status.clone())?;
                Ok(response)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Open a channel and wait for the server to confirm it.
    pub async fn open_wavelet_channel(
        &self,
        wavelet_id: WaveletId,
        known_version: Option<HashedVersion>,
    ) -> Result<WaveletSubscription> {
        let mut updates = self.channel.open_stream(Message::OpenWaveletChannelRequest(
            OpenWaveletChannelRequest {
                wavelet_id: wavelet_id.clone(),
                known_version,
            },
        ))?;

        match updates.recv().await {
            Some(Message::OpenWaveletChannelStream(OpenWaveletChannelStream {
                channel_id: Some(channel_id),
                commit_version,
                ..
            })) => Ok(WaveletSubscription {
                channel_id,
                wavelet_id,
                version: commit_version,
                updates,
            }),
            Some(Message::OpenWaveletChannelStream(OpenWaveletChannelStream {
                terminator: Some(status),
                ..
            })) => Err(check(status).err().unwrap_or(ServiceError::StreamEnded)),
            Some(other) => Err(unexpected(&other)),
            None => Err(ServiceError::StreamEnded),
        }
    }

    pub async fn submit_delta(
        &self,
        channel_id: &str,
        wavelet_id: WaveletId,
        delta: WaveletDelta,
    ) -> Result<SubmitDeltaResponse> {
        let reply = self
            .channel
            .request(Message::SubmitDeltaRequest(SubmitDeltaRequest {
                channel_id: channel_id.to_string(),
                wavelet_id,
                delta,
            }))
            .await?;
        match reply {
            Message::SubmitDeltaResponse(response) => {
                check(response.status.clone())?;
                Ok(response)
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close_wavelet_channel(&self, channel_id: &str) -> Result<()> {
        let reply = self
            .channel
            .request(Message::CloseWaveletChannelRequest(CloseWaveletChannelRequest {
                channel_id: channel_id.to_string(),
            }))
            .await?;
        match reply {
            Message::EmptyResponse(response) => check(response.status),
            other => Err(unexpected(&other)),
        }
    }
}
