//! Transport channel behaviour against a scripted in-memory server.

use futures::StreamExt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::{assert_pending, assert_ready_eq, task};
use wave_channel::{
    ChannelConfigBuilder, ChannelError, CloseWaveletChannelRequest, Connection, ConnectionEvent,
    ConnectionState, EmptyResponse, Envelope, FrameSink, MemoryConnector, Message, OpenWaveletChannelRequest,
    OpenWaveletChannelStream, RpcFinished, TransportChannel,
};
use wave_core::{HashedVersion, ReturnStatus, StatusCode, WaveletId};

fn close(id: &str) -> Message {
    Message::CloseWaveletChannelRequest(CloseWaveletChannelRequest {
        channel_id: id.to_string(),
    })
}

fn empty(status: ReturnStatus) -> Message {
    Message::EmptyResponse(EmptyResponse { status })
}

async fn read(connection: &mut Connection) -> Envelope {
    let frame = connection.stream.next().await.unwrap().unwrap();
    Envelope::decode(&frame).unwrap()
}

async fn reply(connection: &mut Connection, sequence: i32, message: Message) {
    let frame = Envelope::new(sequence, message).encode().unwrap();
    connection.sink.send(frame).await.unwrap();
}

async fn expect_event(events: &mut broadcast::Receiver<ConnectionEvent>, wanted: ConnectionEvent) {
    loop {
        match events.recv().await {
            Ok(event) if event == wanted => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(err) => panic!("event stream ended: {:?}", err),
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn channel_id(envelope: &Envelope) -> String {
    match &envelope.message {
        Message::CloseWaveletChannelRequest(request) => request.channel_id.clone(),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn responses_reach_the_matching_request() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let channel = TransportChannel::spawn(Default::default(), connector, None);
    channel.connect().unwrap();
    let mut server = acceptor.next().await.unwrap();

    let first = tokio::spawn(channel.request(close("a")));
    let second = tokio::spawn(channel.request(close("b")));

    let a = read(&mut server).await;
    let b = read(&mut server).await;
    assert_eq!(channel_id(&a), "a");
    assert_eq!(channel_id(&b), "b");
    assert!(b.sequence_number > a.sequence_number);

    // Answer out of order.
    reply(&mut server, b.sequence_number, empty(ReturnStatus::ok())).await;
    reply(
        &mut server,
        a.sequence_number,
        empty(ReturnStatus::error(StatusCode::NotExists, "a")),
    )
    .await;

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first, empty(ReturnStatus::error(StatusCode::NotExists, "a")));
    assert_eq!(second, empty(ReturnStatus::ok()));
    assert_eq!(channel.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn queued_messages_flush_in_order_on_reconnect() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let channel = TransportChannel::spawn(Default::default(), connector.clone(), None);
    let mut events = channel.subscribe();

    channel.connect().unwrap();
    let _first = acceptor.next().await.unwrap();
    expect_event(&mut events, ConnectionEvent::Connected).await;

    connector.set_online(false);
    connector.sever();
    expect_event(&mut events, ConnectionEvent::Disconnected).await;

    for i in 0..4 {
        channel.post(close(&format!("queued-{}", i))).unwrap();
    }
    connector.set_online(true);

    let mut second = acceptor.next().await.unwrap();
    expect_event(&mut events, ConnectionEvent::Connected).await;
    channel.post(close("fresh")).unwrap();

    let mut ids = Vec::new();
    let mut sequences = Vec::new();
    for _ in 0..5 {
        let envelope = read(&mut second).await;
        sequences.push(envelope.sequence_number);
        ids.push(channel_id(&envelope));
    }
    assert_eq!(
        ids,
        vec!["queued-0", "queued-1", "queued-2", "queued-3", "fresh"]
    );
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn switches_to_fallback_after_repeated_failures() {
    let (primary, _primary_acceptor) = MemoryConnector::new("primary");
    let (fallback, mut fallback_acceptor) = MemoryConnector::new("fallback");
    primary.set_online(false);

    let config = ChannelConfigBuilder::new()
        .reconnect_interval(100)
        .fallback_after_failures(2)
        .build();
    let channel = TransportChannel::spawn(config, primary.clone(), Some(fallback.clone()));
    channel.connect().unwrap();

    let _server = fallback_acceptor.next().await.unwrap();
    assert_eq!(primary.attempts(), 2);
    assert_eq!(fallback.attempts(), 1);

    // The fallback stays in use even once the primary recovers.
    primary.set_online(true);
    fallback.sever();
    let _again = fallback_acceptor.next().await.unwrap();
    assert_eq!(primary.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn stream_delivers_until_terminator() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let channel = TransportChannel::spawn(Default::default(), connector, None);
    channel.connect().unwrap();
    let mut server = acceptor.next().await.unwrap();

    let mut updates = channel
        .open_stream(Message::OpenWaveletChannelRequest(OpenWaveletChannelRequest {
            wavelet_id: WaveletId::new("example.com!w+1", "conv+root"),
            known_version: None,
        }))
        .unwrap();
    let request = read(&mut server).await;

    let version = HashedVersion::new(0, vec![7]);
    let seq = request.sequence_number;
    reply(
        &mut server,
        seq,
        Message::OpenWaveletChannelStream(OpenWaveletChannelStream::opened("ch-1", version.clone())),
    )
    .await;
    reply(
        &mut server,
        seq,
        Message::OpenWaveletChannelStream(OpenWaveletChannelStream {
            commit_version: Some(version),
            ..Default::default()
        }),
    )
    .await;
    reply(
        &mut server,
        seq,
        Message::OpenWaveletChannelStream(OpenWaveletChannelStream::terminated(ReturnStatus::ok())),
    )
    .await;

    let mut received = Vec::new();
    while let Some(message) = updates.recv().await {
        received.push(message);
    }
    assert_eq!(received.len(), 3);
    assert!(received[2].is_terminal());
}

#[tokio::test(start_paused = true)]
async fn single_shot_reply_ends_a_stream() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let channel = TransportChannel::spawn(Default::default(), connector, None);
    channel.connect().unwrap();
    let mut server = acceptor.next().await.unwrap();

    let mut updates = channel
        .open_stream(Message::OpenWaveletChannelRequest(OpenWaveletChannelRequest {
            wavelet_id: WaveletId::new("example.com!w+1", "conv+root"),
            known_version: None,
        }))
        .unwrap();
    let request = read(&mut server).await;

    let refused = empty(ReturnStatus::error(StatusCode::BadRequest, "no"));
    reply(&mut server, request.sequence_number, refused.clone()).await;
    reply(&mut server, request.sequence_number, empty(ReturnStatus::ok())).await;

    assert_eq!(updates.recv().await, Some(refused));
    assert_eq!(updates.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unmatched_frames_are_dropped() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let channel = TransportChannel::spawn(Default::default(), connector, None);
    channel.connect().unwrap();
    let mut server = acceptor.next().await.unwrap();

    let pending = tokio::spawn(channel.request(close("x")));
    let request = read(&mut server).await;

    server.sink.send("{ not json".to_string()).await.unwrap();
    reply(&mut server, 9_999, empty(ReturnStatus::ok())).await;
    reply(&mut server, request.sequence_number, empty(ReturnStatus::ok())).await;

    assert_eq!(pending.await.unwrap().unwrap(), empty(ReturnStatus::ok()));
    assert_eq!(channel.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_sent_requests_but_keeps_queued_ones() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let config = ChannelConfigBuilder::new().reconnect_interval(10).build();
    let channel = TransportChannel::spawn(config, connector.clone(), None);
    let mut events = channel.subscribe();
    channel.connect().unwrap();
    let mut first = acceptor.next().await.unwrap();

    let sent = tokio::spawn(channel.request(close("sent")));
    let mut stream = channel
        .open_stream(Message::OpenWaveletChannelRequest(OpenWaveletChannelRequest {
            wavelet_id: WaveletId::new("example.com!w+1", "conv+root"),
            known_version: None,
        }))
        .unwrap();
    assert_eq!(channel_id(&read(&mut first).await), "sent");
    let _ = read(&mut first).await;

    connector.set_online(false);
    connector.sever();
    expect_event(&mut events, ConnectionEvent::Disconnected).await;
    assert_eq!(sent.await.unwrap(), Err(ChannelError::Disconnected));
    assert!(stream.recv().await.is_none());

    let mut queued = task::spawn(channel.request(close("queued")));
    settle().await;
    assert_pending!(queued.poll());
    connector.set_online(true);

    let mut second = acceptor.next().await.unwrap();
    let request = read(&mut second).await;
    assert_eq!(channel_id(&request), "queued");
    reply(&mut second, request.sequence_number, empty(ReturnStatus::ok())).await;
    settle().await;
    assert!(queued.is_woken());
    assert_ready_eq!(queued.poll(), Ok(empty(ReturnStatus::ok())));
}

#[tokio::test(start_paused = true)]
async fn session_token_is_sent_first_on_every_connect() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let config = ChannelConfigBuilder::new().session_token("s3cret").build();
    let channel = TransportChannel::spawn(config, connector.clone(), None);
    channel.post(close("early")).unwrap();
    channel.connect().unwrap();

    let mut server = acceptor.next().await.unwrap();
    let auth = read(&mut server).await;
    match &auth.message {
        Message::TransportAuthenticationRequest(request) => assert_eq!(request.token, "s3cret"),
        other => panic!("expected authentication, got {:?}", other),
    }
    assert_eq!(channel_id(&read(&mut server).await), "early");

    // The acknowledgement is consumed silently.
    reply(&mut server, auth.sequence_number, empty(ReturnStatus::ok())).await;

    connector.sever();
    let mut again = acceptor.next().await.unwrap();
    assert!(matches!(
        read(&mut again).await.message,
        Message::TransportAuthenticationRequest(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn rpc_finished_ends_the_session() {
    let (connector, mut acceptor) = MemoryConnector::new("primary");
    let channel = TransportChannel::spawn(Default::default(), connector, None);
    let mut events = channel.subscribe();
    channel.connect().unwrap();
    let mut server = acceptor.next().await.unwrap();

    let pending = tokio::spawn(channel.request(close("doomed")));
    let _ = read(&mut server).await;

    reply(
        &mut server,
        0,
        Message::RpcFinished(RpcFinished {
            failed: true,
            error_text: Some("kicked".to_string()),
        }),
    )
    .await;

    expect_event(&mut events, ConnectionEvent::Finished("kicked".to_string())).await;
    assert_eq!(
        pending.await.unwrap(),
        Err(ChannelError::Finished("kicked".to_string()))
    );
    assert_eq!(channel.request(close("late")).await, Err(ChannelError::Closed));
    assert!(channel.is_closed());
}

#[test]
fn channel_handle_is_cloneable_across_threads() {
    fn assert_send_sync<T: Send + Sync + Clone>() {}
    assert_send_sync::<TransportChannel>();
}
