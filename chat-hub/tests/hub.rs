//! Fan-out scenarios driven through in-memory client streams.

use std::{io, time::Duration};

use anyhow::{Result, anyhow, bail};
use chat_hub::{
    ChatMessage, ConnectionId, Hub, HubConfig, SessionError,
    transport::memory::{self, MemoryPeer},
};
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);

struct TestClient {
    id: ConnectionId,
    peer: MemoryPeer,
    session: JoinHandle<Result<(), SessionError>>,
}

impl TestClient {
    async fn join(hub: &Hub, capacity: usize) -> Result<Self> {
        let before = hub.connection_ids().await;
        let (stream, peer) = memory::pair(capacity);
        let session = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.handle_session(stream).await })
        };

        let deadline = Instant::now() + WAIT;
        loop {
            let ids = hub.connection_ids().await;
            if let Some(id) = ids.into_iter().find(|id| !before.contains(id)) {
                return Ok(Self { id, peer, session });
            }
            if Instant::now() > deadline {
                bail!("timed out waiting for registration");
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn say(&self, sender: &str, body: &str) -> Result<()> {
        self.peer.send(ChatMessage::new(sender, body)).await?;
        Ok(())
    }

    async fn expect(&mut self, description: &str) -> Result<ChatMessage> {
        timeout(WAIT, self.peer.recv())
            .await
            .map_err(|_| anyhow!("{description}: timed out"))?
            .ok_or_else(|| anyhow!("{description}: hub side closed"))
    }

    async fn finish(self) -> Result<Result<(), SessionError>> {
        Ok(timeout(WAIT, self.session).await??)
    }
}

async fn wait_for_count(hub: &Hub, expected: usize) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while hub.connection_count().await != expected {
        if Instant::now() > deadline {
            bail!("timed out waiting for {expected} registered connections");
        }
        sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_everyone_including_sender() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 16).await?;
    let mut b = TestClient::join(&hub, 16).await?;
    let mut c = TestClient::join(&hub, 16).await?;

    a.say("A", "hello").await?;

    let expected = ChatMessage::new("A", "hello");
    assert_eq!(b.expect("b hears a").await?, expected);
    assert_eq!(c.expect("c hears a").await?, expected);
    assert_eq!(a.expect("a hears itself").await?, expected);

    hub.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disconnected_client_is_deregistered_and_skipped() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 16).await?;
    let mut b = TestClient::join(&hub, 16).await?;
    let mut c = TestClient::join(&hub, 16).await?;
    let b_id = b.id;

    b.peer.close_send();
    wait_for_count(&hub, 2).await?;
    assert!(!hub.connection_ids().await.contains(&b_id));

    a.say("A", "hi").await?;
    assert_eq!(c.expect("c hears a").await?.body, "hi");
    assert_eq!(a.expect("a hears itself").await?.body, "hi");

    // The hub dropped its end of b's stream without delivering anything.
    assert!(timeout(WAIT, b.peer.recv()).await?.is_none());
    assert!(b.finish().await?.is_ok(), "end-of-stream is not an error");
    Ok(())
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let a = TestClient::join(&hub, 256).await?;
    let c = TestClient::join(&hub, 256).await?;
    let mut b = TestClient::join(&hub, 256).await?;

    for i in 0..50 {
        a.say("A", &i.to_string()).await?;
        c.say("C", &i.to_string()).await?;
    }

    let mut next_from_a = 0;
    let mut next_from_c = 0;
    for _ in 0..100 {
        let message = b.expect("b hears both senders").await?;
        let seq: i32 = message.body.parse()?;
        match message.sender.as_str() {
            "A" => {
                assert_eq!(seq, next_from_a);
                next_from_a += 1;
            }
            "C" => {
                assert_eq!(seq, next_from_c);
                next_from_c += 1;
            }
            other => bail!("unexpected sender {other}"),
        }
    }
    assert_eq!((next_from_a, next_from_c), (50, 50));
    Ok(())
}

#[tokio::test]
async fn stalled_reader_does_not_delay_other_clients() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 512).await?;
    // Never read from b; its hub-side buffer holds a single message.
    let stalled = TestClient::join(&hub, 1).await?;
    let mut c = TestClient::join(&hub, 512).await?;

    for i in 0..200 {
        a.say("A", &format!("flood {i}")).await?;
    }

    for i in 0..200 {
        assert_eq!(c.expect("c keeps up").await?.body, format!("flood {i}"));
        assert_eq!(a.expect("a keeps up").await?.body, format!("flood {i}"));
    }

    // Slow is not dead: the stalled client is still registered.
    assert!(hub.connection_ids().await.contains(&stalled.id));
    assert_eq!(hub.connection_count().await, 3);
    Ok(())
}

#[tokio::test]
async fn read_error_is_returned_to_transport_and_deregisters() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 16).await?;
    let b = TestClient::join(&hub, 16).await?;

    b.peer.fail(io::ErrorKind::ConnectionReset).await?;
    match b.finish().await? {
        Err(SessionError::Receive(err)) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
        other => bail!("expected receive error, got {other:?}"),
    }
    wait_for_count(&hub, 1).await?;

    a.say("A", "still here").await?;
    assert_eq!(a.expect("a unaffected").await?.body, "still here");
    Ok(())
}

#[tokio::test]
async fn failed_write_closes_only_that_client() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 16).await?;
    let mut b = TestClient::join(&hub, 16).await?;
    let mut c = TestClient::join(&hub, 16).await?;

    b.peer.close_recv();
    a.say("A", "first").await?;

    assert_eq!(a.expect("a hears first").await?.body, "first");
    assert_eq!(c.expect("c hears first").await?.body, "first");
    wait_for_count(&hub, 2).await?;
    assert!(b.finish().await?.is_ok());

    a.say("A", "second").await?;
    assert_eq!(c.expect("c hears second").await?.body, "second");
    Ok(())
}

#[tokio::test]
async fn late_joiners_do_not_see_earlier_messages() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 16).await?;

    a.say("A", "early").await?;
    assert_eq!(a.expect("early fanned out").await?.body, "early");

    let mut d = TestClient::join(&hub, 16).await?;
    a.say("A", "late").await?;
    assert_eq!(d.expect("d hears late").await?.body, "late");
    assert!(d.peer.try_recv().is_none());
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_fan_out_but_leaves_sessions_open() -> Result<()> {
    let (hub, dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 16).await?;

    hub.shutdown().await;
    timeout(WAIT, dispatch).await??;

    assert_eq!(hub.connection_count().await, 1);
    a.say("A", "anyone?").await?;
    sleep(Duration::from_millis(50)).await;
    assert!(a.peer.try_recv().is_none());

    a.peer.close_send();
    assert!(a.finish().await?.is_ok());
    assert_eq!(hub.connection_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn last_words_before_disconnect_are_still_delivered() -> Result<()> {
    let (hub, _dispatch) = Hub::spawn(HubConfig::default());
    let mut a = TestClient::join(&hub, 16).await?;
    let mut c = TestClient::join(&hub, 16).await?;

    c.say("C", "goodbye").await?;
    c.peer.close_send();

    assert_eq!(a.expect("a hears the parting message").await?.body, "goodbye");
    assert!(c.finish().await?.is_ok());
    wait_for_count(&hub, 1).await?;
    Ok(())
}
