// Integration test: two relay nodes over real loopback WebSockets
//
// Starts N1 and N2 on ephemeral ports, links them, connects one client to
// each, and checks that rosters, private chats and public chats cross the
// node → node link. Also covers:
// - a node listening on the wildcard address with nothing advertised
// - two nodes dialing each other at the same time

use std::time::Duration;

use chatrelay_core::protocol::Payload;
use chatrelay_core::{
    ChatClient, ClientKeys, ClientSession, RelayNode, RelayNodeConfig, WireMessage,
};
use tokio::time::{sleep, timeout};

const STEP: Duration = Duration::from_secs(5);

async fn start_node(node_id: &str, neighbours: Vec<String>) -> RelayNode {
    let node = RelayNode::bind(RelayNodeConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        node_id: Some(node_id.to_string()),
        neighbours,
        ..Default::default()
    })
    .await
    .expect("bind relay node");
    node.start().await.expect("start relay node");
    node
}

async fn connect(node: &RelayNode, name: &str) -> (ChatClient, ClientSession) {
    let mut chat = ChatClient::new(ClientKeys::generate(), Some(name.to_string()));
    let mut session = ClientSession::connect(node.address())
        .await
        .expect("client connect");
    session.send(&chat.hello().unwrap()).await.unwrap();
    (chat, session)
}

/// Read frames, feeding control frames to the client, until `pick` matches one.
async fn next_matching<F>(chat: &mut ChatClient, session: &mut ClientSession, mut pick: F) -> WireMessage
where
    F: FnMut(&WireMessage) -> bool,
{
    timeout(STEP, async {
        loop {
            let message = session
                .recv()
                .await
                .expect("recv")
                .expect("link closed early");
            chat.observe(&message);
            if pick(&message) {
                return message;
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_two_node_mesh_end_to_end() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();

    let n2 = start_node("n2", Vec::new()).await;
    let n1 = start_node("n1", vec![n2.address().to_string()]).await;

    wait_until(|| n1.stats().peers == 1 && n2.stats().peers == 1).await;

    let (mut alice, mut alice_session) = connect(&n1, "alice").await;
    let (mut bob, mut bob_session) = connect(&n2, "bob").await;

    // Bob's roster reaches N1 through the peer link
    let bob_id = bob.client_id();
    wait_until(|| n1.router().directory().read().locate(&bob_id).is_some()).await;

    alice_session
        .send(&alice.client_list_request())
        .await
        .unwrap();
    next_matching(&mut alice, &mut alice_session, |m| {
        matches!(m, WireMessage::ClientList { .. })
    })
    .await;
    assert_eq!(alice.recipients().home_address(), Some(n1.address()));
    assert_eq!(
        alice.recipients().get(&bob_id).unwrap().address,
        n2.address()
    );

    // Private chat: N1 → N2 → bob
    let sent = alice
        .private_chat(&bob_id, "over the wire", Duration::from_secs(30))
        .unwrap();
    alice_session.send(&sent).await.unwrap();

    let received = next_matching(&mut bob, &mut bob_session, |m| {
        matches!(m, WireMessage::SignedData(_))
    })
    .await;
    assert_eq!(received, sent);
    let chat = match received {
        WireMessage::SignedData(envelope) => match envelope.payload().unwrap() {
            Payload::PrivateChat(chat) => chat,
            other => panic!("Wrong payload: {}", other.kind()),
        },
        other => panic!("Wrong message type: {}", other.message_type()),
    };
    assert_eq!(bob.open_private_chat(&chat).unwrap().message, "over the wire");

    // Public chat reaches the other node's client
    let shout = bob.public_chat("hello n1").unwrap();
    bob_session.send(&shout).await.unwrap();
    let heard = next_matching(&mut alice, &mut alice_session, |m| {
        matches!(m, WireMessage::SignedData(_))
    })
    .await;
    assert_eq!(heard, shout);

    // Bob leaves; N1 drops him from its view of N2
    bob_session.send(&bob.disconnect()).await.unwrap();
    bob_session.close().await.unwrap();
    wait_until(|| n1.router().directory().read().locate(&bob_id).is_none()).await;
    assert_eq!(n2.stats().clients_online, 0);

    n1.shutdown();
    n2.shutdown();
}

#[tokio::test]
async fn test_heartbeat_timeout_closes_idle_client() {
    let node = RelayNode::bind(RelayNodeConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        heartbeat_timeout: Some(Duration::from_millis(200)),
        sweep_interval: Duration::from_millis(50),
        ..Default::default()
    })
    .await
    .unwrap();
    node.start().await.unwrap();

    let (_chat, mut session) = connect(&node, "idle").await;
    wait_until(|| node.stats().clients_online == 1).await;

    // The node closes the link once the client goes quiet
    let closed = timeout(STEP, async {
        loop {
            match session.recv().await {
                Ok(Some(_)) => continue,
                _ => return,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    wait_until(|| node.stats().clients_online == 0).await;
    assert_eq!(node.stats().clients_known, 1);
}

#[tokio::test]
async fn test_wildcard_bound_node_receives_private_chat() {
    let n2 = RelayNode::bind(RelayNodeConfig {
        listen_addr: "0.0.0.0:0".to_string(),
        node_id: Some("n2".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    n2.start().await.unwrap();
    let dialed = format!("127.0.0.1:{}", n2.local_addr().port());
    assert_eq!(n2.address(), dialed);

    let n1 = start_node("n1", vec![dialed.clone()]).await;
    wait_until(|| {
        n1.router()
            .directory()
            .read()
            .peer(&dialed)
            .and_then(|p| p.node_id.clone())
            .is_some()
    })
    .await;

    let (mut alice, mut alice_session) = connect(&n1, "alice").await;
    let (mut bob, mut bob_session) = connect(&n2, "bob").await;
    let bob_id = bob.client_id();
    wait_until(|| n1.router().directory().read().locate(&bob_id).is_some()).await;

    alice_session
        .send(&alice.client_list_request())
        .await
        .unwrap();
    next_matching(&mut alice, &mut alice_session, |m| {
        matches!(m, WireMessage::ClientList { .. })
    })
    .await;
    let resolved = alice.recipients().get(&bob_id).unwrap().clone();
    assert_eq!(resolved.address, dialed);
    assert_eq!(resolved.server_id, "n2");

    let sent = alice
        .private_chat(&bob_id, "through the wildcard", Duration::from_secs(30))
        .unwrap();
    alice_session.send(&sent).await.unwrap();
    let received = next_matching(&mut bob, &mut bob_session, |m| {
        matches!(m, WireMessage::SignedData(_))
    })
    .await;
    assert_eq!(received, sent);

    n1.shutdown();
    n2.shutdown();
}

#[tokio::test]
async fn test_concurrent_mutual_dial_keeps_federation() {
    for round in 0..5 {
        let a = start_node("na", Vec::new()).await;
        let b = start_node("nb", Vec::new()).await;

        let (to_b, to_a) = tokio::join!(a.connect_peer(b.address()), b.connect_peer(a.address()));
        to_b.unwrap();
        to_a.unwrap();
        wait_until(|| a.stats().peers == 1 && b.stats().peers == 1).await;

        // Rosters cross in both directions whichever link carries them
        let (bob, _bob_session) = connect(&b, "bob").await;
        let bob_id = bob.client_id();
        wait_until(|| a.router().directory().read().locate(&bob_id).is_some()).await;

        let (alice, _alice_session) = connect(&a, "alice").await;
        let alice_id = alice.client_id();
        wait_until(|| b.router().directory().read().locate(&alice_id).is_some()).await;

        assert_eq!(
            a.router().directory().read().peer(b.address()).unwrap().node_id.as_deref(),
            Some("nb"),
            "round {}",
            round
        );

        a.shutdown();
        b.shutdown();
    }
}
