//! Two gateway sessions logged into a tiny routing server on loopback,
//! moving a file between them over a real SOCKS5 bytestream.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use futures_util::StreamExt;
use jabber_gateway::xmltree::{
    Element, HandlerEntry, HandlerStatus, NamePattern, NodeRef, ParentPattern, StreamParser,
};
use jabber_gateway::{
    start_session, EventStream, GatewayEvent, SessionConfig, SessionHandle, TlsPolicy,
    TransferEvent,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

const DOMAIN: &str = "localhost";

const SERVER_OPEN: &str = "<?xml version='1.0'?>\
    <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
    id='s1' from='localhost' version='1.0'>";

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

async fn read_until<R: AsyncRead + Unpin>(stream: &mut R, marker: &str) -> String {
    let mut seen = String::new();
    let mut buf = [0u8; 4096];
    while !seen.contains(marker) {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client hung up while waiting for {}", marker);
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    seen
}

fn attr_value<'a>(xml: &'a str, name: &str) -> &'a str {
    let start = xml.find(&format!("{}=\"", name)).unwrap() + name.len() + 2;
    let end = xml[start..].find('"').unwrap();
    &xml[start..start + end]
}

fn element_text<'a>(xml: &'a str, name: &str) -> &'a str {
    let close = xml.find(&format!("</{}>", name)).unwrap();
    let open = xml[..close].rfind('>').unwrap();
    &xml[open + 1..close]
}

/// Login script: PLAIN auth, stream restart, bind. Returns the bound JID.
async fn login(stream: &mut OwnedReadHalf, out: &mpsc::UnboundedSender<String>) -> String {
    read_until(stream, "version=\"1.0\">").await;
    out.send(format!(
        "{}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
         <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        SERVER_OPEN
    ))
    .unwrap();

    let auth = read_until(stream, "</auth>").await;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(element_text(&auth, "auth"))
        .unwrap();
    let user = String::from_utf8(decoded)
        .unwrap()
        .split('\0')
        .nth(1)
        .unwrap()
        .to_string();
    out.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>".to_string())
        .unwrap();

    read_until(stream, "version=\"1.0\">").await;
    out.send(format!(
        "{}<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
        SERVER_OPEN
    ))
    .unwrap();

    let bind = read_until(stream, "</iq>").await;
    let jid = format!("{}@{}/{}", user, DOMAIN, element_text(&bind, "resource"));
    out.send(format!(
        "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
         <jid>{}</jid></bind></iq>",
        attr_value(&bind, "id"),
        jid
    ))
    .unwrap();
    jid
}

fn collect(node: NodeRef<'_>, out: &mut Vec<Element>) -> HandlerStatus {
    out.push(node.to_element());
    HandlerStatus::Handled
}

/// One client connection: log it in, then relay its stanzas to the
/// addressed peer with `from` stamped.
async fn serve_client(stream: TcpStream, routes: Routes) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if writer.write_all(data.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let jid = login(&mut reader, &out_tx).await;
    routes.lock().unwrap().insert(jid.clone(), out_tx);

    let mut parser = StreamParser::new(vec![HandlerEntry::new(
        NamePattern::Any,
        ParentPattern::Exact("stream:stream"),
        collect,
    )]);
    parser.feed(b"<stream:stream>").unwrap();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if parser.feed(&buf[..n]).is_err() {
            break;
        }
        let mut stanzas = Vec::new();
        parser.dispatch(&mut stanzas);
        parser.cleanup();
        for mut stanza in stanzas {
            let Some(to) = stanza.attr("to").map(str::to_string) else {
                continue;
            };
            stanza.set_attr("from", jid.clone());
            let routes = routes.lock().unwrap();
            let target = routes
                .iter()
                .find(|(full, _)| **full == to || full.starts_with(&format!("{}/", to)));
            if let Some((_, peer)) = target {
                let _ = peer.send(stanza.to_xml());
            }
        }
    }
    routes.lock().unwrap().remove(&jid);
}

async fn start_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_client(stream, routes.clone()));
        }
    });
    port
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn client_config(user: &str, server_port: u16, proxies: &str) -> SessionConfig {
    let mut config = SessionConfig::new(&format!("{}@{}", user, DOMAIN), "secret");
    config.server = Some(format!("tcp://127.0.0.1:{}", server_port));
    config.tls = TlsPolicy::Disabled;
    config.transfer_proxies = proxies.to_string();
    config.transfer_host = Some("127.0.0.1".to_string());
    config.transfer_connect_timeout_secs = 5;
    config.transfer_listen_timeout_secs = 10;
    config
}

async fn next_event(events: &mut EventStream) -> GatewayEvent {
    timeout(Duration::from_secs(10), events.next())
        .await
        .expect("timed out waiting for an event")
        .expect("session task ended")
}

async fn wait_ready(events: &mut EventStream) -> String {
    loop {
        match next_event(events).await {
            GatewayEvent::Ready { jid } => return jid.to_string(),
            GatewayEvent::FatalError { message, .. } => panic!("login failed: {}", message),
            _ => {}
        }
    }
}

/// Follow one transfer to its end; returns the bytes reported at the finish
/// and the number of terminal events seen.
async fn run_to_end(
    handle: &SessionHandle,
    events: &mut EventStream,
    sink: Option<tokio::io::DuplexStream>,
) -> (u64, usize) {
    let mut sink = sink;
    let mut finished = None;
    let mut terminal = 0;
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        assert!(Instant::now() < deadline, "transfer did not finish");
        let event = match timeout(Duration::from_millis(500), events.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            // Quiet for a while after the end: no stray second terminal event.
            Err(_) if finished.is_some() => break,
            Err(_) => continue,
        };
        match event {
            GatewayEvent::Transfer(TransferEvent::Offered { id, size, .. }) => {
                assert_eq!(size, 1000);
                let sink = sink.take().expect("only one offer expected");
                handle.accept_file(id, Box::new(sink)).await.unwrap();
            }
            GatewayEvent::Transfer(TransferEvent::Finished { transferred, .. }) => {
                terminal += 1;
                finished = Some(transferred);
            }
            GatewayEvent::Transfer(TransferEvent::Canceled { reason, .. }) => {
                panic!("transfer canceled: {}", reason)
            }
            GatewayEvent::FatalError { message, .. } => panic!("session failed: {}", message),
            _ => {}
        }
    }
    (finished.unwrap_or_default(), terminal)
}

#[tokio::test]
async fn test_file_reaches_peer_through_second_streamhost() {
    let server_port = start_server().await;
    let dead_proxy = closed_port().await;

    let (alice, mut alice_events) = start_session(client_config(
        "alice",
        server_port,
        &format!("proxy.example.org,127.0.0.1,{};<local>", dead_proxy),
    ))
    .unwrap();
    let (bob, mut bob_events) = start_session(client_config("bob", server_port, "<local>")).unwrap();
    wait_ready(&mut alice_events).await;
    let bob_jid = wait_ready(&mut bob_events).await;

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let (sink, mut received) = tokio::io::duplex(64 * 1024);
    let reader = tokio::spawn(async move {
        let mut data = Vec::new();
        received.read_to_end(&mut data).await.unwrap();
        data
    });

    let receiving = tokio::spawn(async move {
        let outcome = run_to_end(&bob, &mut bob_events, Some(sink)).await;
        bob.close();
        outcome
    });

    alice
        .offer_file(
            &bob_jid,
            "a.bin",
            payload.len() as u64,
            Box::new(Cursor::new(payload.clone())),
        )
        .await
        .unwrap();
    let (sent, sender_terminal) = run_to_end(&alice, &mut alice_events, None).await;
    alice.close();

    let (got, receiver_terminal) = receiving.await.unwrap();
    assert_eq!(sent, 1000);
    assert_eq!(got, 1000);
    assert_eq!(sender_terminal, 1);
    assert_eq!(receiver_terminal, 1);
    assert_eq!(reader.await.unwrap(), payload);
}

#[tokio::test]
async fn test_refused_offer_cancels_sender() {
    let server_port = start_server().await;
    let (alice, mut alice_events) =
        start_session(client_config("alice", server_port, "<local>")).unwrap();
    let (bob, mut bob_events) = start_session(client_config("bob", server_port, "<local>")).unwrap();
    wait_ready(&mut alice_events).await;
    let bob_jid = wait_ready(&mut bob_events).await;

    let id = alice
        .offer_file(&bob_jid, "notes.bin", 10, Box::new(Cursor::new(vec![0u8; 10])))
        .await
        .unwrap();

    loop {
        if let GatewayEvent::Transfer(TransferEvent::Offered { id, .. }) =
            next_event(&mut bob_events).await
        {
            bob.cancel_file(id, "no thanks").await.unwrap();
            break;
        }
    }
    loop {
        match next_event(&mut alice_events).await {
            GatewayEvent::Transfer(TransferEvent::Canceled { id: canceled, .. }) => {
                assert_eq!(canceled, id);
                break;
            }
            GatewayEvent::Transfer(TransferEvent::Finished { .. }) => {
                panic!("refused transfer must not finish")
            }
            _ => {}
        }
    }
    alice.close();
    bob.close();
}
