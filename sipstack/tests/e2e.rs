//! Loopback scenarios driving whole endpoints over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use sipstack::endpoint::Builder;
use sipstack::error::{Error, Result};
use sipstack::headers::{FromTo, Header, Headers, Via};
use sipstack::message::{Request, SipMethod, TransportKind, Uri};
use sipstack::transaction::{TimingConfig, TransactionLayer};
use sipstack::transport::IncomingRequest;
use sipstack::{Endpoint, SipService};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers every INVITE with the configured final status after a delay.
struct Answering {
    code: i32,
    delay: Duration,
    acks: mpsc::Sender<()>,
}

#[async_trait]
impl SipService for Answering {
    fn name(&self) -> &str {
        "answering"
    }

    async fn on_incoming_request(
        &self,
        endpoint: &Endpoint,
        request: &mut Option<IncomingRequest>,
    ) -> Result<()> {
        let request = request.take().expect("request available");

        if request.is_method(&SipMethod::Ack) {
            let _ = self.acks.send(()).await;
            return Ok(());
        }
        if !request.is_method(&SipMethod::Invite) {
            return Ok(());
        }

        sleep(self.delay).await;

        let mut response = endpoint.new_response(&request, self.code, "OK");
        request
            .transaction()
            .expect("invite carries a transaction")
            .respond(&mut response)
            .await?;

        Ok(())
    }
}

async fn recv_response(sock: &UdpSocket) -> String {
    let mut buf = vec![0u8; 65_535];
    let (len, _) = timeout(RECV_TIMEOUT, sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a response")
        .expect("socket read");

    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[tokio::test]
async fn udp_invite_gets_auto_trying_then_final() {
    let server_addr: SocketAddr = "127.0.0.1:5081".parse().unwrap();
    let (acks_tx, mut acks_rx) = mpsc::channel(1);

    let server = Builder::new()
        .with_name("uas")
        .with_udp(server_addr)
        .with_transaction_layer(TransactionLayer::default())
        .with_service(Answering {
            code: 200,
            delay: Duration::from_millis(300),
            acks: acks_tx,
        })
        .build()
        .await;
    tokio::spawn(server.clone().run());
    sleep(Duration::from_millis(50)).await;

    let client = UdpSocket::bind("127.0.0.1:5080").await.unwrap();
    let invite = "INVITE sip:bob@127.0.0.1:5081 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bK.abc\r\n\
        From: <sip:alice@h>;tag=a\r\n\
        To: <sip:bob@h>\r\n\
        Call-ID: 1@h\r\n\
        CSeq: 1 INVITE\r\n\
        Max-Forwards: 70\r\n\
        Content-Length: 0\r\n\r\n";
    client.send_to(invite.as_bytes(), server_addr).await.unwrap();

    // The stack answers 100 Trying on its own after 200 ms.
    let trying = recv_response(&client).await;
    assert!(trying.starts_with("SIP/2.0 100"), "got: {trying}");

    let ok = recv_response(&client).await;
    assert!(ok.starts_with("SIP/2.0 200"), "got: {ok}");
    // The UAS added a To tag.
    assert!(ok.contains("tag="), "got: {ok}");

    let ack = "ACK sip:bob@127.0.0.1:5081 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bK.ack1\r\n\
        From: <sip:alice@h>;tag=a\r\n\
        To: <sip:bob@h>;tag=z9hG4bK.abc\r\n\
        Call-ID: 1@h\r\n\
        CSeq: 1 ACK\r\n\
        Max-Forwards: 70\r\n\
        Content-Length: 0\r\n\r\n";
    client.send_to(ack.as_bytes(), server_addr).await.unwrap();

    // The ACK reached the transaction user.
    timeout(RECV_TIMEOUT, acks_rx.recv())
        .await
        .expect("timed out waiting for the ACK")
        .unwrap();

    let stats = server.stats(TransportKind::Udp);
    assert_eq!(stats.listeners, 1);
    assert_eq!(stats.in_requests, 2);
    assert!(stats.out_responses >= 2);
}

#[tokio::test]
async fn tcp_request_with_mangled_header_elicits_400() {
    let server_addr: SocketAddr = "127.0.0.1:5082".parse().unwrap();

    let server = Builder::new()
        .with_tcp(server_addr)
        .with_transaction_layer(TransactionLayer::default())
        .build()
        .await;
    tokio::spawn(server.clone().run());
    sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(server_addr).await.unwrap();
    let bad = "OPTIONS sip:bob@127.0.0.1:5082 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:9;branch=z9hG4bK.bad\r\n\
        From: <sip:alice@h>;tag=a\r\n\
        To: <sip:bob@h>\r\n\
        Call-ID: 2@h\r\n\
        CSeq: 1 OPTIONS\r\n\
        $$$---!!!\r\n\
        Content-Length: 0\r\n\r\n";
    client.write_all(bad.as_bytes()).await.unwrap();
    client.flush().await.unwrap();

    let mut buf = vec![0u8; 4096];
    let len = timeout(RECV_TIMEOUT, client.read(&mut buf))
        .await
        .expect("timed out waiting for the 400")
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..len]).into_owned();

    assert!(response.starts_with("SIP/2.0 400"), "got: {response}");
    // The observed source address was recorded in the Via.
    assert!(response.contains("received=127.0.0.1"), "got: {response}");

    let stats = server.stats(TransportKind::Tcp);
    assert_eq!(stats.in_requests_rejected, 1);
}

#[tokio::test]
async fn tcp_request_without_content_length_elicits_400() {
    let server_addr: SocketAddr = "127.0.0.1:5083".parse().unwrap();

    let server = Builder::new()
        .with_tcp(server_addr)
        .with_transaction_layer(TransactionLayer::default())
        .build()
        .await;
    tokio::spawn(server.clone().run());
    sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(server_addr).await.unwrap();
    let unframed = "INVITE sip:bob@127.0.0.1:5083 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:9;branch=z9hG4bK.nolen\r\n\
        From: <sip:alice@h>;tag=a\r\n\
        To: <sip:bob@h>\r\n\
        Call-ID: 3@h\r\n\
        CSeq: 1 INVITE\r\n\
        Max-Forwards: 70\r\n\r\n";
    client.write_all(unframed.as_bytes()).await.unwrap();
    client.flush().await.unwrap();

    let mut buf = vec![0u8; 4096];
    let len = timeout(RECV_TIMEOUT, client.read(&mut buf))
        .await
        .expect("timed out waiting for the 400")
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..len]).into_owned();

    assert!(response.starts_with("SIP/2.0 400"), "got: {response}");

    let stats = server.stats(TransportKind::Tcp);
    assert_eq!(stats.in_requests_rejected, 1);
}

fn invite_request(target: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(Header::Via(Via::new(TransportKind::Udp, Default::default(), None)));
    headers.push(Header::From(FromTo::new("<sip:alice@h>", Some("a1"))));
    headers.push(Header::To(FromTo::new("<sip:bob@h>", None)));
    headers.push(Header::CallId(sipstack::headers::CallId::new("retrans@h")));
    headers.push(Header::CSeq(sipstack::headers::CSeq::new(1, SipMethod::Invite)));
    headers.push(Header::MaxForwards(70));

    let mut request = Request::new(SipMethod::Invite, Uri::new(target));
    request.headers = headers;

    request
}

#[tokio::test]
async fn udp_invite_retransmits_until_timeout() {
    let client_addr: SocketAddr = "127.0.0.1:5084".parse().unwrap();
    let peer_addr: SocketAddr = "127.0.0.1:5085".parse().unwrap();

    // Fast timers so the whole B interval fits in the test.
    let timing = TimingConfig {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(160),
        t4: Duration::from_millis(200),
        td: Duration::from_millis(500),
    };

    let client = Builder::new()
        .with_udp(client_addr)
        .with_transaction_layer(TransactionLayer::default())
        .with_timing(timing)
        .with_sent_by_host("127.0.0.1")
        .build()
        .await;
    tokio::spawn(client.clone().run());
    sleep(Duration::from_millis(50)).await;

    // A peer that never answers.
    let peer = UdpSocket::bind(peer_addr).await.unwrap();

    let tsx = client
        .send_request(invite_request("sip:bob@127.0.0.1:5085"), peer_addr, TransportKind::Udp)
        .await
        .unwrap();
    let mut errors = tsx.errors().unwrap();

    // The original send plus at least two retransmissions arrive.
    let mut copies = 0;
    let mut buf = vec![0u8; 65_535];
    for _ in 0..3 {
        let (len, _) = timeout(RECV_TIMEOUT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&buf[..len]);
        assert!(text.starts_with("INVITE"), "got: {text}");
        assert!(text.contains("branch=z9hG4bK"), "got: {text}");
        copies += 1;
    }
    assert_eq!(copies, 3);

    // 64·T1 later the user learns about the timeout.
    let err = timeout(RECV_TIMEOUT, errors.recv())
        .await
        .expect("timed out waiting for the timeout")
        .unwrap();
    assert!(matches!(err, Error::TxTimeout), "got: {err}");
}

#[tokio::test]
async fn udp_keep_alive_ping_gets_pong() {
    let server_addr: SocketAddr = "127.0.0.1:5086".parse().unwrap();

    let server = Builder::new().with_udp(server_addr).build().await;
    tokio::spawn(server.clone().run());
    sleep(Duration::from_millis(50)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"\r\n\r\n", server_addr).await.unwrap();

    let mut buf = [0u8; 16];
    let (len, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf)).await.unwrap().unwrap();

    assert_eq!(&buf[..len], b"\r\n");
}

#[tokio::test]
async fn udp_cancel_goes_out_after_provisional() {
    let client_addr: SocketAddr = "127.0.0.1:5087".parse().unwrap();
    let peer_addr: SocketAddr = "127.0.0.1:5088".parse().unwrap();

    let client = Builder::new()
        .with_udp(client_addr)
        .with_transaction_layer(TransactionLayer::default())
        .with_sent_by_host("127.0.0.1")
        .build()
        .await;
    tokio::spawn(client.clone().run());
    sleep(Duration::from_millis(50)).await;

    let peer = UdpSocket::bind(peer_addr).await.unwrap();

    let tsx = client
        .send_request(invite_request("sip:bob@127.0.0.1:5088"), peer_addr, TransportKind::Udp)
        .await
        .unwrap();

    // Cancel before any response: the CANCEL is held back.
    tsx.cancel().await.unwrap();

    let mut buf = vec![0u8; 65_535];
    let (len, from) = timeout(RECV_TIMEOUT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
    let invite = String::from_utf8_lossy(&buf[..len]).into_owned();
    assert!(invite.starts_with("INVITE"), "got: {invite}");

    // Answer 180; the buffered CANCEL must follow.
    let branch_line = invite
        .lines()
        .find(|line| line.starts_with("Via:"))
        .expect("invite carries a via");
    let ringing = format!(
        "SIP/2.0 180 Ringing\r\n{branch_line}\r\n\
        From: <sip:alice@h>;tag=a1\r\n\
        To: <sip:bob@h>;tag=b1\r\n\
        Call-ID: retrans@h\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n"
    );
    peer.send_to(ringing.as_bytes(), from).await.unwrap();

    // Skip INVITE retransmissions until the CANCEL shows up.
    let cancel = loop {
        let (len, _) = timeout(RECV_TIMEOUT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&buf[..len]).into_owned();
        if text.starts_with("CANCEL") {
            break text;
        }
        assert!(text.starts_with("INVITE"), "got: {text}");
    };

    // Same branch, same CSeq number, method rewritten.
    let invite_branch = invite
        .split("branch=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap();
    assert!(cancel.contains(invite_branch), "got: {cancel}");
    assert!(cancel.contains("CSeq: 1 CANCEL"), "got: {cancel}");
}
