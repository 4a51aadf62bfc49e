//! # Integration tests: client Session ↔ server Endpoint
//!
//! These tests drive the full vertical stack:
//! Session → packet encode → Endpoint → Session → events
//!
//! No actual network I/O — the "network" is simulated by passing bytes
//! directly. Impairment (loss, reorder, duplication) is applied in the
//! middle.

use bytes::Bytes;

use kestrel_quic::endpoint::{Endpoint, EndpointConfig};
use kestrel_quic::error::ErrorCode;
use kestrel_quic::ids::SocketAddress;
use kestrel_quic::session::{Session, SessionEvent, SessionState};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn client_addr() -> SocketAddress {
    "192.0.2.10:52000".parse().unwrap()
}

fn server_addr() -> SocketAddress {
    "192.0.2.1:443".parse().unwrap()
}

fn test_client() -> Session {
    Session::client(client_addr(), server_addr())
}

fn test_endpoint() -> Endpoint {
    Endpoint::new(server_addr(), EndpointConfig::default())
}

/// Shuttle datagrams both ways until neither side has output, applying
/// `impair` to the client→server direction. `impair` returns the
/// datagrams actually delivered for each one sent.
fn pump_with(
    client: &mut Session,
    endpoint: &mut Endpoint,
    mut impair: impl FnMut(Bytes) -> Vec<Bytes>,
) {
    loop {
        let to_server: Vec<Bytes> = client.drain_output();
        let to_client = endpoint.drain_output();
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        for datagram in to_server {
            for delivered in impair(datagram) {
                endpoint.handle_datagram(client_addr(), &delivered);
            }
        }
        for (_, datagram) in to_client {
            client.handle_datagram(server_addr(), &datagram);
        }
        client.flush().unwrap();
        endpoint.flush();
    }
}

fn pump(client: &mut Session, endpoint: &mut Endpoint) {
    pump_with(client, endpoint, |d| vec![d]);
}

fn collect_stream_data(events: &[SessionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StreamData { data, .. } => Some(data.as_ref().to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

// ─── Clean Path ─────────────────────────────────────────────────────────────

#[test]
fn handshake_and_echo() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    let id = client.open_stream().unwrap();
    client.write(id, Bytes::from_static(b"GET /index")).unwrap();
    client.finish_stream(id).unwrap();
    client.flush().unwrap();
    pump(&mut client, &mut endpoint);

    assert_eq!(client.state(), SessionState::Established);
    let cid = client.connection_id();
    let server = endpoint.session_mut(&cid).unwrap();
    assert_eq!(server.state(), SessionState::Established);
    assert_eq!(server.version(), client.version());

    let events = server.drain_events();
    assert_eq!(collect_stream_data(&events), b"GET /index");
    assert!(events.contains(&SessionEvent::StreamFinished(id)));

    // Echo back on a server stream.
    let reply = server.open_stream().unwrap();
    server.write(reply, Bytes::from_static(b"200 OK")).unwrap();
    server.finish_stream(reply).unwrap();
    server.flush().unwrap();
    pump(&mut client, &mut endpoint);

    let events = client.drain_events();
    assert_eq!(collect_stream_data(&events), b"200 OK");
    assert!(events.contains(&SessionEvent::StreamFinished(reply)));
}

#[test]
fn bulk_transfer_spans_many_packets() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let id = client.open_stream().unwrap();
    client.write(id, Bytes::from(payload.clone())).unwrap();
    client.finish_stream(id).unwrap();
    client.flush().unwrap();
    pump(&mut client, &mut endpoint);

    let server = endpoint.session_mut(&client.connection_id()).unwrap();
    let events = server.drain_events();
    assert_eq!(collect_stream_data(&events), payload);
    assert!(server.stats().packets_received > 10);
}

#[test]
fn concurrent_streams_deliver_independently() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    let a = client.open_stream().unwrap();
    let b = client.open_stream().unwrap();
    client.write(a, Bytes::from_static(b"alpha")).unwrap();
    client.write(b, Bytes::from_static(b"beta")).unwrap();
    client.flush().unwrap();
    pump(&mut client, &mut endpoint);

    let server = endpoint.session_mut(&client.connection_id()).unwrap();
    let events = server.drain_events();
    for (id, expected) in [(a, &b"alpha"[..]), (b, &b"beta"[..])] {
        let data: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StreamData { stream_id, data } if *stream_id == id => {
                    Some(data.as_ref().to_vec())
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(data, expected);
    }
}

// ─── Impaired Path ──────────────────────────────────────────────────────────

#[test]
fn duplication_does_not_duplicate_delivery() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    let id = client.open_stream().unwrap();
    client.write(id, Bytes::from_static(b"exactly once")).unwrap();
    client.finish_stream(id).unwrap();
    client.flush().unwrap();
    // Deliver every client datagram twice.
    pump_with(&mut client, &mut endpoint, |d| vec![d.clone(), d]);

    let server = endpoint.session_mut(&client.connection_id()).unwrap();
    let events = server.drain_events();
    assert_eq!(collect_stream_data(&events), b"exactly once");
    let fins = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::StreamFinished(_)))
        .count();
    assert_eq!(fins, 1);
}

#[test]
fn reordering_is_repaired_by_the_stream_buffer() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 239) as u8).collect();
    let id = client.open_stream().unwrap();
    client.write(id, Bytes::from(payload.clone())).unwrap();
    client.finish_stream(id).unwrap();
    client.flush().unwrap();

    // Deliver the client's initial burst in reverse order, then pump the
    // rest cleanly.
    let mut burst: Vec<Bytes> = client.drain_output();
    burst.reverse();
    for datagram in burst {
        endpoint.handle_datagram(client_addr(), &datagram);
    }
    endpoint.flush();
    pump(&mut client, &mut endpoint);

    let server = endpoint.session_mut(&client.connection_id()).unwrap();
    let events = server.drain_events();
    assert_eq!(collect_stream_data(&events), payload);
    assert!(events.contains(&SessionEvent::StreamFinished(id)));
}

#[test]
fn loss_of_trailing_data_leaves_stream_unfinished() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    let payload = vec![7u8; 5_000];
    let id = client.open_stream().unwrap();
    client.write(id, Bytes::from(payload)).unwrap();
    client.finish_stream(id).unwrap();
    client.flush().unwrap();

    // Drop the last datagram of the burst.
    let mut burst: Vec<Bytes> = client.drain_output();
    burst.pop();
    for datagram in burst {
        endpoint.handle_datagram(client_addr(), &datagram);
    }

    let server = endpoint.session_mut(&client.connection_id()).unwrap();
    let events = server.drain_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamFinished(_))));
}

// ─── Close and Teardown ─────────────────────────────────────────────────────

#[test]
fn graceful_close_reaps_the_server_session() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    client.ping().unwrap();
    pump(&mut client, &mut endpoint);
    assert_eq!(endpoint.session_count(), 1);

    client.close(ErrorCode::NO_ERROR, "session complete").unwrap();
    for datagram in client.drain_output() {
        endpoint.handle_datagram(client_addr(), &datagram);
    }
    let cid = client.connection_id();
    {
        let server = endpoint.session_mut(&cid).unwrap();
        assert!(server.is_closed());
        assert!(matches!(
            server.drain_events().last(),
            Some(SessionEvent::Closed { code, .. }) if *code == ErrorCode::NO_ERROR
        ));
    }
    assert_eq!(endpoint.reap_closed(), vec![cid]);
    assert_eq!(endpoint.session_count(), 0);
}

#[test]
fn writes_after_close_are_refused() {
    init_tracing();
    let mut client = test_client();
    let mut endpoint = test_endpoint();

    let id = client.open_stream().unwrap();
    client.flush().unwrap();
    pump(&mut client, &mut endpoint);

    client.close(ErrorCode::NO_ERROR, "").unwrap();
    let err = client.write(id, Bytes::from_static(b"late")).unwrap_err();
    assert_eq!(err.code, ErrorCode::CONNECTION_CLOSED);
    let err = client.open_stream().unwrap_err();
    assert_eq!(err.code, ErrorCode::CONNECTION_CLOSED);
}
