use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use drvm_rpc::protocol::{self, Message, MessageType};
use drvm_rpc::{Error, HandlerResult, RpcClient, RpcServer, ServerHandle};
use serde_json::{json, Map, Value};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

fn start_server() -> ServerHandle {
    let mut server = RpcServer::bind("127.0.0.1:0").unwrap();
    server.register("echo", |params: Map<String, Value>| -> HandlerResult {
        Ok(object(json!({"success": true, "params": params})))
    });
    server.register("get_status", |_: Map<String, Value>| -> HandlerResult {
        Ok(object(json!({
            "success": true,
            "vm_type": "test",
            "isolated": true,
            "installed_drivers_count": 0,
            "memory_mb": 512,
            "cpu_cores": 1,
            "processes_count": 3
        })))
    });
    server.spawn().unwrap()
}

fn connected_client(server: &ServerHandle) -> RpcClient {
    let client = RpcClient::new(server.local_addr().to_string());
    assert!(client.connect(Duration::from_secs(2)));
    client
}

#[test]
fn request_response_over_tcp() {
    let server = start_server();
    let client = connected_client(&server);

    let reply = client
        .send_request("echo", object(json!({"device_id": "USB\\VID_046D"})))
        .unwrap();
    assert_eq!(reply["params"]["device_id"], json!("USB\\VID_046D"));

    let status = client.get_status().unwrap();
    assert!(status.success);
    assert_eq!(status.memory_mb, 512);
}

#[test]
fn unknown_method_keeps_connection_open() {
    let server = start_server();
    let client = connected_client(&server);

    let reply = client.send_request("frobnicate", Map::new()).unwrap();
    assert_eq!(
        Value::Object(reply),
        json!({"success": false, "error": "Unknown method: frobnicate"})
    );

    assert!(client.is_connected());
    let reply = client.send_request("echo", Map::new()).unwrap();
    assert_eq!(reply["success"], json!(true));
}

#[test]
fn typed_call_surfaces_remote_failure() {
    let server = start_server();
    let client = connected_client(&server);

    match client.install_driver("PCI\\VEN_1234") {
        Err(Error::Remote(msg)) => assert_eq!(msg, "Unknown method: install_driver"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(client.is_connected());
}

#[test]
fn foreign_magic_gets_no_reply_and_server_survives() {
    let server = start_server();
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    let mut bogus = Message::request("echo", Map::new()).encode().unwrap();
    bogus[..4].copy_from_slice(b"XXXX");
    assert!(Message::decode(&bogus).is_err());
    stream.write_all(&bogus).unwrap();

    // Nothing comes back for the bad frame.
    let mut probe = [0u8; 1];
    let err = stream.read(&mut probe).unwrap_err();
    assert!(matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ));

    // The same connection still serves well-formed requests.
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let good = Message::request("echo", object(json!({"n": 1})));
    protocol::write_message(&mut stream, &good).unwrap();
    let reply = protocol::read_message(&mut stream).unwrap().unwrap();
    assert_eq!(reply.msg_type, MessageType::Response);
    assert_eq!(reply.payload["params"]["n"], json!(1));
}

#[test]
fn oversized_foreign_frame_is_skipped() {
    let server = start_server();
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let length = protocol::MAX_PAYLOAD_LEN + 16;
    let mut foreign = b"XXXX\x01\x01".to_vec();
    foreign.extend_from_slice(&length.to_be_bytes());
    foreign.resize(protocol::HEADER_LEN + length as usize, b'x');
    stream.write_all(&foreign).unwrap();

    let good = Message::request("echo", object(json!({"after": "foreign"})));
    protocol::write_message(&mut stream, &good).unwrap();
    let reply = protocol::read_message(&mut stream).unwrap().unwrap();
    assert_eq!(reply.payload["params"]["after"], json!("foreign"));
}

#[test]
fn request_split_across_writes_is_reassembled() {
    let server = start_server();
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.set_nodelay(true).unwrap();

    let bytes = Message::request("echo", object(json!({"chunked": true})))
        .encode()
        .unwrap();
    for chunk in bytes.chunks(4) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(5));
    }

    let reply = protocol::read_message(&mut stream).unwrap().unwrap();
    assert_eq!(reply.payload["params"]["chunked"], json!(true));
}

#[test]
fn concurrent_callers_share_one_connection_without_mixing_replies() {
    let server = start_server();
    let client = Arc::new(connected_client(&server));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let reply = client
                    .send_request("echo", object(json!({"caller": i})))
                    .unwrap();
                assert_eq!(reply["params"]["caller"], json!(i));
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn one_slow_client_does_not_block_another() {
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);

    let mut server = RpcServer::bind("127.0.0.1:0").unwrap();
    server.register("hold", move |_: Map<String, Value>| -> HandlerResult {
        entered_tx.lock().unwrap().send(()).unwrap();
        release_rx.lock().unwrap().recv().unwrap();
        Ok(object(json!({"success": true})))
    });
    server.register("echo", |_: Map<String, Value>| -> HandlerResult {
        Ok(object(json!({"success": true})))
    });
    let server = server.spawn().unwrap();

    let slow = connected_client(&server);
    let fast = RpcClient::new(server.local_addr().to_string())
        .request_timeout(Duration::from_secs(10));
    assert!(fast.connect(Duration::from_secs(2)));

    let slow_call = thread::spawn(move || slow.send_request("hold", Map::new()).unwrap());
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // The first handler is parked until released; this call must not wait on it.
    let reply = fast.send_request("echo", Map::new()).unwrap();
    assert_eq!(reply["success"], json!(true));

    release_tx.send(()).unwrap();
    assert_eq!(slow_call.join().unwrap()["success"], json!(true));
}

#[test]
fn client_can_reconnect_after_disconnect() {
    let server = start_server();
    let client = connected_client(&server);

    client.disconnect();
    assert!(matches!(
        client.send_request("echo", Map::new()),
        Err(Error::VmUnavailable(_))
    ));

    assert!(client.connect(Duration::from_secs(2)));
    let reply = client.send_request("echo", Map::new()).unwrap();
    assert_eq!(reply["success"], json!(true));
}
