mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use sshmux::filter::ftp::FtpProxyFilter;
use sshmux::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn local_forward_round_trip() {
    let pair = pair();
    let port = echo_server(b"hello\n").await;
    let forward = pair
        .a
        .new_local_forward("127.0.0.1", 0, "127.0.0.1", u32::from(port))
        .await
        .unwrap();
    let mut stream = TcpStream::connect(forward.local_addr()).await.unwrap();
    assert_eq!(read_line(&mut stream).await, "hello\n");
    stream.write_all(b"ping\n").await.unwrap();
    assert_eq!(read_line(&mut stream).await, "ping\n");
    assert!(pair
        .b_events
        .events()
        .contains(&format!("direct 127.0.0.1:{}", port)));
}

#[tokio::test]
async fn confirmation_precedes_data() {
    let pair = pair();
    let port = echo_server(b"220 ready\r\n").await;
    let forward = pair
        .a
        .new_local_forward("127.0.0.1", 0, "127.0.0.1", u32::from(port))
        .await
        .unwrap();
    for _ in 0..5 {
        let mut stream = TcpStream::connect(forward.local_addr()).await.unwrap();
        assert_eq!(read_line(&mut stream).await, "220 ready\r\n");
    }
    let log = pair.b_to_a.lock().unwrap().clone();
    let mut confirmed = std::collections::HashSet::new();
    let mut data = 0;
    for (typ, recipient) in log {
        match typ {
            CHANNEL_OPEN_CONFIRMATION => {
                confirmed.insert(recipient);
            }
            CHANNEL_DATA | CHANNEL_EOF | CHANNEL_CLOSE | CHANNEL_WINDOW_ADJUST => {
                assert!(confirmed.contains(&recipient), "message {} before confirmation", typ);
                if typ == CHANNEL_DATA {
                    data += 1
                }
            }
            _ => {}
        }
    }
    assert_eq!(confirmed.len(), 5);
    assert!(data >= 5);
}

#[tokio::test]
async fn flow_control_end_to_end() {
    let mut config = Config::default();
    config.window_size = 4096;
    config.maximum_packet_size = 1024;
    let pair = pair_with(config.clone(), config);
    let port = echo_server(b"").await;
    let channel = pair
        .a
        .channel_open_direct_tcpip("127.0.0.1", u32::from(port), "127.0.0.1", 1)
        .await
        .unwrap();
    let (mut reader, writer) = channel.split();
    let sent: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
    let payload = sent.clone();
    let writing = tokio::spawn(async move {
        writer.write(&payload).await.unwrap();
        writer.eof();
    });
    let mut received = Vec::new();
    while received.len() < sent.len() {
        let data = reader.read().await.unwrap();
        assert!(!data.is_empty());
        received.extend_from_slice(&data);
    }
    assert_eq!(received, sent);
    writing.await.unwrap();
}

#[tokio::test]
async fn remote_forward_round_trip() {
    let pair = pair();
    let port = echo_server(b"welcome\n").await;
    // Find a free port for the remote side to listen on.
    let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_port = free.local_addr().unwrap().port();
    drop(free);
    assert!(
        pair.a
            .new_remote_forward_blocking("127.0.0.1", u32::from(remote_port), "127.0.0.1", u32::from(port), None)
            .await
    );
    let mut stream = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    assert_eq!(read_line(&mut stream).await, "welcome\n");

    assert!(pair.a.delete_remote_forward("127.0.0.1", u32::from(remote_port)));
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", remote_port)).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await
    }
    assert!(refused);
}

#[tokio::test]
async fn refused_remote_forward() {
    let mut config = Config::default();
    config.allow_remote_forwarding = false;
    let pair = pair_with(Config::default(), config);
    assert!(!pair.a.new_remote_forward_blocking("127.0.0.1", 0, "127.0.0.1", 21, None).await);
    assert_eq!(pair.a.get_forward_target("127.0.0.1", 0), None);
}

#[tokio::test]
async fn active_mode_goes_through_the_tunnel() {
    let pair = pair();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let forward = pair
        .a
        .new_local_forward_filtered(
            "127.0.0.1",
            0,
            "127.0.0.1",
            u32::from(server_port),
            Some(Arc::new(FtpProxyFilter::new())),
        )
        .await
        .unwrap();
    let mut control = TcpStream::connect(forward.local_addr()).await.unwrap();
    let (mut server_control, _) = server.accept().await.unwrap();

    // 4 * 256 + 210 = 1234
    control.write_all(b"PORT 192,168,1,1,4,210\r\n").await.unwrap();
    let line = read_line(&mut server_control).await;
    assert!(line.starts_with("PORT ") && line.ends_with("\r\n"), "{:?}", line);
    let (host, first) = host_port(line["PORT ".len()..].trim_end());
    assert_eq!(host, [127, 0, 0, 1]);
    assert_ne!(first, 1234);
    assert_eq!(
        pair.a.get_forward_target("0.0.0.0", u32::from(first)),
        Some(("192.168.1.1".to_string(), 1234))
    );

    // The client's data socket.
    let client_data = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let p = client_data.local_addr().unwrap().port();
    control
        .write_all(format!("port 127,0,0,1,{},{}\r\n", p >> 8, p & 0xff).as_bytes())
        .await
        .unwrap();
    let line = read_line(&mut server_control).await;
    let (_, second) = host_port(line["PORT ".len()..].trim_end());
    assert_ne!(second, p);
    // The previous forward was torn down.
    assert_eq!(pair.a.get_forward_target("0.0.0.0", u32::from(first)), None);

    // The server connects to the advertised port, on its own host.
    let mut server_data = TcpStream::connect(("127.0.0.1", second)).await.unwrap();
    let (mut client_side, _) = client_data.accept().await.unwrap();
    server_data.write_all(b"listing").await.unwrap();
    let mut buf = [0; 7];
    client_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"listing");
    assert!(pair
        .b_events
        .events()
        .iter()
        .any(|e| e.starts_with("direct 127.0.0.1:")));
}

#[tokio::test]
async fn passive_mode_listener_is_single_use() {
    let pair = pair();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_port = server.local_addr().unwrap().port();
    let data_server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_port = data_server.local_addr().unwrap().port();
    let filter = FtpProxyFilter::new().with_public_addr(Ipv4Addr::new(192, 0, 2, 7));
    let forward = pair
        .a
        .new_local_forward_filtered(
            "127.0.0.1",
            0,
            "127.0.0.1",
            u32::from(server_port),
            Some(Arc::new(filter)),
        )
        .await
        .unwrap();
    let mut control = TcpStream::connect(forward.local_addr()).await.unwrap();
    let (mut server_control, _) = server.accept().await.unwrap();

    control.write_all(b"PASV\r\n").await.unwrap();
    assert_eq!(read_line(&mut server_control).await, "PASV\r\n");
    server_control
        .write_all(
            format!(
                "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                data_port >> 8,
                data_port & 0xff
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let reply = read_line(&mut control).await;
    assert!(reply.starts_with("227 Entering Passive Mode ("), "{:?}", reply);
    let tuple = &reply[reply.find('(').unwrap() + 1..reply.find(')').unwrap()];
    let (host, port) = host_port(tuple);
    assert_eq!(host, [192, 0, 2, 7]);
    assert_ne!(port, data_port);

    let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut server_data, _) = data_server.accept().await.unwrap();
    server_data.write_all(b"data").await.unwrap();
    let mut buf = [0; 4];
    data.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"data");

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // Other replies pass through untouched.
    server_control.write_all(b"226 Transfer complete\r\n").await.unwrap();
    assert_eq!(read_line(&mut control).await, "226 Transfer complete\r\n");
}

#[tokio::test]
async fn stop_closes_everything() {
    let pair = pair();
    let port = echo_server(b"hi\n").await;
    let forward = pair
        .a
        .new_local_forward("127.0.0.1", 0, "127.0.0.1", u32::from(port))
        .await
        .unwrap();
    let mut stream = TcpStream::connect(forward.local_addr()).await.unwrap();
    assert_eq!(read_line(&mut stream).await, "hi\n");
    assert_eq!(pair.a.channel_ids().len(), 1);

    pair.a.stop();
    assert!(pair.a.channel_ids().is_empty());
    assert!(pair.a_run.await.unwrap().is_ok());
    // The local socket sees the end of the stream.
    let mut buf = [0; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(forward.local_addr()).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await
    }
    assert!(refused);
}
