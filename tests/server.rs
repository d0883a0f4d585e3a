use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tcpframe::{
    packet_framing_handler, Client, FramingConfig, FramingProtocol, PrefixKind,
    LengthPrefixedFraming, SeparatorFraming, Server, ServerConfig, Socket, ThreadPerConnection,
};

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn start_server<P>(
    config: ServerConfig,
    protocol: P,
    framing: FramingConfig,
    handler: impl Fn(&Socket, &[u8]) + Send + Sync + 'static,
) -> (Server, JoinHandle<tcpframe::Result<()>>, String)
where
    P: FramingProtocol + 'static,
{
    init_logging();

    let server = Server::new("127.0.0.1:0", config);
    server.set_forking_strategy(ThreadPerConnection::new(packet_framing_handler(
        protocol, handler, framing,
    )));

    let worker = {
        let server = server.clone();
        thread::spawn(move || server.start())
    };

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.port() == 0 {
        assert!(Instant::now() < deadline, "server did not start in time");
        thread::sleep(Duration::from_millis(5));
    }

    let address = format!("127.0.0.1:{}", server.port());
    (server, worker, address)
}

fn connect(address: &str) -> Client {
    let client = Client::connect(address).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    client
}

fn read_line(client: &Client) -> Vec<u8> {
    let mut reader = client;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(err) => panic!("read failed: {err}"),
        }
    }

    line
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn echo_with_newline(socket: &Socket, packet: &[u8]) {
    let mut response = Vec::with_capacity(packet.len() + 1);
    response.extend_from_slice(packet);
    response.push(b'\n');
    let _ = socket.write_all(&response);
}

#[test]
fn echo_over_newline_framing() {
    let (server, worker, address) = start_server(
        ServerConfig::default(),
        SeparatorFraming::new(b"\n"),
        FramingConfig::default(),
        echo_with_newline,
    );

    let mut client = connect(&address);
    client.write_all(b"HELLO\n").unwrap();
    assert_eq!(read_line(&client), b"HELLO\n");

    // a packet fragmented across two writes still comes back whole
    client.write_all(b"AB").unwrap();
    thread::sleep(Duration::from_millis(10));
    client.write_all(b"C\n").unwrap();
    assert_eq!(read_line(&client), b"ABC\n");

    server.stop().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn echo_over_varint_framing() {
    let (server, worker, address) = start_server(
        ServerConfig::default(),
        LengthPrefixedFraming::new(PrefixKind::VarInt),
        FramingConfig::default(),
        |socket: &Socket, packet: &[u8]| {
            let mut response = Vec::with_capacity(packet.len() + 1);
            tcpframe::io::codec::write_var_int(&mut response, packet.len() as i32).unwrap();
            response.extend_from_slice(packet);
            let _ = socket.write_all(&response);
        },
    );

    let mut client = connect(&address);
    client.write_all(b"\x05HELLO").unwrap();

    let mut response = [0u8; 6];
    let mut reader = &client;
    reader.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"\x05HELLO");

    server.stop().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn two_varint_frames_in_one_write() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let (server, worker, address) = start_server(
        ServerConfig::default(),
        LengthPrefixedFraming::new(PrefixKind::VarInt),
        FramingConfig::default(),
        move |_socket: &Socket, packet: &[u8]| {
            sink.lock().push(packet.to_vec());
        },
    );

    let mut client = connect(&address);
    client.write_all(b"\x02AB\x03XYZ").unwrap();

    assert!(wait_until(Duration::from_secs(2), || received.lock().len() == 2));
    assert_eq!(*received.lock(), vec![b"AB".to_vec(), b"XYZ".to_vec()]);

    server.stop().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn oversize_packet_is_dropped() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let (server, worker, address) = start_server(
        ServerConfig::default(),
        SeparatorFraming::new(b"\n"),
        FramingConfig {
            max_packet_size: 4,
            ..Default::default()
        },
        move |_socket: &Socket, packet: &[u8]| {
            sink.lock().push(packet.to_vec());
        },
    );

    let mut client = connect(&address);
    client.write_all(b"AAAAAAAA\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"OK\n").unwrap();

    assert!(wait_until(Duration::from_secs(2), || !received.lock().is_empty()));
    assert_eq!(*received.lock(), vec![b"OK".to_vec()]);

    server.stop().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn max_clients_cap_closes_excess_connections() {
    let config = ServerConfig {
        max_clients: 1,
        tick_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let (server, worker, address) = start_server(
        config,
        SeparatorFraming::new(b"\n"),
        FramingConfig::default(),
        echo_with_newline,
    );

    let mut first = connect(&address);
    first.write_all(b"ping\n").unwrap();
    assert_eq!(read_line(&first), b"ping\n");

    // the second connection is accepted and instantly closed by the server
    let second = connect(&address);
    let mut reader = &second;
    let mut buffer = [0u8; 1];
    let result = reader.read(&mut buffer);
    match result {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, read {n} bytes"),
        Err(err) => assert!(tcpframe::is_broken_pipe(&err), "unexpected error: {err}"),
    }

    assert!(wait_until(Duration::from_secs(2), || {
        server.metrics().connections == 1
    }));

    server.stop().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn orderly_shutdown_disconnects_all_clients() {
    let config = ServerConfig {
        tick_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let (server, worker, address) = start_server(
        config,
        SeparatorFraming::new(b"\n"),
        FramingConfig::default(),
        echo_with_newline,
    );

    let clients: Vec<Client> = (0..3).map(|_| connect(&address)).collect();
    assert!(wait_until(Duration::from_secs(2), || {
        server.metrics().connections == 3
    }));

    server.stop().unwrap();
    worker.join().unwrap().unwrap();

    for client in &clients {
        let mut reader = client;
        let mut buffer = [0u8; 1];
        match reader.read(&mut buffer) {
            Ok(0) => {}
            Ok(n) => panic!("expected EOF, read {n} bytes"),
            Err(err) => assert!(tcpframe::is_broken_pipe(&err), "unexpected error: {err}"),
        }
    }
}

#[test]
fn metrics_reflect_traffic() {
    let config = ServerConfig {
        tick_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let (server, worker, address) = start_server(
        config,
        SeparatorFraming::new(b"\n"),
        FramingConfig::default(),
        echo_with_newline,
    );

    let mut client = connect(&address);
    client.write_all(b"0123456789\n").unwrap();
    assert_eq!(read_line(&client), b"0123456789\n");

    assert!(wait_until(Duration::from_secs(2), || {
        let metrics = server.metrics();
        metrics.total_read == 11 && metrics.total_written == 11 && metrics.connections == 1
    }));

    let metrics = server.metrics();
    assert_eq!(metrics.threads, 1);

    server.stop().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn start_without_forking_strategy_fails() {
    init_logging();

    let server = Server::new("127.0.0.1:0", ServerConfig::default());
    let err = server.start().unwrap_err();
    assert!(matches!(err, tcpframe::Error::MissingForkingStrategy));
}

#[test]
fn pool_reuse_keeps_connection_count_accurate() {
    let config = ServerConfig {
        tick_interval: Duration::from_millis(50),
        ..Default::default()
    };

    let (server, worker, address) = start_server(
        config,
        SeparatorFraming::new(b"\n"),
        FramingConfig::default(),
        echo_with_newline,
    );

    // sequential connect/disconnect cycles; each socket is reclaimed by the
    // sweep after its handler observes the disconnect
    for _ in 0..5 {
        let mut client = connect(&address);
        client.write_all(b"hi\n").unwrap();
        assert_eq!(read_line(&client), b"hi\n");
        client.close().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            server.metrics().connections == 0
        }));
    }

    server.stop().unwrap();
    worker.join().unwrap().unwrap();
}
