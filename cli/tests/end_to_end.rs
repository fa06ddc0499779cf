//! Subprocess end-to-end tests: run the compiled `natbridge` binary as two
//! separate processes (client and server), each with its own NAT probe
//! cache and OS-level sockets, talking through an in-process signaling stub
//! and a loopback STUN stand-in.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use natbridge_core::signaling_stub::SignalingStub;

const MAGIC_COOKIE: u32 = 0x2112_A442;

/// A UDP responder that speaks just enough STUN to answer a binding request
/// by reflecting the request's own source address back as the
/// XOR-MAPPED-ADDRESS -- what a real STUN server does, and enough for the
/// binary under test to complete its NAT probe against loopback.
struct MockStun {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl MockStun {
    fn spawn() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let addr = socket.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            while !thread_stop.load(Ordering::Relaxed) {
                let (n, from) = match socket.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if n < 20 {
                    continue;
                }
                let tx = &buf[8..20];

                let ip = match from.ip() {
                    std::net::IpAddr::V4(v4) => v4.octets(),
                    std::net::IpAddr::V6(_) => continue,
                };
                let xor_port = from.port() ^ ((MAGIC_COOKIE >> 16) as u16);

                let mut resp = vec![0u8; 32];
                resp[0..2].copy_from_slice(&0x0101u16.to_be_bytes());
                resp[2..4].copy_from_slice(&12u16.to_be_bytes());
                resp[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                resp[8..20].copy_from_slice(tx);
                resp[20..22].copy_from_slice(&0x0020u16.to_be_bytes());
                resp[22..24].copy_from_slice(&8u16.to_be_bytes());
                resp[24] = 0;
                resp[25] = 0x01;
                resp[26..28].copy_from_slice(&xor_port.to_be_bytes());
                for k in 0..4 {
                    resp[28 + k] = ip[k] ^ resp[4 + k];
                }

                let _ = socket.send_to(&resp, from);
            }
        });

        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for MockStun {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn write_config(path: &std::path::Path, contents: &str) {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
}

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn wait_for_tcp_accept(port: u16, timeout: Duration) -> TcpStream {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        if Instant::now() >= deadline {
            panic!("nothing listening on 127.0.0.1:{port} within {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[tokio::test]
async fn tcp_mapping_relays_through_client_and_server_processes() {
    let stun = MockStun::spawn();
    let stub = SignalingStub::spawn().await;

    // Stand-in for the real service the Server exposes.
    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    std::thread::spawn(move || {
        if let Ok((mut sock, _)) = upstream.accept() {
            let mut buf = [0u8; 5];
            std::io::Read::read_exact(&mut sock, &mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            std::io::Write::write_all(&mut sock, b"world").unwrap();
        }
    });

    let client_local_port = free_tcp_port();
    let dir = tempfile::tempdir().unwrap();

    let server_config = dir.path().join("server.yml");
    write_config(
        &server_config,
        &format!(
            "mode: server\nroomId: e2e-tcp\nsignalingUrl: {}\nstunServer: \"{}\"\nsecondaryStunServer: \"{}\"\nwatchIntervalSecs: 1\n",
            stub.base_url(),
            stun.addr,
            stun.addr,
        ),
    );

    let client_config = dir.path().join("client.yml");
    write_config(
        &client_config,
        &format!(
            "mode: client\nroomId: e2e-tcp\nsignalingUrl: {}\nstunServer: \"{}\"\nsecondaryStunServer: \"{}\"\nmappings:\n  - \"tcp:{}:{}\"\n",
            stub.base_url(),
            stun.addr,
            stun.addr,
            client_local_port,
            upstream_port,
        ),
    );

    let server_proc = ChildGuard(
        Command::new(env!("CARGO_BIN_EXE_natbridge"))
            .arg("--config")
            .arg(&server_config)
            .env("RUST_LOG", "warn")
            .spawn()
            .expect("failed to spawn server process"),
    );
    let client_proc = ChildGuard(
        Command::new(env!("CARGO_BIN_EXE_natbridge"))
            .arg("--config")
            .arg(&client_config)
            .env("RUST_LOG", "warn")
            .spawn()
            .expect("failed to spawn client process"),
    );

    let mut conn = wait_for_tcp_accept(client_local_port, Duration::from_secs(15));
    std::io::Write::write_all(&mut conn, b"hello").unwrap();
    let mut buf = [0u8; 5];
    std::io::Read::read_exact(&mut conn, &mut buf).unwrap();
    assert_eq!(&buf, b"world");

    drop(client_proc);
    drop(server_proc);
}
