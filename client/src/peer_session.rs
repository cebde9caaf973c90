//! Direct peer-to-peer session: control handshake plus the UDP message
//! channel, one task per session.
//!
//! Both roles end in the same place. The connector dials the control
//! address learned through the directory server, the listener accepts on
//! the address it advertised; each side then exchanges its data-channel
//! endpoint over the control socket and the session task takes over.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{self, AsyncReadExt, AsyncWriteExt, Error, ErrorKind};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender as BSender;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use tracing::{debug, error, info};

use protocol::peer::{self, HANDSHAKE_LEN};
use protocol::PeerAddr;

const SHUTDOWN: u8 = 1;
const MSG_CHANNEL_SIZE: usize = 64;
const DATAGRAM_MAX: usize = 2048;
const HANDSHAKE_WAIT: Duration = Duration::from_secs(30);

// data-channel port range of the original deployment
const DATA_PORT_LOW: u16 = 10_000;
const DATA_PORT_SPAN: u32 = 10_000;
const BIND_ATTEMPTS: u32 = 16;

pub type History = Arc<Mutex<Vec<(String, SystemTime)>>>;

#[derive(Debug)]
pub enum PeerEvent {
    Established(PeerSessionHandle),
    Ended(String),
}

/// Controller-side handle to a running session.
#[derive(Debug, Clone)]
pub struct PeerSessionHandle {
    pub peer_name: String,
    msg_tx: Sender<String>,
    shutdown_tx: BSender<u8>,
    active: Arc<AtomicBool>,
    history: History,
}

impl PeerSessionHandle {
    /// Queue a message for the peer. False once the session task is gone.
    pub async fn send(&self, text: String) -> bool {
        self.msg_tx.send(text).await.is_ok()
    }

    /// Idempotent, callable from any task. The session task observes the
    /// shutdown within one poll and closes both sockets.
    pub fn leave(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(SHUTDOWN);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn history(&self) -> Vec<(String, SystemTime)> {
        self.history.lock().await.clone()
    }
}

pub struct PeerSession {
    peer_name: String,
    _control: TcpStream, // held open for the session lifetime
    data: UdpSocket,
    remote: SocketAddr,
    msg_rx: Receiver<String>,
    shutdown_rx: broadcast::Receiver<u8>,
    active: Arc<AtomicBool>,
    history: History,
    events_tx: Sender<PeerEvent>,
}

impl PeerSession {
    /// Dial the control address a peer advertised through the server and
    /// run the handshake as the connector.
    pub fn spawn_connector(peer_name: String, addr: PeerAddr, events_tx: Sender<PeerEvent>) {
        let _h = tokio::spawn(async move {
            match Self::connect_setup(peer_name.clone(), addr, events_tx.clone()).await {
                Ok(handle) => {
                    let _ = events_tx.send(PeerEvent::Established(handle)).await;
                },
                Err(e) => error!("Peer handshake with {} failed: {:?}", peer_name, e),
            }
        });
    }

    /// Wait for the peer to dial the advertised control listener and run
    /// the handshake as the listener.
    pub fn spawn_listener(peer_name: String, listener: TcpListener, events_tx: Sender<PeerEvent>) {
        let _h = tokio::spawn(async move {
            match Self::accept_setup(peer_name.clone(), listener, events_tx.clone()).await {
                Ok(handle) => {
                    let _ = events_tx.send(PeerEvent::Established(handle)).await;
                },
                Err(e) => error!("Peer handshake with {} failed: {:?}", peer_name, e),
            }
        });
    }

    async fn connect_setup(peer_name: String, addr: PeerAddr, events_tx: Sender<PeerEvent>)
                           -> io::Result<PeerSessionHandle> {
        let mut control = TcpStream::connect((addr.ip, addr.port)).await
            .map_err(|e| { error!("Unable to reach peer control listener"); e })?;

        let local_ip = ipv4_of(control.local_addr()?)?;
        let data = bind_data_socket(local_ip).await?;
        let data_port = data.local_addr()?.port();

        // connector speaks first
        control.write_all(&peer::encode_handshake(local_ip, data_port)).await?;

        let mut buf = [0u8; HANDSHAKE_LEN];
        control.read_exact(&mut buf).await?;
        let (peer_ip, peer_port) = peer::decode_handshake(&buf)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;

        debug!("Handshake with {} done, their data channel {}:{}", peer_name, peer_ip, peer_port);
        Ok(Self::start(peer_name, control, data,
                       SocketAddr::from((peer_ip, peer_port)), events_tx))
    }

    async fn accept_setup(peer_name: String, listener: TcpListener, events_tx: Sender<PeerEvent>)
                          -> io::Result<PeerSessionHandle> {
        let (mut control, addr) = timeout(HANDSHAKE_WAIT, listener.accept()).await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "peer never dialed back"))??;
        debug!("Peer {} dialed control channel from {:?}", peer_name, addr);

        let local_ip = ipv4_of(control.local_addr()?)?;
        let data = bind_data_socket(local_ip).await?;
        let data_port = data.local_addr()?.port();

        let mut buf = [0u8; HANDSHAKE_LEN];
        control.read_exact(&mut buf).await?;
        let (peer_ip, peer_port) = peer::decode_handshake(&buf)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;

        control.write_all(&peer::encode_handshake(local_ip, data_port)).await?;

        debug!("Handshake with {} done, their data channel {}:{}", peer_name, peer_ip, peer_port);
        Ok(Self::start(peer_name, control, data,
                       SocketAddr::from((peer_ip, peer_port)), events_tx))
    }

    fn start(peer_name: String, control: TcpStream, data: UdpSocket,
             remote: SocketAddr, events_tx: Sender<PeerEvent>) -> PeerSessionHandle {
        let (msg_tx, msg_rx) = mpsc::channel::<String>(MSG_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let active = Arc::new(AtomicBool::new(true));
        let history: History = Arc::new(Mutex::new(Vec::new()));

        let handle = PeerSessionHandle {
            peer_name: peer_name.clone(),
            msg_tx,
            shutdown_tx,
            active: Arc::clone(&active),
            history: Arc::clone(&history),
        };

        let session = PeerSession {
            peer_name,
            _control: control,
            data,
            remote,
            msg_rx,
            shutdown_rx,
            active,
            history,
            events_tx,
        };

        let _h = tokio::spawn(async move {
            session.run().await;
        });

        handle
    }

    async fn run(mut self) {
        info!("Peer session with {} ready", self.peer_name);
        let mut buf = vec![0u8; DATAGRAM_MAX];

        loop {
            select! {
                Some(text) = self.msg_rx.recv() => {
                    let frame = peer::encode_message(&text);

                    // best effort, a departed peer must never break the sender
                    if let Err(e) = self.data.send_to(&frame, self.remote).await {
                        debug!("Data channel send failed: {:?}", e);
                    }

                    self.history.lock().await.push((text, SystemTime::now()));
                },
                res = self.data.recv_from(&mut buf) => {
                    match res {
                        Ok((n, from)) => match peer::decode_message(&buf[..n]) {
                            Ok(text) => {
                                println!("<{}> {}", self.peer_name, text);
                                self.history.lock().await.push((text, SystemTime::now()));
                            },
                            Err(e) => debug!("Discarding malformed datagram from {:?}: {:?}", from, e),
                        },
                        // ICMP-induced errors from a closed peer are tolerated
                        Err(e) => debug!("Data channel receive failed: {:?}", e),
                    }
                },
                _ = self.shutdown_rx.recv() => break,
            }
        }

        self.active.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(PeerEvent::Ended(self.peer_name.clone())).await;
        info!("Peer session with {} closed", self.peer_name);
        // control and data sockets drop here
    }
}

/// Pick a data-channel port, retrying a bounded number of times before
/// letting the OS choose. Port collisions are expected with many sessions
/// on one host.
pub async fn bind_data_socket(ip: Ipv4Addr) -> io::Result<UdpSocket> {
    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    for _ in 0..BIND_ATTEMPTS {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let port = DATA_PORT_LOW + (seed % DATA_PORT_SPAN) as u16;

        match UdpSocket::bind((ip, port)).await {
            Ok(sock) => return Ok(sock),
            Err(e) => debug!("Data port {} unavailable: {:?}", port, e),
        }
    }

    UdpSocket::bind((ip, 0)).await
}

fn ipv4_of(addr: SocketAddr) -> io::Result<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(Error::new(ErrorKind::Unsupported, "peer channels are ipv4 only")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    // spin up both roles over loopback, return (listener side, connector side)
    async fn establish() -> (PeerSessionHandle, Receiver<PeerEvent>,
                             PeerSessionHandle, Receiver<PeerEvent>) {
        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        PeerSession::spawn_listener("bob".into(), listener, a_tx);

        let addr = PeerAddr { ip: Ipv4Addr::new(127, 0, 0, 1), port };
        PeerSession::spawn_connector("alice".into(), addr, b_tx);

        let a = match a_rx.recv().await.unwrap() {
            PeerEvent::Established(h) => h,
            other => panic!("expected established, got {:?}", other),
        };
        let b = match b_rx.recv().await.unwrap() {
            PeerEvent::Established(h) => h,
            other => panic!("expected established, got {:?}", other),
        };

        (a, a_rx, b, b_rx)
    }

    async fn wait_for_history(handle: &PeerSessionHandle, text: &str) {
        for _ in 0..100 {
            if handle.history().await.iter().any(|(t, _)| t == text) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("message {:?} never arrived", text);
    }

    #[tokio::test]
    async fn handshake_then_messages_flow_both_ways() {
        let (a, _a_rx, b, _b_rx) = establish().await;

        assert!(a.send("hello from the listener side".into()).await);
        assert!(b.send("hello from the connector side".into()).await);

        // receiver history fills as datagrams land
        wait_for_history(&b, "hello from the listener side").await;
        wait_for_history(&a, "hello from the connector side").await;

        // sender history records the outbound copy too
        wait_for_history(&a, "hello from the listener side").await;
    }

    #[tokio::test]
    async fn leave_ends_the_session_and_remote_sends_are_tolerated() {
        let (a, mut a_rx, b, _b_rx) = establish().await;

        a.leave();
        a.leave(); // idempotent

        match a_rx.recv().await.unwrap() {
            PeerEvent::Ended(name) => assert_eq!(name, "bob"),
            other => panic!("expected ended, got {:?}", other),
        }
        assert!(!a.is_active());

        // the other side keeps running and sending without raising
        assert!(b.is_active());
        assert!(b.send("anyone there?".into()).await);
        sleep(Duration::from_millis(50)).await;
        assert!(b.is_active());

        b.leave();
    }

    #[tokio::test]
    async fn bind_retries_settle_on_a_usable_socket() {
        let ip = Ipv4Addr::new(127, 0, 0, 1);
        let first = bind_data_socket(ip).await.unwrap();
        let second = bind_data_socket(ip).await.unwrap();

        assert_ne!(first.local_addr().unwrap().port(),
                   second.local_addr().unwrap().port());
    }
}
