//! Rendezvous accept loop with dedicated-port handoff.
//!
//! Each client first connects to the well-known address, receives a freshly
//! bound port as 2 little-endian bytes, and reconnects there. One session
//! per dedicated socket means one client's blocking read can never stall
//! another's command stream.

use std::net::SocketAddr;

use tokio::io::{self, AsyncWriteExt, Error, ErrorKind};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info};

use crate::registry::SharedRegistry;
use crate::session::UserSession;

// how long a client gets to reconnect on its dedicated port
const HANDOFF_WAIT: Duration = Duration::from_secs(30);

pub struct ServerListener;

impl ServerListener {
    /// Bind and serve forever on the current task.
    pub async fn run(addr: String, registry: SharedRegistry) -> io::Result<()> {
        let listener = TcpListener::bind(&addr).await?;
        info!("Directory server listening on {:?}", listener.local_addr()?);
        Self::accept_loop(listener, registry).await;
        Ok(())
    }

    /// Bind, then serve on a spawned task. Returns the bound address so
    /// callers on an ephemeral port can find it.
    pub async fn spawn(addr: String, registry: SharedRegistry) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!("Directory server listening on {:?}", local);

        let _h = tokio::spawn(async move {
            Self::accept_loop(listener, registry).await;
        });

        Ok(local)
    }

    async fn accept_loop(listener: TcpListener, registry: SharedRegistry) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New rendezvous connection from {:?}", addr);

                    let registry = registry.clone();
                    let _h = tokio::spawn(async move {
                        if let Err(e) = Self::handoff(stream, registry).await {
                            debug!("Dedicated port handoff failed: {:?}", e);
                        }
                    });
                },
                Err(e) => {
                    error!("Rendezvous accept failed, exiting: {:?}", e);
                    break;
                },
            }
        }
    }

    // Allocate the dedicated listener, tell the client its port, then wait
    // for the reconnect and hand the new socket to a session.
    async fn handoff(mut stream: TcpStream, registry: SharedRegistry) -> io::Result<()> {
        let ip = stream.local_addr()?.ip();
        let dedicated = TcpListener::bind((ip, 0)).await?;
        let port = dedicated.local_addr()?.port();

        stream.write_all(&port.to_le_bytes()).await?;
        drop(stream); // client reconnects on the dedicated port

        // a client that never reconnects must not pin this listener forever
        let (session_stream, addr) = timeout(HANDOFF_WAIT, dedicated.accept()).await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "client never reconnected"))??;
        info!("Client reconnected on dedicated port {} from {:?}", port, addr);

        UserSession::spawn(session_stream, registry);
        Ok(())
    }
}
