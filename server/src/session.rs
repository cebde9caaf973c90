//! Server-side protocol handler, one instance per connected client.
//!
//! A session owns its dedicated socket's two halves and runs the command
//! dispatch state machine over them. Frames relayed from other sessions
//! arrive on the session's mpsc channel and are written by the same select
//! loop that reads the client, so each socket has exactly one writer.

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use futures::SinkExt;
use tracing::{debug, info};

use protocol::{Command, CommandCodec, Frame, ProtocolError, Transfer};

use crate::registry::{AuthOutcome, OnlineUser, RegisterOutcome, RelayTx, SharedRegistry};

const RELAY_CHANNEL_SIZE: usize = 64;
const USER_LIST_SEP: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unauthenticated,
    SignedIn,
    Terminated, // absorbing
}

pub struct UserSession {
    state: SessionState,
    username: Option<String>, // Some once signed in
    fr: FramedRead<OwnedReadHalf, CommandCodec>,
    fw: FramedWrite<OwnedWriteHalf, CommandCodec>,
    registry: SharedRegistry,
    relay_tx: RelayTx,
    relay_rx: Receiver<Command>,
}

impl UserSession {
    pub fn spawn(stream: TcpStream, registry: SharedRegistry) {
        let (tcp_read, tcp_write) = stream.into_split();
        let (relay_tx, relay_rx) = mpsc::channel::<Command>(RELAY_CHANNEL_SIZE);

        let mut session = UserSession {
            state: SessionState::Unauthenticated,
            username: None,
            fr: FramedRead::new(tcp_read, CommandCodec),
            fw: FramedWrite::new(tcp_write, CommandCodec),
            registry,
            relay_tx,
            relay_rx,
        };

        let _h = tokio::spawn(async move {
            session.run().await;
        });
    }

    async fn run(&mut self) {
        loop {
            select! {
                frame = self.fr.next() => {
                    match frame {
                        Some(Ok(Frame::Command(cmd))) => {
                            match self.dispatch(cmd).await {
                                Ok(true) => (),
                                Ok(false) => break,
                                Err(e) => {
                                    debug!("Session closing on error: {:?}", e);
                                    break;
                                },
                            }
                        },
                        Some(Ok(Frame::Transfer(_))) => {
                            // clients never send bulk frames
                            debug!("Protocol violation: data-transfer frame from client");
                            break;
                        },
                        Some(Err(e)) => {
                            debug!("Protocol violation or read failure: {:?}", e);
                            break;
                        },
                        None => {
                            info!("Client closed connection");
                            break;
                        },
                    }
                },
                Some(cmd) = self.relay_rx.recv() => {
                    if let Err(e) = self.fw.send(cmd).await {
                        debug!("Relay write failed: {:?}", e);
                        break;
                    }
                },
            }
        }

        self.teardown().await;
    }

    // Returns Ok(true) to keep serving, Ok(false) to end the session.
    async fn dispatch(&mut self, cmd: Command) -> Result<bool, ProtocolError> {
        match (self.state, cmd) {
            (SessionState::Unauthenticated, Command::SignUp { username, password }) => {
                self.handle_sign_up(username, password).await?;
            },
            (SessionState::Unauthenticated, Command::SignIn { username, password }) => {
                self.handle_sign_in(username, password).await?;
            },
            (SessionState::SignedIn, Command::RequestUserList) => {
                let listing = self.registry.list_online().await.join(USER_LIST_SEP);
                self.fw.send(Transfer::final_chunk(listing.into_bytes())).await?;
            },
            (SessionState::SignedIn, Command::RequestPtpConnection { username }) => {
                self.handle_ptp_request(username).await?;
            },
            (SessionState::SignedIn, Command::DeclinePtpConnection { username }) => {
                let decline = Command::DeclinePtpConnection { username: self.name() };
                self.relay_to(&username, decline).await;
            },
            (SessionState::SignedIn, Command::AcceptPtpConnection { username, addr }) => {
                // addr is opaque transport between the two peers
                let accept = Command::AcceptPtpConnection { username: self.name(), addr };
                self.relay_to(&username, accept).await;
            },
            (SessionState::SignedIn, Command::SignOut { .. }) => {
                info!("User {} signing out", self.name());
                return Ok(false);
            },
            (state, cmd) => {
                debug!("Command {} invalid in state {:?}, closing session", cmd.code(), state);
                return Ok(false);
            },
        }

        Ok(true)
    }

    async fn handle_sign_up(&mut self, username: String, password: String)
                            -> Result<(), ProtocolError> {
        match self.registry.register(&username, &password).await {
            RegisterOutcome::UsernameTaken => {
                debug!("Sign-up declined, {} already registered", username);
                self.fw.send(Command::DeclineSignUp).await
            },
            RegisterOutcome::Accepted => {
                if self.mark_online(username).await {
                    self.fw.send(Command::AcceptSignIn).await
                } else {
                    self.fw.send(Command::DeclineSignUp).await
                }
            },
        }
    }

    async fn handle_sign_in(&mut self, username: String, password: String)
                            -> Result<(), ProtocolError> {
        match self.registry.authenticate(&username, &password).await {
            AuthOutcome::AlreadyOnline => {
                debug!("Sign-in refused, {} already online", username);
                self.fw.send(Command::AlreadyLoggedIn).await
            },
            AuthOutcome::Rejected => self.fw.send(Command::DeclineSignIn).await,
            AuthOutcome::Accepted => {
                // attach settles any race between two sign-ins for the name
                if self.mark_online(username).await {
                    self.fw.send(Command::AcceptSignIn).await
                } else {
                    self.fw.send(Command::AlreadyLoggedIn).await
                }
            },
        }
    }

    async fn mark_online(&mut self, username: String) -> bool {
        let user = OnlineUser {
            username: username.clone(),
            visible: true,
            busy: false,
            relay_tx: self.relay_tx.clone(),
        };

        if self.registry.attach(user).await {
            info!("User {} is online", username);
            self.username = Some(username);
            self.state = SessionState::SignedIn;
            true
        } else {
            false
        }
    }

    async fn handle_ptp_request(&mut self, target: String) -> Result<(), ProtocolError> {
        let request = Command::RelayPtpRequest { username: self.name() };

        match self.registry.lookup(&target).await {
            Some(tx) => {
                if tx.send(request).await.is_err() {
                    // target session died between lookup and send
                    debug!("Relay target {} went away", target);
                    self.fw.send(Command::UserNotAvailable).await?;
                }
            },
            None => self.fw.send(Command::UserNotAvailable).await?,
        }

        Ok(())
    }

    // forward to target's session if it is still online, otherwise drop
    async fn relay_to(&self, target: &str, cmd: Command) {
        if let Some(tx) = self.registry.lookup(target).await {
            if tx.send(cmd).await.is_err() {
                debug!("Relay to {} failed, session gone", target);
            }
        } else {
            debug!("Relay target {} not online, dropping", target);
        }
    }

    fn name(&self) -> String {
        self.username.clone().unwrap_or_default()
    }

    // Termination always releases the registry entry before the socket
    // drops, so no orphaned entry survives a dead session.
    async fn teardown(&mut self) {
        self.state = SessionState::Terminated;

        if let Some(name) = self.username.take() {
            self.registry.remove(&name).await;
            info!("Session for {} terminated", name);
        }
    }
}
