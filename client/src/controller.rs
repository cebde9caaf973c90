//! Top-level client state machine: rendezvous with the directory server,
//! sign-up or sign-in, then an interactive loop interleaving server frames,
//! user commands and peer session events.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use futures::SinkExt;
use tracing::{debug, error, info};

use protocol::{Command, CommandCodec, Frame, PeerAddr, ProtocolError, Transfer, FIELD_LEN};

use crate::input::{self, Action, HELP};
use crate::peer_session::{PeerEvent, PeerSession, PeerSessionHandle};

const EVENT_CHANNEL_SIZE: usize = 64;
const USER_LIST_SEP: &str = ", ";

pub struct Controller {
    name: String,
    local_ip: Ipv4Addr,
    fr: FramedRead<OwnedReadHalf, CommandCodec>,
    fw: FramedWrite<OwnedWriteHalf, CommandCodec>,
    pending: HashSet<String>,  // inbound requests awaiting an answer
    outbound: HashSet<String>, // requests this client initiated
    sessions: HashMap<String, PeerSessionHandle>,
    events_tx: Sender<PeerEvent>,
    events_rx: Receiver<PeerEvent>,
}

impl Controller {
    /// Rendezvous: connect to the well-known address, learn the dedicated
    /// port, reconnect there.
    pub async fn setup(server_ip: &str, port: u16) -> Result<Controller, ProtocolError> {
        info!("Connecting to directory server {}:{}", server_ip, port);

        let mut stream = TcpStream::connect((server_ip, port)).await
            .map_err(|e| { error!("Unable to connect to server"); e })?;

        let mut port_buf = [0u8; 2];
        stream.read_exact(&mut port_buf).await?;
        let dedicated = u16::from_le_bytes(port_buf);
        drop(stream);

        info!("Handed off to dedicated port {}", dedicated);
        let stream = TcpStream::connect((server_ip, dedicated)).await?;

        let local_ip = match stream.local_addr()?.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return Err(std::io::Error::new(std::io::ErrorKind::Unsupported,
                                               "ipv4 server address required").into());
            },
        };

        let (tcp_read, tcp_write) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel::<PeerEvent>(EVENT_CHANNEL_SIZE);

        Ok(Controller {
            name: String::new(),
            local_ip,
            fr: FramedRead::new(tcp_read, CommandCodec),
            fw: FramedWrite::new(tcp_write, CommandCodec),
            pending: HashSet::new(),
            outbound: HashSet::new(),
            sessions: HashMap::new(),
            events_tx,
            events_rx,
        })
    }

    /// Sign-up loop; a declined username is a retry prompt, never fatal.
    pub async fn sign_up(&mut self, username: Option<String>) -> Result<(), ProtocolError> {
        let mut username = valid_or_prompt(username, "Please enter a username:")?;
        let password = input::read_field("Please enter a password:")?;

        loop {
            self.fw.send(Command::SignUp {
                username: username.clone(),
                password: password.clone(),
            }).await?;

            match self.next_command().await? {
                Command::AcceptSignIn => {
                    println!("You've successfully signed up to the server!");
                    self.name = username;
                    return Ok(());
                },
                Command::DeclineSignUp => {
                    println!("Sorry, that username was not accepted by the server");
                    username = input::read_field("Please enter a new username:")?;
                },
                other => debug!("Unexpected reply during sign-up: {:?}", other),
            }
        }
    }

    /// Sign-in loop; wrong credentials and already-online both re-prompt.
    pub async fn sign_in(&mut self, username: Option<String>) -> Result<(), ProtocolError> {
        let mut username = valid_or_prompt(username, "Please enter your username:")?;
        let mut password = input::read_field("Please enter your password:")?;

        loop {
            self.fw.send(Command::SignIn {
                username: username.clone(),
                password: password.clone(),
            }).await?;

            match self.next_command().await? {
                Command::AcceptSignIn => {
                    println!("You've successfully signed in to the server!");
                    self.name = username;
                    return Ok(());
                },
                Command::AlreadyLoggedIn => {
                    println!("This user is already logged in elsewhere");
                    username = input::read_field("Please enter your username:")?;
                    password = input::read_field("Please enter your password:")?;
                },
                Command::DeclineSignIn => {
                    println!("Sorry, that username and password combination was not accepted");
                    username = input::read_field("Please enter your username:")?;
                    password = input::read_field("Please enter your password:")?;
                },
                other => debug!("Unexpected reply during sign-in: {:?}", other),
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        println!("{}", HELP);
        let mut lines = input::spawn_stdin_reader();

        loop {
            select! {
                frame = self.fr.next() => {
                    match frame {
                        Some(Ok(frame)) => self.handle_server_frame(frame).await?,
                        Some(Err(e)) => {
                            error!("Server connection error: {:?}", e);
                            break;
                        },
                        None => {
                            println!(">>> Server closed the connection");
                            break;
                        },
                    }
                },
                Some(line) = lines.recv() => {
                    if !self.handle_action(input::parse(&line)).await? {
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_peer_event(event),
            }
        }

        // closing a session twice is safe, so a racing Ended event is fine
        for (_, handle) in self.sessions.drain() {
            handle.leave();
        }

        Ok(())
    }

    async fn handle_server_frame(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match frame {
            Frame::Transfer(transfer) => self.print_user_list(transfer),
            Frame::Command(Command::RelayPtpRequest { username }) => {
                println!(">>> {} requests a peer connection. \\accept {} or \\decline {}",
                         username, username, username);
                self.pending.insert(username);
            },
            Frame::Command(Command::AcceptPtpConnection { username, addr }) => {
                if self.outbound.remove(&username) {
                    println!(">>> {} accepted your request, connecting..", username);
                    PeerSession::spawn_connector(username, addr, self.events_tx.clone());
                } else {
                    debug!("Accept from {} without a matching request", username);
                }
            },
            Frame::Command(Command::DeclinePtpConnection { username }) => {
                self.outbound.remove(&username);
                println!(">>> {} declined your request", username);
            },
            Frame::Command(Command::UserNotAvailable) => {
                println!(">>> That user is not available, try \\users");
            },
            Frame::Command(other) => debug!("Unexpected server frame: {:?}", other),
        }

        Ok(())
    }

    async fn handle_action(&mut self, action: Action) -> Result<bool, ProtocolError> {
        match action {
            Action::Users => self.fw.send(Command::RequestUserList).await?,
            Action::Connect(name) => {
                if name == self.name {
                    println!(">>> That's you");
                } else if name.len() > FIELD_LEN {
                    println!(">>> Usernames are at most {} bytes", FIELD_LEN);
                } else {
                    self.outbound.insert(name.clone());
                    self.fw.send(Command::RequestPtpConnection { username: name }).await?;
                    println!(">>> Request sent. You will be notified of their response");
                }
            },
            Action::Accept(name) => {
                if self.pending.remove(&name) {
                    self.accept_request(name).await?;
                } else {
                    println!(">>> No pending request from {}", name);
                }
            },
            Action::Decline(name) => {
                if self.pending.remove(&name) {
                    self.fw.send(Command::DeclinePtpConnection { username: name }).await?;
                } else {
                    println!(">>> No pending request from {}", name);
                }
            },
            Action::Msg(name, text) => {
                match self.sessions.get(&name) {
                    Some(handle) => {
                        if !handle.send(text).await {
                            println!(">>> Session with {} has closed", name);
                        }
                    },
                    None => println!(">>> No active chat with {}, try \\connect {}", name, name),
                }
            },
            Action::Leave(name) => {
                match self.sessions.remove(&name) {
                    Some(handle) => handle.leave(),
                    None => println!(">>> No active chat with {}", name),
                }
            },
            Action::Quit => {
                info!("Session terminated by user..");
                self.fw.send(Command::SignOut { username: self.name.clone() }).await?;
                return Ok(false);
            },
            Action::Help => println!("{}", HELP),
            Action::Noop => (),
        }

        Ok(true)
    }

    // advertise a fresh control listener, then wait for the peer to dial it
    async fn accept_request(&mut self, name: String) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind((self.local_ip, 0)).await?;
        let port = listener.local_addr()?.port();

        PeerSession::spawn_listener(name.clone(), listener, self.events_tx.clone());

        self.fw.send(Command::AcceptPtpConnection {
            username: name,
            addr: PeerAddr { ip: self.local_ip, port },
        }).await?;

        println!(">>> Request accepted. The chat opens once they connect");
        Ok(())
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Established(handle) => {
                println!(">>> Chat with {} established. \\msg {} <text> to talk",
                         handle.peer_name, handle.peer_name);
                self.sessions.insert(handle.peer_name.clone(), handle);
            },
            PeerEvent::Ended(name) => {
                if self.sessions.remove(&name).is_some() {
                    println!(">>> Chat with {} closed", name);
                }
            },
        }
    }

    fn print_user_list(&self, transfer: Transfer) {
        let listing = String::from_utf8_lossy(&transfer.payload);

        // self-exclusion is presentation only, the wire payload is unfiltered
        let mut i = 1;
        for username in listing.split(USER_LIST_SEP) {
            if username.is_empty() || username == self.name {
                continue;
            }
            println!("({}) {}", i, username);
            i += 1;
        }

        if i == 1 {
            println!("No visible users");
        }
    }

    async fn next_command(&mut self) -> Result<Command, ProtocolError> {
        match self.fr.next().await {
            Some(Ok(Frame::Command(cmd))) => Ok(cmd),
            Some(Ok(Frame::Transfer(_))) => {
                Err(std::io::Error::new(std::io::ErrorKind::InvalidData,
                                        "expected a command frame").into())
            },
            Some(Err(e)) => Err(e),
            None => Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof,
                                            "server closed the connection").into()),
        }
    }
}

fn valid_or_prompt(username: Option<String>, prompt: &str) -> Result<String, ProtocolError> {
    match username {
        Some(name) if !name.is_empty() && name.len() <= FIELD_LEN => Ok(name),
        Some(_) => {
            println!("Usernames must be 1 to {} bytes", FIELD_LEN);
            Ok(input::read_field(prompt)?)
        },
        None => Ok(input::read_field(prompt)?),
    }
}
