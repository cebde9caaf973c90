use clap::Parser;

use tracing_subscriber::fmt;
use tracing::{info, Level};

use protocol::ProtocolError;

use client::controller::Controller;

const GREETINGS: &str = "$ Welcome to chat!";

#[derive(Parser, Debug)]
#[command(about = "Peer to peer chat client")]
struct Args {
    /// Username to sign up or sign in with (prompted for if omitted)
    username: Option<String>,

    /// Directory server address
    #[arg(long, default_value = "127.0.0.1")]
    ip_address: String,

    /// Directory server port
    #[arg(long, default_value_t = 65432)]
    port: u16,

    /// Sign in to an existing account instead of signing up
    #[arg(short, long)]
    sign_in: bool,

    /// Ask to be left out of user listings (advisory, client side only)
    #[arg(short = 'n', long)]
    invisible: bool,
}

#[tokio::main]
async fn main() -> Result<(), ProtocolError> {
    fmt()
        .compact() // use abbreviated log format
        .with_max_level(Level::INFO)
        .init(); // set as default subscriber

    let args = Args::parse();

    if args.invisible {
        info!("Invisible mode requested, listings are not filtered server side yet");
    }

    println!("{}", GREETINGS);

    let mut controller = Controller::setup(&args.ip_address, args.port).await?;

    if args.sign_in {
        controller.sign_in(args.username).await?;
    } else {
        controller.sign_up(args.username).await?;
    }

    controller.run().await
}
