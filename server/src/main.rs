use std::sync::Arc;

use tokio::io;

use tracing::info;
use tracing_subscriber::fmt;
use tracing::Level;

use server::listener::ServerListener;
use server::registry::Registry;

const SERVER: &str = "127.0.0.1:65432";

#[tokio::main]
async fn main() -> io::Result<()> {
    fmt()
        .compact()
        .with_max_level(Level::INFO)
        .init();

    info!("Directory server starting.. {:?}", &SERVER);

    // directory state lives exactly as long as this process
    let registry = Arc::new(Registry::new());

    ServerListener::run(SERVER.to_owned(), registry).await
}
