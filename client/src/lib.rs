// user prompts and command parsing
pub mod input;

// directory server connection + interactive command loop
pub mod controller;

// direct peer to peer channel
pub mod peer_session;
