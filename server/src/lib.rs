// directory state
pub mod registry;

// rendezvous accept + dedicated port handoff
pub mod listener;

// per client command dispatch
pub mod session;
