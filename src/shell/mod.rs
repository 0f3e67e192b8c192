//! Interactive shell sessions over a pluggable transport

mod session;

pub use session::ShellSession;
