//! ohtab core library: conversation controller, realtime channel, envelopes
//! and configuration shared by the CLI and any other host.

pub mod channel;
pub mod config;
pub mod conversation;
pub mod envelope;
pub mod init;
pub mod translate;
