pub mod collab;
pub mod config;
pub mod handler;
pub mod session;
pub mod socket;
pub mod sweeper;
