pub mod activity;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod events;
pub mod fanout;
pub mod input;
pub mod manager;
pub mod pty;
pub mod session;
pub mod surface;
pub mod target;
pub mod terminal;
pub mod transport;
