// Network layer module
// Protocol services: wall-clock (UDP datagrams), timeline and content-id
// (line-delimited JSON over persistent TCP connections)

pub mod cii;
pub mod connection;
pub mod messages;
pub mod timeline;
pub mod wallclock;

pub use connection::Connection;
