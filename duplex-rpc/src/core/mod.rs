pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod handler;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod request;
