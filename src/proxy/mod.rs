pub mod allocator;
pub mod forwarder;
pub mod handler;
pub mod stream;
pub mod upstream;
