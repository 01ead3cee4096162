pub mod peer;
pub mod protocol;
pub mod transport;
