/// Receives relay flows from other nodes.
pub mod listener;
pub(crate) mod packet;
