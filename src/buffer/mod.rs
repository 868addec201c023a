//! Pooled buffers and the streaming codecs built on top of them: the
//! allocation-reuse layer that sits between the wire and `Message`.

pub mod deflate;
pub mod pool;
pub mod recv;
pub mod send;

pub use deflate::DeflateContext;
pub use pool::{Segment, SegmentChain, SegmentPool};
pub use recv::RecvBuffer;
pub use send::{Framed, SendBuffer};
