//! Signed-operation sync for treecrdt documents.
//!
//! Reconciles op-ref sets between peers with a rateless-IBLT codec, exchanges
//! signed op batches under the capability checks of `treecrdt-auth`, pushes
//! fresh ops to subscribers, and retries scope-undecidable ops parked in the
//! pending sidecar.

pub mod error;
pub mod messages;
pub mod peer;
pub mod riblt;
pub mod transport;

pub use error::SyncError;
pub use messages::{
    ErrorCode, ErrorMessage, FilterSpec, Hello, HelloAck, OpsBatch, Payload, RejectedFilter,
    RibltCodewords, RibltOutcome, RibltStatus, Subscribe, SubscribeAck, SyncMessage, Unsubscribe,
};
pub use peer::{SubscribeOptions, SubscriptionHandle, SyncOptions, SyncPeer};
pub use riblt::{CODEWORD_SIZE, CodedSymbol, Decoder, Encoder};
pub use transport::{MemoryTransport, Transport, memory_link, spawn_pump};
