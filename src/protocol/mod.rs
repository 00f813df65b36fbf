//! Node RPC protocol
//!
//! Envelope encoding lives in [`codec`]; the method names every node
//! answers to live in [`methods`]. Framing of the encoded bytes is the
//! transport's job.

pub mod codec;
pub mod methods;

pub use codec::{
    CodecError, Outcome, PROTOCOL_VERSION, Params, RpcError, RpcRequest, RpcResponse, codes,
    decode, decode_request, encode, encode_response, is_compatible,
};
pub use methods::{HEALTHY, ReservedMethod};
