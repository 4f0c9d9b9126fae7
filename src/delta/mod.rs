//! Copy/insert binary delta codec shared by the blob store's `deltify`/`applyDelta`
//! operations (§4.1). Format is Git's delta instruction stream: a leading pair of
//! varint-encoded (base size, result size), then a sequence of copy or literal-insert
//! instructions.

pub mod decode;
pub mod encode;
pub mod errors;
pub mod utils;

pub use decode::delta_decode;
pub use encode::DeltaDiff;
pub use errors::GitDeltaError;
