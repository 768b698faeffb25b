pub mod backoff;
pub mod error;
pub mod identity;
pub mod wire;

pub use backoff::BackoffPolicy;
pub use error::RelayError;
pub use identity::{extract_access_token, ConnectionIdentity, IdentityError, Role};
pub use wire::{decode_frame, encode_frame, now_ms, Envelope, FrameError, DEFAULT_MAX_FRAME_BYTES};
