pub mod constants;
pub mod error;
pub mod hash_id;
pub mod lengths;
pub mod piece;

pub use error::Error;
pub use hash_id::Id20;
pub use piece::Piece;
