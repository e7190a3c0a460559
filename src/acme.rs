pub(crate) mod client;
pub(crate) mod directory;
pub(crate) mod nonce;
pub(crate) mod order;
pub mod types;

pub use types::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, ChallengeType, Identifier,
    Order, OrderStatus, Problem,
};
