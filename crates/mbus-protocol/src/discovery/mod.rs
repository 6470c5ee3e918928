/// Discovery: how buses across a context tree learn about each other.
///
/// Every bus announces itself to every context it can reach, answers
/// newcomers, and tells existing peers about its direct descendants so
/// that trees joined through popups still form a full mesh.

pub mod mesh;
pub mod types;

pub use mesh::{walk_descendants, Discovery};
pub use types::{
    DeregisterPayload, DiscoveryAction, DiscoveryEvent, DistributePayload, RegisterPayload,
};
