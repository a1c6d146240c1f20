//! Local port bookkeeping
//!
//! Two concerns live here: handing out unique proxy ports from a configured
//! range ([`allocator`]), and recording which (ip, port, protocol) triples
//! are held open on behalf of a service so that conflicting claims are
//! detected instead of silently fought over ([`claims`]).

pub mod allocator;
pub mod claims;

pub use allocator::{PortAllocator, PortRange, RangePortAllocator};
pub use claims::PortClaimRegistry;
