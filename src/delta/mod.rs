pub mod applier;
pub mod checksum;
pub mod matcher;
pub mod rolling;
pub mod signature;

pub use applier::{AssemblyOutcome, DeltaStats, FullDownloadReason, PatchAssembler, SliceCost};
pub use checksum::{FastHasher, FullHash, FullHasher};
pub use matcher::{DeltaMatcher, PatchSlice, SliceLocation};
pub use rolling::RollingChecksum;
pub use signature::{SignatureBuilder, SignatureChunk, SignatureFile, SignatureSummary};
