// Enrichment steps run by the batch coordinator
//
// Each step looks at one park, asks its collaborator, and proposes field
// updates. The reconciler decides what sticks.

pub mod address;
pub mod brand;
pub mod parcel;
pub mod places;

pub use address::AddressStep;
pub use brand::{host_of, BrandInferenceStep, BrandMatch, MatchedOn};
pub use parcel::ParcelAreaStep;
pub use places::PlaceDetailsStep;
