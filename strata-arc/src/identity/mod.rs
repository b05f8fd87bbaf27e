//! Subject identity resolution
//!
//! Maps the identifiers carried by an incoming object onto a persisted
//! subject, creating, extending or merging subjects as needed.

pub mod fuzzy;
pub mod issuer;
pub mod person_name;
pub mod resolver;

pub use fuzzy::{ExtendedSoundex, FuzzyStr, Soundex};
pub use issuer::{issuers_match, Issuer};
pub use person_name::PersonName;
pub use resolver::{IdentityResolver, SubjectDemographics};
