//! Compiler assumptions stored alongside each code blob
//!
//! Both record kinds are indexed into the metadata array of their blob and
//! serialized with bincode. Dependencies must hold exactly; opt records are
//! scored and may reject a version.

mod dependency;
mod opt;

pub use dependency::{check_all, DepKey, DepType, DependencyRecord};
pub use opt::{insert_unique, total_score, OptRecord, ScoreContext};

use crate::{Error, Result};

/// Serialize a record list for a code blob section
pub fn encode_records<T: serde::Serialize>(records: &[T]) -> Result<Vec<u8>> {
    bincode::serialize(records).map_err(|e| Error::InternalError(format!("Failed to encode records: {}", e)))
}

/// Deserialize a record list from a code blob section
pub fn decode_records<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    bincode::deserialize(bytes).map_err(|e| Error::corruption(format!("Failed to decode records: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_section_codec() {
        let deps = vec![
            DependencyRecord::new(DepType::LeafType, vec![1]),
            DependencyRecord::new(DepType::UniqueConcreteMethod, vec![0, 2]),
        ];
        let bytes = encode_records(&deps).unwrap();
        let back: Vec<DependencyRecord> = decode_records(&bytes).unwrap();
        assert_eq!(back, deps);

        let empty: Vec<OptRecord> = decode_records(&[]).unwrap();
        assert!(empty.is_empty());
        assert!(decode_records::<OptRecord>(&[0xff; 3]).unwrap_err().is_corruption());
    }
}
