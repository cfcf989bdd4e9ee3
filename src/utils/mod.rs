//! Shared utility functions.

pub mod json_extraction;

pub use json_extraction::{
    analyze_json_structure, extract_json_object, extract_largest_json_object,
    find_matching_brace, JsonExtractionError, JsonStructureAnalysis,
};
