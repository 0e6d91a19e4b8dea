// Job Descriptor - the fields the supervisor reads out of an otherwise opaque JSON file

use serde::Deserialize;

/// Flags interpreted by the supervisor. Every other field is payload for the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct DescriptorFlags {
    /// Remove the descriptor file after a successful run
    #[serde(rename = "deleteMe", default)]
    pub delete_me: bool,
}

impl DescriptorFlags {
    /// Parse the flags from raw descriptor bytes.
    ///
    /// The descriptor must be a JSON object; a missing `deleteMe` means `false`.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
