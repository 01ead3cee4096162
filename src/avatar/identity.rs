use serde::{Deserialize, Serialize};

/// Human-readable description of an avatar, sent separately from pose data
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvatarIdentity {
    pub display_name: String,
    pub skeleton_model_url: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl AvatarIdentity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }
}
