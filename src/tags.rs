/// a single tag (array of strings)
pub type Tag = Vec<String>;

/// ordered collection of event tags
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tags(pub Vec<Tag>);

impl Tags {
    /// a single tag pointing at a public key: `["p", "<hex>"]`
    pub fn pointing_at(pubkey: &crate::PubKey) -> Self {
        Self(vec![vec!["p".to_string(), pubkey.to_hex()]])
    }

    /// find the first tag with the given key that has at least one value
    pub fn find(&self, key: &str) -> Option<&Tag> {
        self.0.iter().find(|tag| tag.len() >= 2 && tag[0] == key)
    }

    /// check if any tag with the given key carries one of the given values
    pub fn contains_any(&self, tag_name: &str, values: &[String]) -> bool {
        for tag in &self.0 {
            if tag.len() < 2 || tag[0] != tag_name {
                continue;
            }
            if values.contains(&tag[1]) {
                return true;
            }
        }
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }
}

impl From<Vec<Tag>> for Tags {
    fn from(tags: Vec<Tag>) -> Self {
        Self(tags)
    }
}

impl std::fmt::Display for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{json}"),
            Err(err) => write!(f, "Tags({err})"),
        }
    }
}
