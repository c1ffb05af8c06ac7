/// a subscription filter; any subset of fields may be present
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<crate::ID>>,
    pub kinds: Option<Vec<crate::Kind>>,
    pub authors: Option<Vec<crate::PubKey>>,
    pub tags: Option<Vec<TagQuery>>,
    pub since: Option<crate::Timestamp>,
    pub until: Option<crate::Timestamp>,
    pub limit: Option<usize>,
}

/// a single-letter tag query: `#<key> -> values`
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TagQuery(pub String, pub Vec<String>);

impl TagQuery {
    pub fn key(&self) -> &str {
        self.0.as_str()
    }

    pub fn values(&self) -> &Vec<String> {
        &self.1
    }
}

impl serde::Serialize for Filter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut len = [
            self.ids.is_some(),
            self.authors.is_some(),
            self.kinds.is_some(),
            self.since.is_some(),
            self.until.is_some(),
            self.limit.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if let Some(ref tags) = self.tags {
            len += tags.len();
        }

        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(ref ids) = self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(ref authors) = self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(ref kinds) = self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(s) = self.since {
            map.serialize_entry("since", &s)?;
        }
        if let Some(u) = self.until {
            map.serialize_entry("until", &u)?;
        }
        if let Some(l) = self.limit {
            map.serialize_entry("limit", &l)?;
        }
        if let Some(ref tags) = self.tags {
            for tagq in tags {
                let key = format!("#{}", tagq.key());
                map.serialize_entry(&key, tagq.values())?;
            }
        }
        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct FilterVisitor;
        impl<'v> serde::de::Visitor<'v> for FilterVisitor {
            type Value = Filter;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a nostr filter object")
            }
            fn visit_map<M>(self, mut map: M) -> Result<Filter, M::Error>
            where
                M: serde::de::MapAccess<'v>,
            {
                let mut filter = Filter::default();

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "ids" => filter.ids = Some(map.next_value()?),
                        "authors" => filter.authors = Some(map.next_value()?),
                        "kinds" => filter.kinds = Some(map.next_value()?),
                        "since" => filter.since = Some(map.next_value()?),
                        "until" => filter.until = Some(map.next_value()?),
                        "limit" => filter.limit = Some(map.next_value()?),
                        k if k.starts_with('#') && k.len() > 1 => {
                            let tag = k.trim_start_matches('#').to_string();
                            let vals: Vec<String> = map.next_value()?;
                            filter
                                .tags
                                .get_or_insert_with(|| Vec::with_capacity(2))
                                .push(TagQuery(tag, vals));
                        }
                        _ => {
                            let _: serde::de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(filter)
            }
        }
        deserializer.deserialize_map(FilterVisitor)
    }
}

impl Filter {
    pub fn matches(&self, event: &crate::Event) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(ref authors) = self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }

        if let Some(ref tags) = self.tags {
            for TagQuery(tag_name, tag_values) in tags {
                if !event.tags.contains_any(tag_name, tag_values) {
                    return false;
                }
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        true
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "Filter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventTemplate, Kind, SecretKey, Tags, Timestamp};

    fn sample_event(sk: &SecretKey, kind: Kind, created_at: u32, p: Option<&str>) -> crate::Event {
        let tags = match p {
            Some(v) => Tags(vec![vec!["p".to_string(), v.to_string()]]),
            None => Tags::default(),
        };
        EventTemplate {
            created_at: Timestamp(created_at),
            kind,
            tags,
            content: "x".to_string(),
        }
        .finalize(sk)
    }

    #[test]
    fn test_serde_tag_queries() {
        let filter = Filter {
            kinds: Some(vec![Kind(24133)]),
            tags: Some(vec![TagQuery("p".to_string(), vec!["ab".to_string()])]),
            since: Some(Timestamp(1000)),
            limit: Some(5),
            ..Default::default()
        };

        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"#p\":[\"ab\"]"), "got {}", json);

        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, back);
    }

    #[test]
    fn test_matches() {
        let sk = SecretKey::generate();
        let pk_hex = sk.pubkey().to_hex();
        let event = sample_event(&sk, Kind(24133), 2000, Some(&pk_hex));

        let matching = Filter {
            kinds: Some(vec![Kind(24133)]),
            tags: Some(vec![TagQuery("p".to_string(), vec![pk_hex.clone()])]),
            since: Some(Timestamp(1500)),
            ..Default::default()
        };
        assert!(matching.matches(&event));

        let wrong_kind = Filter {
            kinds: Some(vec![Kind(1)]),
            ..Default::default()
        };
        assert!(!wrong_kind.matches(&event));

        let too_recent = Filter {
            since: Some(Timestamp(3000)),
            ..Default::default()
        };
        assert!(!too_recent.matches(&event));

        let expired = Filter {
            until: Some(Timestamp(1000)),
            ..Default::default()
        };
        assert!(!expired.matches(&event));
    }
}
