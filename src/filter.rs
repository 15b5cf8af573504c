//! NIP-01 subscription filters.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// NIP-01 filter shared by the local cache, upstream subscriptions and
/// the HTTP surface. `None` / empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints keyed by the single tag letter (without `#`).
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a filter from the JSON object carried by a `REQ` message.
    /// Unknown keys and malformed entries are skipped.
    pub fn from_value(val: &Value) -> Self {
        let strings = |key: &str| {
            val.get(key).and_then(|v| v.as_array()).map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
        };
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().and_then(|u| u32::try_from(u).ok()))
                .collect()
        });
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                let Some(letter) = key.strip_prefix('#') else {
                    continue;
                };
                if letter.chars().count() != 1 {
                    continue;
                }
                if let Some(arr) = v.as_array() {
                    let values: Vec<String> = arr
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect();
                    tags.insert(letter.to_string(), values);
                }
            }
        }
        Filter {
            ids: strings("ids"),
            authors: strings("authors"),
            kinds,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        }
    }

    /// Render the filter as the JSON object sent upstream in `REQ`.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let str_array =
            |items: &[String]| Value::Array(items.iter().cloned().map(Value::String).collect());
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), str_array(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), str_array(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (letter, values) in &self.tags {
            map.insert(format!("#{letter}"), str_array(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        map
    }

    /// Whether `ev` satisfies every constraint except `limit`.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|s| ev.created_at < s) {
            return false;
        }
        if self.until.is_some_and(|u| ev.created_at > u) {
            return false;
        }
        self.tags.iter().all(|(letter, values)| {
            ev.tags.iter().any(|tag| {
                tag.name() == Some(letter.as_str())
                    && tag.value().is_some_and(|v| values.iter().any(|want| want == v))
            })
        })
    }

    /// True when the filter can never match because `limit` is zero.
    pub fn is_empty_limit(&self) -> bool {
        self.limit == Some(0)
    }
}
