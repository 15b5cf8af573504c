//! File-backed local cache: one JSON file per event plus flat text indexes.

use std::{
    cmp::Reverse,
    collections::HashSet,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde_json::to_writer;

use crate::{
    error::{Error, Result},
    event::{is_hex_of_len, Event},
    filter::Filter,
};

/// Persistent store for events and indexes rooted at `root`.
///
/// ```text
/// events/<id[0..2]>/<id[2..4]>/<id>.json
/// index/by-author/<pubkey>.txt
/// index/by-kind/<kind>.txt
/// index/by-tag/<letter>/<hex(value)>.txt
/// ```
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        for d in ["events", "index/by-author", "index/by-kind", "index/by-tag"] {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    /// Persist an event unless one with the same id is already stored.
    ///
    /// The event shape is checked first so malformed ids never reach the
    /// path layout. Only the call that creates the event file indexes it,
    /// so overlapping saves of one id leave a single index entry.
    pub fn save(&self, ev: &Event) -> Result<()> {
        ev.validate_shape()?;
        let path = self.event_path(&ev.id)?;
        if path.exists() {
            return Ok(());
        }
        let parent_dir = path
            .parent()
            .ok_or_else(|| Error::Cache(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent_dir)?;
        // Write to a temp file and link it in so readers never see partial JSON.
        let tmp = tempfile::NamedTempFile::new_in(parent_dir)?;
        to_writer(&tmp, ev)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => self.index_event(ev),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::Io(e.error)),
        }
    }

    /// Rebuild all indexes from the `events/` tree. Returns the number of
    /// events indexed.
    pub fn reindex(&self) -> Result<usize> {
        let index_dir = self.root.join("index");
        if index_dir.exists() {
            fs::remove_dir_all(&index_dir)?;
        }
        self.init()?;
        let mut count = 0;
        for ev in self.scan()? {
            self.index_event(&ev)?;
            count += 1;
        }
        Ok(count)
    }

    /// Answer a filter: intersect the index sets it names (or scan everything
    /// when it names none), apply the remaining constraints, sort newest
    /// first and truncate to `limit`.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        if filter.is_empty_limit() {
            return Ok(vec![]);
        }
        let mut sets: Vec<HashSet<String>> = vec![];
        if let Some(ids) = &filter.ids {
            // Only well-formed ids map onto the events/ layout.
            sets.push(
                ids.iter()
                    .filter(|id| is_hex_of_len(id, 64))
                    .cloned()
                    .collect(),
            );
        }
        if let Some(authors) = &filter.authors {
            sets.push(self.load_ids(Path::new("index/by-author"), authors)?);
        }
        if let Some(kinds) = &filter.kinds {
            let keys: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
            sets.push(self.load_ids(Path::new("index/by-kind"), &keys)?);
        }
        for (letter, values) in &filter.tags {
            if !indexable_tag(letter) {
                continue;
            }
            let keys: Vec<String> = values.iter().map(hex::encode).collect();
            sets.push(self.load_ids(&Path::new("index/by-tag").join(letter), &keys)?);
        }

        let candidates: Vec<Event> = match intersect(sets) {
            Some(ids) => ids
                .into_iter()
                .filter_map(|id| self.load_event(&id))
                .collect(),
            None => self.scan()?,
        };

        let mut events: Vec<Event> = candidates
            .into_iter()
            .filter(|ev| filter.matches(ev))
            .collect();
        events.sort_by_key(|e| (Reverse(e.created_at), e.id.clone()));
        // Keep only the newest version of a parameterized-replaceable event.
        let mut seen = HashSet::new();
        events.retain(|ev| match ev.d_tag() {
            Some(d) if (30000..40000).contains(&ev.kind) => {
                seen.insert(format!("{}:{}:{}", ev.pubkey, ev.kind, d))
            }
            _ => true,
        });
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Update lookup indexes for an event.
    fn index_event(&self, ev: &Event) -> Result<()> {
        self.append_index(Path::new("index/by-author"), &ev.pubkey, &ev.id)?;
        self.append_index(Path::new("index/by-kind"), &ev.kind.to_string(), &ev.id)?;
        for tag in &ev.tags {
            if let (Some(name), Some(value)) = (tag.name(), tag.value()) {
                if indexable_tag(name) {
                    let dir = Path::new("index/by-tag").join(name);
                    self.append_index(&dir, &hex::encode(value), &ev.id)?;
                }
            }
        }
        Ok(())
    }

    /// Append an event id to `prefix/name.txt`.
    fn append_index(&self, prefix: &Path, name: &str, id: &str) -> Result<()> {
        let path = self.root.join(prefix).join(format!("{name}.txt"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "{id}")?;
        Ok(())
    }

    /// Canonical path for an event id.
    fn event_path(&self, id: &str) -> Result<PathBuf> {
        match (id.get(0..2), id.get(2..4)) {
            (Some(sub1), Some(sub2)) => Ok(self
                .root
                .join("events")
                .join(sub1)
                .join(sub2)
                .join(format!("{id}.json"))),
            _ => Err(Error::InvalidEvent(format!("id too short: {id:?}"))),
        }
    }

    fn load_event(&self, id: &str) -> Option<Event> {
        let path = self.event_path(id).ok()?;
        let data = fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// Union of the ids listed under `prefix` for each key.
    fn load_ids(&self, prefix: &Path, keys: &[String]) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for key in keys {
            // Keys become file names; anything that could escape the index
            // directory simply has no entries.
            if key.is_empty()
                || key.contains(|c: char| c == '/' || c == '\\')
                || key.starts_with('.')
            {
                continue;
            }
            let path = self.root.join(prefix).join(format!("{key}.txt"));
            ids.extend(read_ids(&path)?);
        }
        Ok(ids)
    }

    /// Load every stored event.
    fn scan(&self) -> Result<Vec<Event>> {
        let mut events = vec![];
        let dir = self.root.join("events");
        if !dir.exists() {
            return Ok(events);
        }
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry.map_err(|e| Error::Cache(e.to_string()))?;
            let is_event = entry.path().extension().is_some_and(|ext| ext == "json");
            if entry.file_type().is_file() && is_event {
                let data = fs::read_to_string(entry.path())?;
                events.push(serde_json::from_str(&data)?);
            }
        }
        Ok(events)
    }
}

/// Only single ASCII-alphanumeric tag names are indexed (NIP-01 `#x` filters).
fn indexable_tag(name: &str) -> bool {
    name.len() == 1 && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Intersect all sets; `None` when there were no sets to begin with.
fn intersect(sets: Vec<HashSet<String>>) -> Option<HashSet<String>> {
    let mut iter = sets.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, |acc, s| acc.intersection(&s).cloned().collect()))
}

/// Read newline-separated ids from a text file.
fn read_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(Default::default());
    }
    let data = fs::read_to_string(path)?;
    Ok(data
        .lines()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect())
}
