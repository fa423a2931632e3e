//! Turning the configured work-item list into work items.
//!
//! The list is decided once, at load time, into one of three shapes: a
//! comma-separated list of keys sharing the default buckets, a JSON array of
//! explicit source/destination pairs, or (when nothing is listed) the single
//! configured default item.

use std::collections::HashSet;

use serde::Deserialize;

use crate::error::EnhanceError;
use crate::state_machine::WorkItem;
use crate::storage::Location;

/// Marker prefixed onto derived destination file names.
pub const DEFAULT_MARKER: &str = "enhanced_";

/// Locations used when the list does not name them.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDefaults {
    pub source_bucket: String,
    pub dest_bucket: String,
    pub source_key: String,
    pub dest_key: String,
    pub marker: String,
}

impl Default for InputDefaults {
    fn default() -> Self {
        Self {
            source_bucket: "source-bucket".to_string(),
            dest_bucket: "dest-bucket".to_string(),
            source_key: "funny.png".to_string(),
            dest_key: "enhanced_funny.png".to_string(),
            marker: DEFAULT_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PairSpec {
    source_bucket: String,
    source_key: String,
    dest_bucket: String,
    dest_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    SimpleList(Vec<(Location, Location)>),
    ExplicitPairs(Vec<(Location, Location)>),
    SingleImplicit(Location, Location),
}

impl BatchInput {
    pub fn parse(raw: Option<&str>, defaults: &InputDefaults) -> Result<Self, EnhanceError> {
        let raw = raw.map(str::trim).unwrap_or_default();
        let input = if raw.starts_with('[') {
            let specs: Vec<PairSpec> = serde_json::from_str(raw)
                .map_err(|e| EnhanceError::BatchInput(format!("invalid JSON item list: {e}")))?;
            let pairs = specs
                .into_iter()
                .enumerate()
                .map(|(idx, spec)| explicit_pair(idx, spec))
                .collect::<Result<Vec<_>, _>>()?;
            BatchInput::ExplicitPairs(pairs)
        } else {
            let pairs = raw
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(|key| {
                    (
                        Location::new(&defaults.source_bucket, key),
                        Location::new(
                            &defaults.dest_bucket,
                            derive_destination_key(key, &defaults.marker),
                        ),
                    )
                })
                .collect();
            BatchInput::SimpleList(pairs)
        };

        if input.is_empty() {
            return Ok(BatchInput::SingleImplicit(
                Location::new(&defaults.source_bucket, &defaults.source_key),
                Location::new(&defaults.dest_bucket, &defaults.dest_key),
            ));
        }
        input.check_unique()?;
        Ok(input)
    }

    fn pairs(&self) -> &[(Location, Location)] {
        match self {
            BatchInput::SimpleList(pairs) | BatchInput::ExplicitPairs(pairs) => pairs,
            BatchInput::SingleImplicit(..) => &[],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BatchInput::SingleImplicit(..) => 1,
            _ => self.pairs().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Two entries with the same source and destination would share a journal.
    fn check_unique(&self) -> Result<(), EnhanceError> {
        let mut seen = HashSet::new();
        for (source, dest) in self.pairs() {
            if !seen.insert((source, dest)) {
                return Err(EnhanceError::BatchInput(format!(
                    "duplicate item {source} -> {dest}"
                )));
            }
        }
        Ok(())
    }

    pub fn into_work_items(self, directive: &str) -> Vec<WorkItem> {
        match self {
            BatchInput::SimpleList(pairs) | BatchInput::ExplicitPairs(pairs) => pairs
                .into_iter()
                .map(|(source, dest)| WorkItem::new(source, dest, directive))
                .collect(),
            BatchInput::SingleImplicit(source, dest) => vec![WorkItem::new(source, dest, directive)],
        }
    }
}

fn explicit_pair(idx: usize, spec: PairSpec) -> Result<(Location, Location), EnhanceError> {
    let fields = [
        ("source_bucket", &spec.source_bucket),
        ("source_key", &spec.source_key),
        ("dest_bucket", &spec.dest_bucket),
        ("dest_key", &spec.dest_key),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(EnhanceError::BatchInput(format!(
                "item {idx}: {name} must not be empty"
            )));
        }
    }
    Ok((
        Location::new(spec.source_bucket, spec.source_key),
        Location::new(spec.dest_bucket, spec.dest_key),
    ))
}

/// Prefix `marker` onto the final path segment of `key`, keeping its
/// directory: `dir/b.png` becomes `dir/enhanced_b.png`.
pub fn derive_destination_key(key: &str, marker: &str) -> String {
    match key.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/{marker}{name}"),
        None => format!("{marker}{key}"),
    }
}
