//! Visualizer
//!
//! Dumps JSON snapshots of the augmentation passes into a single file that is
//! rewritten incrementally, so a crashed run still leaves every snapshot
//! taken so far on disk.
//!

use crate::forest::*;
use crate::util::Level;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

/// anything that can contribute a snapshot to the visualizer
pub trait ForestVisualizer {
    /// take a snapshot, set `abbrev` to true to save space
    fn snapshot(&self, abbrev: bool) -> serde_json::Value;
}

/// merge a component snapshot into the combined one; shared keys must agree
pub fn snapshot_combine_values(value: &mut serde_json::Value, value_2: serde_json::Value) {
    let value = value.as_object_mut().expect("snapshot must be an object");
    let value_2 = value_2.as_object().expect("snapshot must be an object");
    for (key, entry) in value_2.iter() {
        match value.get(key) {
            None => {
                value.insert(key.clone(), entry.clone());
            }
            Some(existing) => {
                assert_eq!(existing, entry, "cannot combine snapshots: conflicting values under key {}", key);
            }
        }
    }
}

#[derive(Debug)]
pub struct Visualizer {
    /// save to file if applicable
    file: Option<File>,
    /// if waiting for the first snapshot
    empty_snapshot: bool,
    /// names of the snapshots
    pub snapshots: Vec<String>,
}

impl Visualizer {
    /// create a new visualizer with target filename; missing parent folders
    /// are created on the fly
    pub fn new(mut filepath: Option<String>) -> std::io::Result<Self> {
        if cfg!(feature = "disable_visualizer") {
            filepath = None; // do not open file
        }
        let mut file = match filepath {
            Some(filepath) => {
                if let Some(parent) = std::path::Path::new(&filepath).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(File::create(filepath)?)
            }
            None => None,
        };
        if let Some(file) = file.as_mut() {
            file.set_len(0)?; // truncate the file
            file.seek(SeekFrom::Start(0))?; // move the cursor to the front
            file.write_all(format!("{{\"format\":\"quadvirt\",\"version\":\"{}\"", env!("CARGO_PKG_VERSION")).as_bytes())?;
            file.write_all(b",\"snapshots\":[]}")?;
            file.sync_all()?;
        }
        Ok(Self {
            file,
            empty_snapshot: true,
            snapshots: vec![],
        })
    }

    pub fn incremental_save(&mut self, name: String, value: serde_json::Value) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            self.snapshots.push(name.clone());
            file.seek(SeekFrom::End(-2))?; // move the cursor before the ending ]}
            if !self.empty_snapshot {
                file.write_all(b",")?;
            }
            self.empty_snapshot = false;
            file.write_all(json!((name, value)).to_string().as_bytes())?;
            file.write_all(b"]}")?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// append a combined snapshot of several components, and update the file
    pub fn snapshot_combined(&mut self, name: String, components: Vec<&dyn ForestVisualizer>) -> std::io::Result<()> {
        if cfg!(feature = "disable_visualizer") {
            return Ok(());
        }
        let abbrev = true;
        let mut value = json!({});
        for component in components.iter() {
            snapshot_combine_values(&mut value, component.snapshot(abbrev));
        }
        self.incremental_save(name, value)?;
        Ok(())
    }

    /// append another snapshot of a single component, and update the file
    pub fn snapshot(&mut self, name: String, component: &impl ForestVisualizer) -> std::io::Result<()> {
        if cfg!(feature = "disable_visualizer") {
            return Ok(());
        }
        let abbrev = true;
        let value = component.snapshot(abbrev);
        self.incremental_save(name, value)?;
        Ok(())
    }
}

impl ForestVisualizer for Forest {
    fn snapshot(&self, abbrev: bool) -> serde_json::Value {
        let levels: Vec<Level> = self.quadrants.iter().map(|quadrant| quadrant.level).collect();
        json!({
            if abbrev { "l" } else { "levels" }: levels,
            if abbrev { "r" } else { "mpirank" }: self.mpirank,
        })
    }
}

const DEFAULT_VISUALIZE_DATA_FOLDER: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/visualize/data/");

// only used locally, because this is compile time directory
pub fn visualize_data_folder() -> String {
    DEFAULT_VISUALIZE_DATA_FOLDER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::*;

    #[test]
    fn combine_rejects_nothing_on_distinct_keys() {
        let mut value = json!({ "a": [1, 2] });
        snapshot_combine_values(&mut value, json!({ "b": 3 }));
        assert_eq!(value, json!({ "a": [1, 2], "b": 3 }));
    }

    #[test]
    fn forest_snapshot_lists_levels() {
        let forest = Forest::new(Dimension::Two, vec![Quadrant::new(2, 0), Quadrant::new(3, 0)], 1, 0);
        assert_eq!(forest.snapshot(false)["levels"], json!([2, 3]));
    }
}
