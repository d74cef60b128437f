//! Generation file naming and store directory classification.
//!
//! Young generation files are `A{id:08x}.k2v`, old generation files are
//! `B{id:08x}.k2v`; ids grow monotonically within each family.

use std::fs;
use std::path::Path;

use k2v_common::error::{StoreError, StoreResult};

pub const GENERATION_EXT: &str = ".k2v";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Accepts writes, or is a frozen young generation awaiting compaction.
    Young,
    /// Produced by compaction or merge.
    Old,
}

impl Family {
    fn prefix(self) -> char {
        match self {
            Family::Young => 'A',
            Family::Old => 'B',
        }
    }
}

pub fn file_name(family: Family, id: u32) -> String {
    format!("{}{:08x}{}", family.prefix(), id, GENERATION_EXT)
}

/// Parse a generation file name. `None` for anything not shaped like one.
pub fn parse(name: &str) -> Option<(Family, u32)> {
    let stem = name.strip_suffix(GENERATION_EXT)?;
    let family = match stem.chars().next()? {
        'A' => Family::Young,
        'B' => Family::Old,
        _ => return None,
    };
    let digits = &stem[1..];
    if digits.len() != 8 {
        return None;
    }
    u32::from_str_radix(digits, 16).ok().map(|id| (family, id))
}

/// Generation files found in a store directory, oldest id first per family.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirLayout {
    pub young: Vec<u32>,
    pub old: Vec<u32>,
}

impl DirLayout {
    pub fn next_id(&self, family: Family) -> u32 {
        let ids = match family {
            Family::Young => &self.young,
            Family::Old => &self.old,
        };
        ids.last().map_or(1, |id| id + 1)
    }
}

/// Every `*.k2v` file name in `dir`. Other files are ignored.
pub fn data_files(dir: &Path) -> StoreResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(GENERATION_EXT) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Classify the generation files in `dir`. At most two files per family are
/// legal; anything else carrying the extension is a layout error.
pub fn scan(dir: &Path) -> StoreResult<DirLayout> {
    let mut layout = DirLayout::default();
    for name in data_files(dir)? {
        match parse(&name) {
            Some((Family::Young, id)) => layout.young.push(id),
            Some((Family::Old, id)) => layout.old.push(id),
            None => {
                return Err(StoreError::Layout(format!("unexpected file: {}", name)));
            }
        }
    }
    layout.young.sort_unstable();
    layout.old.sort_unstable();
    for (family, ids) in [(Family::Young, &layout.young), (Family::Old, &layout.old)] {
        if ids.len() > 2 {
            return Err(StoreError::Layout(format!(
                "unexpected file: {}",
                file_name(family, ids[2])
            )));
        }
    }
    Ok(layout)
}
