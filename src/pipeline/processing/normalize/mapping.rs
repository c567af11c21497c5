use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use tracing::{debug, info};

use super::labels::normalize_label;
use crate::common::error::{Result, ScraperError};
use crate::config::MappingConfig;

/// Minor-category canonicalizations applied when no configuration replaces them.
pub const DEFAULT_MINOR_MAPPING: [(&str, &str); 9] = [
    ("Theft From The Person", "Theft From Person"),
    ("Theft From A Vehicle", "Theft From A Motor Vehicle"),
    ("Theft Or Unauth Taking Of A Motor Veh", "Theft Or Taking Of A Motor Vehicle"),
    ("Burglary In A Dwelling", "Domestic Burglary"),
    ("Burglary - Residential", "Domestic Burglary"),
    ("Burglary Non-Dwelling", "Burglary Business And Community"),
    ("Trafficking Of Drugs", "Drug Trafficking"),
    (
        "Race Or Religious Agg Public Fear",
        "Racially Or Religiously Aggravated Public Fear, Al",
    ),
    (
        "Other Offences Public Order",
        "Other Offences Against The State, Or Public Order",
    ),
];

/// Lookup from a normalized raw minor-category label to its canonical form.
///
/// Keys are stored normalized, so entries match regardless of the casing or
/// spacing they were written with. Labels without an entry pass through and
/// are remembered so they can be reported for curation.
#[derive(Debug, Clone, Default)]
pub struct CategoryMapping {
    entries: BTreeMap<String, String>,
    unmapped: BTreeSet<String>,
}

impl CategoryMapping {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut mapping = Self::default();
        mapping.extend(entries);
        mapping
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MINOR_MAPPING)
    }

    /// Defaults (unless replaced), then the external file, then inline entries.
    pub fn from_config(config: &MappingConfig) -> Result<Self> {
        let mut mapping = if config.replace_defaults {
            Self::default()
        } else {
            Self::with_defaults()
        };

        if let Some(path) = &config.path {
            let content = fs::read_to_string(path).map_err(|e| {
                ScraperError::Config(format!(
                    "Failed to read category mapping '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            let file_entries: BTreeMap<String, String> = toml::from_str(&content)?;
            info!(
                "Loaded {} category mapping entries from {}",
                file_entries.len(),
                path.display()
            );
            mapping.extend(file_entries);
        }

        mapping.extend(config.entries.clone());
        debug!("Category mapping has {} entries", mapping.len());
        Ok(mapping)
    }

    pub fn extend<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (raw, canonical) in entries {
            self.entries
                .insert(normalize_label(raw.as_ref()), canonical.into());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical label for an already-normalized label.
    pub fn apply(&mut self, label: &str) -> String {
        match self.entries.get(label) {
            Some(canonical) => canonical.clone(),
            None => {
                if !label.is_empty() && !self.unmapped.contains(label) {
                    self.unmapped.insert(label.to_string());
                }
                label.to_string()
            }
        }
    }

    /// Distinct labels seen by `apply` that had no entry, sorted.
    pub fn unmapped(&self) -> Vec<String> {
        self.unmapped.iter().cloned().collect()
    }
}
