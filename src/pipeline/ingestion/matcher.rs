use regex::{Regex, RegexBuilder};

use crate::common::error::{Result, ScraperError};
use crate::common::types::DatasetCategory;

/// A compiled filename rule for one category
#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub category: DatasetCategory,
    pattern: Regex,
}

impl CategoryRule {
    /// Case-insensitive: anything containing the name fragment and ending in `.csv`.
    pub fn new(category: DatasetCategory) -> Result<Self> {
        let source = format!(r"^.*{}.*\.csv$", regex::escape(category.name_fragment.trim()));
        let pattern = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                ScraperError::Config(format!("bad filename rule for '{}': {e}", category.id))
            })?;
        Ok(Self { category, pattern })
    }

    pub fn matches(&self, filename: &str) -> bool {
        self.pattern.is_match(filename.trim())
    }
}

/// Classifies filenames into dataset categories.
///
/// Rules are evaluated in declaration order and the first match wins, so
/// overlapping fragments must be declared most-specific first.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    rules: Vec<CategoryRule>,
}

impl PatternMatcher {
    pub fn new(categories: &[DatasetCategory]) -> Result<Self> {
        let rules = categories
            .iter()
            .cloned()
            .map(CategoryRule::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn classify(&self, filename: &str) -> Option<&DatasetCategory> {
        self.rules
            .iter()
            .find(|rule| rule.matches(filename))
            .map(|rule| &rule.category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &DatasetCategory> {
        self.rules.iter().map(|r| &r.category)
    }
}
