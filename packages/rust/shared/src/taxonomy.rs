//! Reference taxonomy: the read-only `Line → {Items}` mapping used to
//! validate Item proposals.
//!
//! Lookups normalize case and whitespace and always hand back the canonical
//! spelling from the taxonomy file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use crate::error::{LinetagError, Result};

/// Normalized lookup key: lowercase, inner whitespace collapsed.
fn lookup_key(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Read-only two-level taxonomy.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTaxonomy {
    /// Canonical Line → canonical Items.
    lines: BTreeMap<String, BTreeSet<String>>,
    /// Normalized Line → canonical Line.
    line_index: HashMap<String, String>,
    /// Normalized Item → every (canonical Line, canonical Item) owning it.
    item_index: HashMap<String, Vec<(String, String)>>,
}

impl ReferenceTaxonomy {
    /// Build a taxonomy from `Line → Items` pairs. Blank entries are skipped.
    pub fn from_map<I, L, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (L, Vec<S>)>,
        L: AsRef<str>,
        S: AsRef<str>,
    {
        let mut taxonomy = Self::default();
        for (line, items) in entries {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            let canonical_line = taxonomy
                .line_index
                .entry(lookup_key(line))
                .or_insert_with(|| line.to_string())
                .clone();
            let set = taxonomy.lines.entry(canonical_line.clone()).or_default();

            for item in items {
                let item = item.as_ref().trim();
                if item.is_empty() || !set.insert(item.to_string()) {
                    continue;
                }
                taxonomy
                    .item_index
                    .entry(lookup_key(item))
                    .or_default()
                    .push((canonical_line.clone(), item.to_string()));
            }
        }
        taxonomy
    }

    /// Parse a JSON object of the form `{"Line": ["Item", ...], ...}`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(json)
            .map_err(|e| LinetagError::parse(format!("invalid taxonomy JSON: {e}")))?;
        Ok(Self::from_map(raw))
    }

    /// Parse the grouped text format, one Line per row:
    /// `Line: Item one; Item two`.
    pub fn from_grouped_text(text: &str) -> Result<Self> {
        let mut entries: Vec<(String, Vec<String>)> = Vec::new();
        for (n, row) in text.lines().enumerate() {
            let row = row.trim();
            if row.is_empty() || row.starts_with('#') {
                continue;
            }
            let (line, items) = row.split_once(':').ok_or_else(|| {
                LinetagError::parse(format!("taxonomy row {} has no ':' separator", n + 1))
            })?;
            let items = items.split(';').map(|s| s.trim().to_string()).collect();
            entries.push((line.trim().to_string(), items));
        }
        Ok(Self::from_map(entries))
    }

    /// Load a taxonomy file. `.json` files are parsed as JSON, anything
    /// else as grouped text.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LinetagError::io(path, e))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let taxonomy = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_grouped_text(&content)?
        };

        if taxonomy.is_empty() {
            return Err(LinetagError::validation(format!(
                "taxonomy file {} defines no Lines",
                path.display()
            )));
        }

        tracing::debug!(
            path = %path.display(),
            lines = taxonomy.line_count(),
            items = taxonomy.item_count(),
            "loaded reference taxonomy"
        );
        Ok(taxonomy)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn item_count(&self) -> usize {
        self.lines.values().map(BTreeSet::len).sum()
    }

    /// Canonical spelling of a Line, if the taxonomy knows it.
    pub fn canonical_line(&self, line: &str) -> Option<&str> {
        self.line_index.get(&lookup_key(line)).map(String::as_str)
    }

    /// Canonical spelling of an Item within the given Line.
    pub fn canonical_item(&self, line: &str, item: &str) -> Option<&str> {
        let line = self.canonical_line(line)?;
        let key = lookup_key(item);
        self.item_index
            .get(&key)?
            .iter()
            .find(|(owner, _)| owner == line)
            .map(|(_, canonical)| canonical.as_str())
    }

    /// Every (Line, Item) pair whose Item matches, across all Lines.
    pub fn owners_of_item(&self, item: &str) -> Vec<(&str, &str)> {
        self.item_index
            .get(&lookup_key(item))
            .map(|owners| {
                owners
                    .iter()
                    .map(|(line, item)| (line.as_str(), item.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterate Lines and their Items in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.lines.iter().map(|(line, items)| (line.as_str(), items))
    }

    /// Render as grouped text for inclusion in a classification prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (line, items) in self.iter() {
            out.push_str(line);
            out.push_str(": ");
            let items: Vec<&str> = items.iter().map(String::as_str).collect();
            out.push_str(&items.join("; "));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReferenceTaxonomy {
        ReferenceTaxonomy::from_map([
            ("Pumps", vec!["Gear Pump", "Piston Pump"]),
            ("Valves", vec!["Ball Valve", "Check Valve"]),
            ("Seals", vec!["O-Ring", "Check Valve"]),
        ])
    }

    #[test]
    fn lookups_ignore_case_and_spacing() {
        let taxonomy = sample();
        assert_eq!(taxonomy.canonical_line("  pumps "), Some("Pumps"));
        assert_eq!(taxonomy.canonical_item("PUMPS", "gear   pump"), Some("Gear Pump"));
        assert_eq!(taxonomy.canonical_item("Valves", "Gear Pump"), None);
        assert_eq!(taxonomy.canonical_line("Motors"), None);
    }

    #[test]
    fn shared_items_report_every_owner() {
        let taxonomy = sample();
        let owners = taxonomy.owners_of_item("check valve");
        assert_eq!(owners.len(), 2);
        assert_eq!(taxonomy.owners_of_item("o-ring"), vec![("Seals", "O-Ring")]);
        assert!(taxonomy.owners_of_item("Flux Capacitor").is_empty());
    }

    #[test]
    fn counts_and_render() {
        let taxonomy = sample();
        assert_eq!(taxonomy.line_count(), 3);
        assert_eq!(taxonomy.item_count(), 6);
        let rendered = taxonomy.render();
        assert!(rendered.contains("Pumps: Gear Pump; Piston Pump"));
        assert_eq!(rendered.lines().count(), 3);
    }

    #[test]
    fn parses_json_and_grouped_text() {
        let json = ReferenceTaxonomy::from_json_str(r#"{"Pumps": ["Gear Pump", " "]}"#).unwrap();
        assert_eq!(json.item_count(), 1);

        let text = "# grouped\nPumps: Gear Pump; Piston Pump\n\nValves: Ball Valve\n";
        let grouped = ReferenceTaxonomy::from_grouped_text(text).unwrap();
        assert_eq!(grouped.line_count(), 2);
        assert_eq!(grouped.canonical_item("valves", "ball valve"), Some("Ball Valve"));

        assert!(ReferenceTaxonomy::from_grouped_text("no separator here").is_err());
        assert!(ReferenceTaxonomy::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn load_rejects_empty_file() {
        let path = std::env::temp_dir().join(format!("lt_taxonomy_{}.json", uuid::Uuid::now_v7()));
        std::fs::write(&path, "{}").unwrap();
        let err = ReferenceTaxonomy::load(&path).unwrap_err();
        assert!(err.to_string().contains("defines no Lines"));
        let _ = std::fs::remove_file(&path);
    }
}
