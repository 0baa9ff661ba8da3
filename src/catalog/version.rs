//! Dotted-numeric version comparison.
//!
//! Missing trailing components count as `0` (`2.0 == 2.0.0`), components are
//! compared left to right numerically and the first difference decides. A
//! component with a non-numeric tail (`3-beta`) contributes its leading digits.

use std::cmp::Ordering;

/// Parsed dotted-numeric version.
#[derive(Debug, Clone)]
pub struct DottedVersion {
    parts: Vec<u64>,
}

impl DottedVersion {
    /// `"v1.2.3"`, `"1.28.1"`, `"8.0"` all parse; a leading `v` is ignored.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let s = s.strip_prefix('v').or_else(|| s.strip_prefix('V')).unwrap_or(s);
        let parts = s
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect();
        Self { parts }
    }

    fn component(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            match self.component(idx).cmp(&other.component(idx)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DottedVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DottedVersion {}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    DottedVersion::parse(a).cmp(&DottedVersion::parse(b))
}

/// Sort newest first.
pub fn sort_descending<T>(items: &mut [T], version_of: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| compare_versions(version_of(b), version_of(a)));
}
