// src/core/formats.rs

//! The category hierarchy items are registered under: leaf executable
//! formats, their format groups, and the universal `All` category.

use crate::constants::ALL_FORMATS;

/// Format groups and the leaf formats they contain, in precedence order.
pub const FORMATS: &[(&str, &[&str])] = &[
    ("ELF", &["ELF32", "ELF64"]),
    ("Mach-O", &["Mach-O32", "Mach-O64", "Mach-Ou"]),
    ("MSDOS", &["MSDOS"]),
    ("PE", &[".NET", "PE32", "PE64"]),
];

/// Every leaf format, grouped in declaration order.
pub fn leaf_formats() -> Vec<&'static str> {
    FORMATS.iter().flat_map(|(_, leaves)| leaves.iter().copied()).collect()
}

/// Every format group name.
pub fn format_groups() -> Vec<&'static str> {
    FORMATS.iter().map(|(group, _)| *group).collect()
}

/// Returns the canonical spelling of a category name (case-insensitive match),
/// or `None` if the category is unknown.
pub fn canonical_category(category: &str) -> Option<&'static str> {
    let wanted = category.trim();
    if wanted.eq_ignore_ascii_case(ALL_FORMATS) {
        return Some(ALL_FORMATS);
    }
    format_groups()
        .into_iter()
        .chain(leaf_formats())
        .find(|c| c.eq_ignore_ascii_case(wanted))
}

/// Expands a category into the leaf formats it covers. Unknown categories
/// expand to nothing.
pub fn expand_formats(category: &str) -> Vec<&'static str> {
    let Some(category) = canonical_category(category) else {
        return Vec::new();
    };
    if category == ALL_FORMATS {
        return leaf_formats();
    }
    if let Some((_, leaves)) = FORMATS.iter().find(|(group, _)| *group == category) {
        return leaves.to_vec();
    }
    vec![category]
}

/// The group a leaf format belongs to (`PE32` -> `PE`).
pub fn format_group(format: &str) -> Option<&'static str> {
    FORMATS
        .iter()
        .find(|(group, leaves)| group.eq_ignore_ascii_case(format) || leaves.iter().any(|l| l.eq_ignore_ascii_case(format)))
        .map(|(group, _)| *group)
}

/// Registration tiers, most specific first: leaf formats, then format
/// groups, then the universal category. Iterating these in order and keeping
/// the first registration of a name is what makes specific entries win.
pub fn precedence_tiers() -> [Vec<&'static str>; 3] {
    [leaf_formats(), format_groups(), vec![ALL_FORMATS]]
}

/// Normalizes an item name for lookups: lowercase, with `_`, `.` and spaces
/// collapsed to `-`.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '.' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_all_lists_every_leaf() {
        let all = expand_formats("All");
        assert_eq!(all.len(), 9);
        assert!(all.contains(&"PE32"));
        assert!(all.contains(&"Mach-Ou"));
    }

    #[test]
    fn test_expand_group_and_leaf() {
        assert_eq!(expand_formats("pe"), vec![".NET", "PE32", "PE64"]);
        assert_eq!(expand_formats("ELF64"), vec!["ELF64"]);
        assert!(expand_formats("COFF").is_empty());
    }

    #[test]
    fn test_format_group_lookup() {
        assert_eq!(format_group("PE64"), Some("PE"));
        assert_eq!(format_group("MSDOS"), Some("MSDOS"));
        assert_eq!(format_group("wasm"), None);
    }

    #[test]
    fn test_tiers_are_most_specific_first() {
        let [leaves, groups, all] = precedence_tiers();
        assert!(leaves.contains(&"ELF32"));
        assert!(groups.contains(&"ELF"));
        assert_eq!(all, vec!["All"]);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("UPX_Packer"), "upx-packer");
        assert_eq!(normalize_name(" Rename.Section "), "rename-section");
    }
}
