//! Logical group names.
//!
//! A folder `<scan_dir>/2024/03` belongs to the period group `2024年03月`.
//! A file whose name mentions a province-level region (`…省`, `…自治区`,
//! `…市`) additionally belongs to the region group `<region>数据源`.
//! When a group's knowledge base is full, overflow goes to numbered slots
//! (`2024年03月-2`, `2024年03月-3`, …).

use once_cell::sync::Lazy;
use regex::Regex;

static REGION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(.+?)(?:省|自治区|市)").expect("region pattern is valid")
});

/// Period label for a `<year>/<month>` folder.
pub fn period_label(year: &str, month: &str) -> String {
    format!("{}年{}月", year, month)
}

/// Region named in `file_name`, if any.
pub fn extract_region(file_name: &str) -> Option<String> {
    REGION
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty())
}

pub fn region_group(region: &str) -> String {
    format!("{}数据源", region)
}

/// Name of the `slot`-th knowledge base of a group (1-based).
pub fn slot_name(base: &str, slot: usize) -> String {
    if slot <= 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, slot)
    }
}

/// File name presented to the remote service.
pub fn remote_file_name(group: &str, file_name: &str) -> String {
    format!("{}_{}", group, file_name)
}

/// File name of the merged document for a period folder.
pub fn merged_file_name(year: &str, month: &str) -> String {
    format!("{}年{}月分析报告.txt", year, month)
}
