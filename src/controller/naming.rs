use crate::model::WorkOrder;
use std::collections::BTreeSet;

const BRANCH_PREFIX: &str = "council/";
const MAX_SLUG_LEN: usize = 40;

/// `council/<domains>-<base36 millis>`, domains sorted and de-duplicated.
pub fn source_branch(orders: &[WorkOrder], now_millis: u64) -> String {
    let domains: BTreeSet<String> = orders
        .iter()
        .map(|o| sanitize_branch_fragment(&o.domain))
        .filter(|d| !d.is_empty())
        .collect();
    let joined = domains.into_iter().collect::<Vec<_>>().join("-");
    let mut slug: String = joined.chars().take(MAX_SLUG_LEN).collect();
    slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        slug = "work".to_string();
    }
    format!("{}{}-{}", BRANCH_PREFIX, slug, to_base36(now_millis))
}

fn sanitize_branch_fragment(input: &str) -> String {
    let mut out = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
