//! Name similarity scoring for column resolution

/// Minimum fuzzy score for a match to be accepted.
pub const ACCEPT_THRESHOLD: f64 = 0.7;

const PREFIXES: [&str; 4] = ["col_", "fld_", "is_", "has_"];
const SUFFIXES: [&str; 5] = ["_id", "_name", "_date", "_count", "_amount"];

/// Lowercase and strip one common prefix and one common suffix:
/// `is_active` -> `active`, `customer_id` -> `customer`.
pub fn clean_name(name: &str) -> String {
    let mut cleaned = name.trim().to_lowercase().replace(' ', "_");
    if let Some(prefix) = PREFIXES.iter().find(|p| cleaned.starts_with(*p) && cleaned.len() > p.len()) {
        cleaned = cleaned[prefix.len()..].to_string();
    }
    if let Some(suffix) = SUFFIXES.iter().find(|s| cleaned.ends_with(*s) && cleaned.len() > s.len()) {
        cleaned.truncate(cleaned.len() - suffix.len());
    }
    cleaned
}

/// Length in characters of the longest common substring.
pub fn longest_common_substring(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut previous = vec![0usize; b.len() + 1];
    let mut best = 0;
    for i in 1..=a.len() {
        let mut current = vec![0usize; b.len() + 1];
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                current[j] = previous[j - 1] + 1;
                best = best.max(current[j]);
            }
        }
        previous = current;
    }
    best
}

/// Similarity of a requested name and a schema identifier.
///
/// `1.0` only for identical strings, `0.9` when one contains the other
/// ignoring case, `0.85` when the cleaned names are equal, `0.8` when they
/// contain each other, otherwise `0.7 * lcs / max_len`. Symmetric in its
/// arguments.
pub fn fuzzy_score(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    if a_lower.contains(&b_lower) || b_lower.contains(&a_lower) {
        return 0.9;
    }

    let a_clean = clean_name(a);
    let b_clean = clean_name(b);
    if !a_clean.is_empty() && !b_clean.is_empty() {
        if a_clean == b_clean {
            return 0.85;
        }
        if a_clean.contains(&b_clean) || b_clean.contains(&a_clean) {
            return 0.8;
        }
    }

    let max_len = a_lower.chars().count().max(b_lower.chars().count());
    0.7 * longest_common_substring(&a_lower, &b_lower) as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("is_active"), "active");
        assert_eq!(clean_name("customer_id"), "customer");
        assert_eq!(clean_name("col_order_count"), "order");
        assert_eq!(clean_name("Email"), "email");
        assert_eq!(clean_name("_id"), "_id");
    }

    #[test]
    fn test_score_tiers() {
        assert_eq!(fuzzy_score("email", "email"), 1.0);
        assert_eq!(fuzzy_score("Email", "email"), 0.9);
        assert_eq!(fuzzy_score("name", "first_name"), 0.9);
        assert_eq!(fuzzy_score("customer", "customer_id"), 0.9);
        assert_eq!(fuzzy_score("is_active", "active_flag"), 0.8);
        assert_eq!(fuzzy_score("customer_name", "customer_id"), 0.85);
        assert!(fuzzy_score("phone", "email") < ACCEPT_THRESHOLD);
        assert_eq!(fuzzy_score("", "email"), 0.0);
    }

    #[test]
    fn test_only_identical_scores_one() {
        let names = ["client_id", "Client_ID", "clientid", "client", "id", "first_name", "firstname"];
        for a in names {
            for b in names {
                let score = fuzzy_score(a, b);
                assert_eq!(score == 1.0, a == b, "{} vs {} scored {}", a, b, score);
            }
        }
    }

    #[test]
    fn test_symmetric() {
        let pairs = [
            ("order_total", "total_amount"),
            ("email", "mail"),
            ("created_at", "creation"),
            ("phone", "phone_number"),
            ("abcde", "vwxyz"),
        ];
        for (a, b) in pairs {
            assert_eq!(fuzzy_score(a, b), fuzzy_score(b, a));
        }
    }

    #[test]
    fn test_lcs() {
        assert_eq!(longest_common_substring("order_total", "total_amount"), 5);
        assert_eq!(longest_common_substring("abc", "xyz"), 0);
    }
}
